// 聊天入口：安全检查 -> 精品工具 -> 意图分析 -> 代理分支 -> 工件提取。
use crate::api::errors::error_response;
use crate::core::schemas::{ArtifactPayload, ChatRequest, ChatResponse, HistoryMessage};
use crate::core::state::AppState;
use crate::services::agents::AgentReply;
use crate::services::artifacts::{categorize, content_hash, StoredArtifact};
use crate::services::{artifacts, boutique, intent, mcp, safety};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Json, Router};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

const STREAM_QUEUE_SIZE: usize = 64;
const FALLBACK_REPLY: &str =
    "Noah is experiencing technical difficulties right now. Please try again in a moment.";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/chat", post(chat).get(health))
}

/// 健康检查：返回各任务模型配置情况与存储后端。
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let configured = |task: &str| {
        state
            .config
            .model_for_task(task)
            .map(crate::services::llm::is_llm_configured)
            .unwrap_or(false)
    };
    Json(json!({
        "data": {
            "status": "ok",
            "providers": {
                "chat": configured("chat"),
                "research": configured("research"),
                "build": configured("build"),
            },
            "storage": state.storage.backend_name(),
            "rag_enabled": state.config.knowledge.rag_enabled,
        }
    }))
}

async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.message.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message is required");
    }
    let wants_stream = request.stream || accepts_event_stream(&headers);
    if wants_stream {
        chat_stream(state, request).await
    } else {
        match process_chat(&state, &request, None).await {
            Ok(response) => Json(response).into_response(),
            Err(response) => response,
        }
    }
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("text/event-stream"))
        .unwrap_or(false)
}

/// 流式响应：status/delta/artifact/done 事件序列。
async fn chat_stream(state: Arc<AppState>, request: ChatRequest) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(STREAM_QUEUE_SIZE);
    tokio::spawn(async move {
        let delta_tx = tx.clone();
        let result = process_chat(&state, &request, Some(delta_tx)).await;
        match result {
            Ok(response) => {
                if let Some(artifact) = &response.artifact {
                    let event = Event::default()
                        .event("artifact")
                        .json_data(artifact)
                        .unwrap_or_default();
                    let _ = tx.send(event).await;
                }
                let event = Event::default()
                    .event("done")
                    .json_data(&response)
                    .unwrap_or_default();
                let _ = tx.send(event).await;
            }
            Err(_) => {
                let event = Event::default()
                    .event("error")
                    .json_data(json!({ "message": FALLBACK_REPLY }))
                    .unwrap_or_default();
                let _ = tx.send(event).await;
            }
        }
    });
    let stream = ReceiverStream::new(rx).map(Ok::<Event, std::convert::Infallible>);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
        .into_response()
}

async fn send_status(tx: &Option<mpsc::Sender<Event>>, stage: &str) {
    if let Some(tx) = tx {
        let event = Event::default()
            .event("status")
            .json_data(json!({ "stage": stage }))
            .unwrap_or_default();
        let _ = tx.send(event).await;
    }
}

/// 主管线。失败返回错误 Response，流式调用方转成 error 事件。
async fn process_chat(
    state: &Arc<AppState>,
    request: &ChatRequest,
    stream_tx: Option<mpsc::Sender<Event>>,
) -> Result<ChatResponse, Response> {
    let started = Instant::now();
    let message = request.message.trim();

    // 指纹换会话，失败时降级为临时会话继续服务
    let fingerprint = request
        .fingerprint
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or("anonymous");
    let environment = request.environment.as_deref().unwrap_or("unknown");
    let session_id = match request
        .session_id
        .as_deref()
        .filter(|value| !value.trim().is_empty())
    {
        Some(existing) => existing.to_string(),
        None => match state.analytics.ensure_session(fingerprint, environment) {
            Ok(session) => session.session_id,
            Err(err) => {
                warn!("创建会话失败，使用临时会话: {err}");
                format!("sess_{}", uuid::Uuid::new_v4().simple())
            }
        },
    };
    let conversation_id = match state.analytics.start_conversation(&session_id) {
        Ok(conversation) => Some(conversation.conversation_id),
        Err(err) => {
            warn!("创建对话失败: {err}");
            None
        }
    };
    if let Some(conversation_id) = &conversation_id {
        state
            .analytics
            .log_message(conversation_id, "user", message, 0.0, "user");
    }

    // 安全过滤先于一切生成
    if state.config.safety.enabled {
        if let Some(verdict) = safety::check(message) {
            warn!(
                "安全过滤命中: {} -> {:?}",
                verdict.category.as_str(),
                verdict.action
            );
            let interface_locked = verdict.action == safety::SafetyAction::InterfaceLock;
            let response = ChatResponse {
                session_id,
                reply: String::new(),
                agent: "safety".to_string(),
                artifact: None,
                file_operation_id: None,
                elapsed_ms: elapsed_ms(started),
                usage: None,
                radio_silence: !interface_locked,
                interface_locked,
            };
            return Ok(response);
        }
    }

    // 精品工具快路径：不过 LLM
    if let Some(found) = boutique::detect(message) {
        send_status(&stream_tx, "boutique").await;
        let artifact = register_artifact(
            state,
            &session_id,
            conversation_id.as_deref(),
            &found.title,
            &found.content,
            "boutique",
            elapsed_ms(started),
        );
        let file_operation_id = propose_save(state, &session_id, &artifact);
        let reply = format!("Here's your {}. Ready to use.", found.title);
        finish_logging(state, &conversation_id, &reply, started, "boutique");
        return Ok(ChatResponse {
            session_id,
            reply,
            agent: "boutique".to_string(),
            artifact: Some(artifact),
            file_operation_id,
            elapsed_ms: elapsed_ms(started),
            usage: None,
            radio_silence: false,
            interface_locked: false,
        });
    }

    let analysis = intent::analyze_request(message);

    let reply = if analysis.is_ambiguous {
        send_status(&stream_tx, "clarifying").await;
        run_agent(state.agents.clarify(&request.history, message).await)
    } else if analysis.needs_building {
        let research_context = if analysis.needs_research {
            send_status(&stream_tx, "researching").await;
            state
                .agents
                .research(message)
                .await
                .map(|reply| reply.content)
        } else {
            None
        };
        send_status(&stream_tx, "building").await;
        run_agent(
            state
                .agents
                .build(message, research_context.as_deref())
                .await,
        )
    } else if analysis.needs_research {
        send_status(&stream_tx, "researching").await;
        match state.agents.research(message).await {
            Some(reply) => reply,
            None => fallback_reply("wanderer"),
        }
    } else {
        send_status(&stream_tx, "thinking").await;
        let history = recalled_history(state, &session_id, &request.history).await;
        match &stream_tx {
            Some(tx) => {
                let tx = tx.clone();
                let result = state
                    .agents
                    .converse_stream(&history, message, move |delta| {
                        let tx = tx.clone();
                        async move {
                            let event = Event::default()
                                .event("delta")
                                .json_data(json!({ "text": delta }))
                                .unwrap_or_default();
                            let _ = tx.send(event).await;
                            Ok(())
                        }
                    })
                    .await;
                run_agent(result)
            }
            None => run_agent(state.agents.converse(&history, message).await),
        }
    };

    // 构建分支的输出可能携带工件
    let mut artifact_payload = None;
    let mut file_operation_id = None;
    let mut final_reply = reply.content.clone();
    if reply.agent == "tinkerer" {
        match artifacts::parse_structured_response(&reply.content) {
            Some(parsed) => {
                let artifact = register_artifact(
                    state,
                    &session_id,
                    conversation_id.as_deref(),
                    &parsed.title,
                    &parsed.content,
                    reply.agent,
                    elapsed_ms(started),
                );
                file_operation_id = propose_save(state, &session_id, &artifact);
                final_reply = format!("I built {} for you. Take a look!", parsed.title);
                artifact_payload = Some(artifact);
            }
            None => {
                warn!("构建输出缺少 TITLE/TOOL 结构，按纯文本返回");
            }
        }
    }

    finish_logging(state, &conversation_id, &final_reply, started, reply.agent);
    record_session_memory(state, &session_id, message);

    Ok(ChatResponse {
        session_id,
        reply: final_reply,
        agent: reply.agent.to_string(),
        artifact: artifact_payload,
        file_operation_id,
        elapsed_ms: elapsed_ms(started),
        usage: reply.usage,
        radio_silence: false,
        interface_locked: false,
    })
}

fn run_agent(result: anyhow::Result<AgentReply>) -> AgentReply {
    match result {
        Ok(reply) if !reply.content.trim().is_empty() => reply,
        Ok(reply) => fallback_reply(reply.agent),
        Err(err) => {
            warn!("代理调用失败: {err}");
            fallback_reply("noah")
        }
    }
}

fn fallback_reply(agent: &'static str) -> AgentReply {
    AgentReply {
        agent,
        content: FALLBACK_REPLY.to_string(),
        usage: None,
    }
}

fn register_artifact(
    state: &Arc<AppState>,
    session_id: &str,
    conversation_id: Option<&str>,
    title: &str,
    content: &str,
    agent: &str,
    generation_ms: f64,
) -> ArtifactPayload {
    let artifact_id = format!("tool_{}", uuid::Uuid::new_v4().simple());
    let hash = content_hash(content);
    let category = categorize(title, content).to_string();
    state.artifacts.save(
        session_id,
        StoredArtifact {
            artifact_id: artifact_id.clone(),
            title: title.to_string(),
            content: content.to_string(),
            category: category.clone(),
            content_hash: hash.clone(),
            agent: agent.to_string(),
            created_at: Utc::now().timestamp_millis() as f64 / 1000.0,
        },
    );
    state.analytics.log_generated_tool(
        &artifact_id,
        session_id,
        conversation_id,
        title,
        content,
        &hash,
        &category,
        agent,
        generation_ms,
    );
    ArtifactPayload {
        artifact_id,
        title: title.to_string(),
        content: content.to_string(),
        category,
        content_hash: hash,
    }
}

/// 为工件登记一次待审批保存，失败不阻断回复。
fn propose_save(
    state: &Arc<AppState>,
    session_id: &str,
    artifact: &ArtifactPayload,
) -> Option<String> {
    let filename = format!("tools/{}.html", artifact.artifact_id);
    match state
        .file_ops
        .propose(session_id, &filename, &artifact.content)
    {
        Ok(operation_id) => Some(operation_id),
        Err(err) => {
            warn!("登记文件操作失败: {err}");
            None
        }
    }
}

fn finish_logging(
    state: &Arc<AppState>,
    conversation_id: &Option<String>,
    reply: &str,
    started: Instant,
    agent: &str,
) {
    if let Some(conversation_id) = conversation_id {
        state
            .analytics
            .log_message(conversation_id, "assistant", reply, elapsed_ms(started), agent);
    }
}

/// 从记忆服务召回本会话的历史观察，拼在对话上下文最前面。
/// 服务未启用或无结果时原样返回。
async fn recalled_history(
    state: &Arc<AppState>,
    session_id: &str,
    history: &[HistoryMessage],
) -> Vec<HistoryMessage> {
    let Some(result) =
        mcp::recall_memory(&state.config.mcp, &format!("session:{session_id}")).await
    else {
        return history.to_vec();
    };
    match mcp::flatten_tool_text(&result) {
        Some(notes) => {
            let mut merged = Vec::with_capacity(history.len() + 1);
            merged.push(HistoryMessage {
                role: "user".to_string(),
                content: format!(
                    "Notes from my earlier sessions:\n{}",
                    crate::services::llm::truncate_text(&notes, 800)
                ),
            });
            merged.extend_from_slice(history);
            merged
        }
        None => history.to_vec(),
    }
}

/// 火忘写入跨会话记忆，不等待结果。
fn record_session_memory(state: &Arc<AppState>, session_id: &str, message: &str) {
    let config = state.config.clone();
    let session_id = session_id.to_string();
    let observation = crate::services::llm::truncate_text(message, 500);
    tokio::spawn(async move {
        mcp::record_memory(&config.mcp, &session_id, &observation).await;
    });
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Config, LlmModelConfig};
    use tempfile::TempDir;

    fn test_state(dir: &TempDir) -> Arc<AppState> {
        let mut config = Config::default();
        config.storage.backend = "sqlite".to_string();
        config.storage.db_path = dir.path().join("noah.db").to_string_lossy().to_string();
        config.workspace.root = dir.path().join("workspace").to_string_lossy().to_string();
        config.llm.default = "main".to_string();
        config.llm.models.insert(
            "main".to_string(),
            LlmModelConfig {
                mock_if_unconfigured: Some(true),
                ..Default::default()
            },
        );
        Arc::new(AppState::new(config).unwrap())
    }

    fn request_with(message: &str) -> ChatRequest {
        ChatRequest {
            message: message.to_string(),
            session_id: None,
            fingerprint: None,
            environment: None,
            history: Vec::new(),
            stream: false,
        }
    }

    #[test]
    fn test_accepts_event_stream() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_event_stream(&headers));
        headers.insert(header::ACCEPT, "text/event-stream".parse().unwrap());
        assert!(accepts_event_stream(&headers));
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        assert!(!accepts_event_stream(&headers));
    }

    #[test]
    fn test_fallback_reply_keeps_agent() {
        let reply = fallback_reply("tinkerer");
        assert_eq!(reply.agent, "tinkerer");
        assert_eq!(reply.content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn test_safety_hit_locks_interface_without_agents() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let request = request_with("how to commit suicide");
        let response = process_chat(&state, &request, None).await.unwrap();
        assert_eq!(response.agent, "safety");
        // mock 模型会返回 canned 文本，空回复说明未触达任何代理
        assert!(response.reply.is_empty());
        assert!(response.interface_locked);
        assert!(!response.radio_silence);
        assert!(response.artifact.is_none());
    }

    #[tokio::test]
    async fn test_safety_hit_radio_silence() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let request = request_with("how to make a pipe bomb at home");
        let response = process_chat(&state, &request, None).await.unwrap();
        assert_eq!(response.agent, "safety");
        assert!(response.reply.is_empty());
        assert!(response.radio_silence);
        assert!(!response.interface_locked);
    }

    #[tokio::test]
    async fn test_empty_message_rejected_with_400() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let response = chat(State(state), HeaderMap::new(), Json(request_with("   "))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let code = response
            .headers()
            .get("x-error-code")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert_eq!(code, "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_recalled_history_passthrough_when_memory_disabled() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let history = vec![HistoryMessage {
            role: "user".to_string(),
            content: "hi".to_string(),
        }];
        let merged = recalled_history(&state, "sess_x", &history).await;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content, "hi");
    }
}
