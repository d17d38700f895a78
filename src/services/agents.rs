// 代理层：Noah 对话、Wanderer 调研、Tinkerer 构建，各自一次 LLM 调用。
use crate::core::config::Config;
use crate::core::schemas::{HistoryMessage, TokenUsage};
use crate::services::llm::{build_llm_client, is_llm_configured, ChatMessage, LlmClient};
use crate::services::prompting::{
    build_chat_messages, build_tinkerer_request, CLARIFY_SYSTEM_PROMPT, NOAH_SYSTEM_PROMPT,
    TINKERER_SYSTEM_PROMPT, WANDERER_SYSTEM_PROMPT,
};
use anyhow::{anyhow, Result};
use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AgentReply {
    pub agent: &'static str,
    pub content: String,
    pub usage: Option<TokenUsage>,
}

enum AgentBackend {
    Live(LlmClient),
    Mock,
    Disabled,
}

struct AgentSlot {
    backend: AgentBackend,
    timeout: Duration,
}

pub struct AgentRuntime {
    chat: AgentSlot,
    research: AgentSlot,
    build: AgentSlot,
}

impl AgentRuntime {
    pub fn new(config: &Config, http: Client) -> Self {
        let slot_for = |task: &str| -> AgentSlot {
            let model = config.model_for_task(task);
            let backend = match model {
                Some(model) if is_llm_configured(model) => {
                    AgentBackend::Live(build_llm_client(model, http.clone()))
                }
                Some(model) if model.mock_if_unconfigured.unwrap_or(false) => AgentBackend::Mock,
                Some(_) | None => AgentBackend::Disabled,
            };
            // 模型自带的超时优先，未配置时回退代理层默认值。
            let timeout_s = model
                .and_then(|model| model.timeout_s)
                .unwrap_or(config.agents.timeout_s);
            AgentSlot {
                backend,
                timeout: Duration::from_secs(timeout_s.max(5)),
            }
        };
        Self {
            chat: slot_for("chat"),
            research: slot_for("research"),
            build: slot_for("build"),
        }
    }

    /// 普通对话。
    pub async fn converse(
        &self,
        history: &[HistoryMessage],
        message: &str,
    ) -> Result<AgentReply> {
        let messages = build_chat_messages(NOAH_SYSTEM_PROMPT, history, message);
        self.run("noah", &self.chat, messages, mock_chat_reply)
            .await
    }

    /// 流式对话，增量文本通过回调送出。
    pub async fn converse_stream<F, Fut>(
        &self,
        history: &[HistoryMessage],
        message: &str,
        on_delta: F,
    ) -> Result<AgentReply>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let messages = build_chat_messages(NOAH_SYSTEM_PROMPT, history, message);
        match &self.chat.backend {
            AgentBackend::Live(client) => {
                // 超时后 future 被丢弃，下游请求随之取消。
                let result = tokio::time::timeout(
                    self.chat.timeout,
                    client.stream_complete(&messages, on_delta),
                )
                .await
                .map_err(|_| anyhow!("agent noah timed out"))??;
                Ok(AgentReply {
                    agent: "noah",
                    content: result.content,
                    usage: result.usage,
                })
            }
            AgentBackend::Mock => Ok(AgentReply {
                agent: "noah",
                content: mock_chat_reply(message),
                usage: None,
            }),
            AgentBackend::Disabled => Err(anyhow!("chat model is not configured")),
        }
    }

    /// 请求含糊时，让 Noah 反问一句澄清。
    pub async fn clarify(
        &self,
        history: &[HistoryMessage],
        message: &str,
    ) -> Result<AgentReply> {
        let messages = build_chat_messages(CLARIFY_SYSTEM_PROMPT, history, message);
        self.run("noah", &self.chat, messages, |_| {
            "Just so I build or look up the right thing: do you want me to make you an \
             interactive tool, or dig up information first?"
                .to_string()
        })
        .await
    }

    /// Wanderer 调研。失败或超时返回 None，管线继续不带上下文。
    pub async fn research(&self, message: &str) -> Option<AgentReply> {
        let messages = build_chat_messages(WANDERER_SYSTEM_PROMPT, &[], message);
        match self
            .run("wanderer", &self.research, messages, mock_research_reply)
            .await
        {
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!("wanderer research failed, continuing without context: {err}");
                None
            }
        }
    }

    /// Tinkerer 构建，可携带调研结果。
    pub async fn build(&self, message: &str, research_context: Option<&str>) -> Result<AgentReply> {
        let request = build_tinkerer_request(message, research_context);
        let messages = build_chat_messages(TINKERER_SYSTEM_PROMPT, &[], &request);
        self.run("tinkerer", &self.build, messages, mock_build_reply)
            .await
    }

    async fn run(
        &self,
        agent: &'static str,
        slot: &AgentSlot,
        messages: Vec<ChatMessage>,
        mock: impl Fn(&str) -> String,
    ) -> Result<AgentReply> {
        match &slot.backend {
            AgentBackend::Live(client) => {
                let result = tokio::time::timeout(slot.timeout, client.complete(&messages))
                    .await
                    .map_err(|_| anyhow!("agent {agent} timed out"))??;
                Ok(AgentReply {
                    agent,
                    content: result.content,
                    usage: result.usage,
                })
            }
            AgentBackend::Mock => {
                let user_message = messages
                    .last()
                    .map(|message| message.content.as_str())
                    .unwrap_or("");
                Ok(AgentReply {
                    agent,
                    content: mock(user_message),
                    usage: None,
                })
            }
            AgentBackend::Disabled => Err(anyhow!("{agent} model is not configured")),
        }
    }
}

fn mock_chat_reply(message: &str) -> String {
    format!(
        "I'm running without a language model right now, so this is a canned reply. \
         You said: \"{}\"",
        crate::services::llm::truncate_text(message, 200)
    )
}

fn mock_research_reply(message: &str) -> String {
    format!(
        "Mock research notes for \"{}\": no live model configured, no sources consulted.",
        crate::services::llm::truncate_text(message, 120)
    )
}

fn mock_build_reply(_message: &str) -> String {
    "TITLE: Placeholder Tool\nTOOL:\n<!DOCTYPE html>\n<html><body><p>No build model is \
     configured. This is a placeholder artifact.</p></body></html>"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::LlmModelConfig;

    fn mock_config() -> Config {
        let mut config = Config::default();
        config.llm.default = "main".to_string();
        config.llm.models.insert(
            "main".to_string(),
            LlmModelConfig {
                mock_if_unconfigured: Some(true),
                ..Default::default()
            },
        );
        config
    }

    #[tokio::test]
    async fn test_mock_converse() {
        let runtime = AgentRuntime::new(&mock_config(), Client::new());
        let reply = runtime.converse(&[], "hello there").await.unwrap();
        assert_eq!(reply.agent, "noah");
        assert!(reply.content.contains("hello there"));
    }

    #[tokio::test]
    async fn test_mock_build_emits_structured_format() {
        let runtime = AgentRuntime::new(&mock_config(), Client::new());
        let reply = runtime.build("build me a widget", None).await.unwrap();
        assert_eq!(reply.agent, "tinkerer");
        assert!(reply.content.starts_with("TITLE:"));
        assert!(reply.content.contains("TOOL:"));
    }

    #[tokio::test]
    async fn test_disabled_backend_errors() {
        let runtime = AgentRuntime::new(&Config::default(), Client::new());
        assert!(runtime.converse(&[], "hi").await.is_err());
    }

    #[tokio::test]
    async fn test_research_failure_returns_none() {
        let runtime = AgentRuntime::new(&Config::default(), Client::new());
        assert!(runtime.research("look this up").await.is_none());
    }

    #[test]
    fn test_per_model_timeout_overrides_agent_default() {
        let mut config = mock_config();
        config.agents.timeout_s = 90;
        if let Some(model) = config.llm.models.get_mut("main") {
            model.timeout_s = Some(120);
        }
        // chat 走未配置超时的模型，应回退代理层默认值
        config.llm.models.insert(
            "plain".to_string(),
            LlmModelConfig {
                mock_if_unconfigured: Some(true),
                ..Default::default()
            },
        );
        config.llm.tasks.chat = "plain".to_string();

        let runtime = AgentRuntime::new(&config, Client::new());
        assert_eq!(runtime.build.timeout, Duration::from_secs(120));
        assert_eq!(runtime.research.timeout, Duration::from_secs(120));
        assert_eq!(runtime.chat.timeout, Duration::from_secs(90));
    }
}
