// 会话工件查询。
use crate::api::errors::error_response;
use crate::core::state::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/artifacts", get(list_artifacts))
}

#[derive(Debug, Deserialize)]
struct ArtifactQuery {
    #[serde(default)]
    session_id: Option<String>,
}

async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ArtifactQuery>,
) -> Result<Json<Value>, Response> {
    let session_id = query
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "session_id is required"))?;
    let items = state
        .artifacts
        .list(session_id)
        .into_iter()
        .map(|artifact| {
            json!({
                "artifact_id": artifact.artifact_id,
                "title": artifact.title,
                "content": artifact.content,
                "category": artifact.category,
                "content_hash": artifact.content_hash,
                "agent": artifact.agent,
                "created_at": artifact.created_at,
            })
        })
        .collect::<Vec<_>>();
    if !items.is_empty() {
        return Ok(Json(json!({ "data": items })));
    }

    // 缓存未命中时回读分析库，重启后已落库的工件仍可列出。
    let storage = state.storage.clone();
    let session = session_id.to_string();
    let records = tokio::task::spawn_blocking(move || storage.list_generated_tools(&session, 100))
        .await
        .map_err(|err| {
            warn!("工件查询任务失败: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "artifact query failed")
        })?
        .map_err(|err| {
            warn!("工件查询失败: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "artifact query failed")
        })?;
    let items = records
        .into_iter()
        .map(|record| {
            json!({
                "artifact_id": record.tool_id,
                "title": record.title,
                "content": record.content,
                "category": record.category,
                "content_hash": record.content_hash,
                "agent": record.agent,
                "created_at": record.created_at,
            })
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "data": items })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Config, LlmModelConfig};
    use crate::services::artifacts::StoredArtifact;
    use crate::storage::GeneratedToolRecord;
    use tempfile::TempDir;

    fn test_state(dir: &TempDir) -> Arc<AppState> {
        let mut config = Config::default();
        config.storage.backend = "sqlite".to_string();
        config.storage.db_path = dir.path().join("noah.db").to_string_lossy().to_string();
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

    fn tool_record(session_id: &str) -> GeneratedToolRecord {
        GeneratedToolRecord {
            tool_id: "tool_db".to_string(),
            session_id: session_id.to_string(),
            conversation_id: None,
            title: "Habit Tracker".to_string(),
            content: "<html></html>".to_string(),
            content_hash: "0".repeat(64),
            category: "utility".to_string(),
            agent: "tinkerer".to_string(),
            generation_ms: 12.0,
            created_at: 1.0,
        }
    }

    #[tokio::test]
    async fn test_cache_miss_falls_back_to_storage() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state
            .storage
            .insert_generated_tool(&tool_record("sess_db"))
            .unwrap();

        let query = ArtifactQuery {
            session_id: Some("sess_db".to_string()),
        };
        let result = list_artifacts(State(state), Query(query)).await.unwrap();
        let items = result.0["data"].as_array().unwrap().clone();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["artifact_id"], "tool_db");
        assert_eq!(items[0]["agent"], "tinkerer");
    }

    #[tokio::test]
    async fn test_cache_hit_takes_priority() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state
            .storage
            .insert_generated_tool(&tool_record("sess_mixed"))
            .unwrap();
        state.artifacts.save(
            "sess_mixed",
            StoredArtifact {
                artifact_id: "tool_mem".to_string(),
                title: "Cached".to_string(),
                content: "<html></html>".to_string(),
                category: "utility".to_string(),
                content_hash: "1".repeat(64),
                agent: "boutique".to_string(),
                created_at: 2.0,
            },
        );

        let query = ArtifactQuery {
            session_id: Some("sess_mixed".to_string()),
        };
        let result = list_artifacts(State(state), Query(query)).await.unwrap();
        let items = result.0["data"].as_array().unwrap().clone();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["artifact_id"], "tool_mem");
    }
}
