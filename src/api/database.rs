// 分析查询与工具使用事件上报。
use crate::api::errors::error_response;
use crate::core::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/database", get(summary).post(log_tool_usage))
}

async fn summary(State(state): State<Arc<AppState>>) -> Result<Json<Value>, Response> {
    let storage = state.storage.clone();
    let result = tokio::task::spawn_blocking(move || storage.usage_summary())
        .await
        .map_err(|err| {
            warn!("统计查询任务失败: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "summary query failed")
        })?;
    match result {
        Ok(value) => Ok(Json(json!({ "data": value }))),
        Err(err) => {
            warn!("统计查询失败: {err}");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "summary query failed",
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolUsageRequest {
    tool_id: String,
    session_id: String,
    event_type: String,
}

async fn log_tool_usage(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ToolUsageRequest>,
) -> Result<Json<Value>, Response> {
    if request.tool_id.trim().is_empty() || request.event_type.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "tool_id and event_type are required",
        ));
    }
    state
        .analytics
        .log_tool_usage(&request.tool_id, &request.session_id, &request.event_type);
    Ok(Json(json!({ "data": { "accepted": true } })))
}
