// 文件操作审批接口与工作区静态文件下发。
use crate::api::errors::{error_response, error_response_with_detail};
use crate::core::state::AppState;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/filesystem/execute", post(execute))
        .route("/api/filesystem/reject", post(reject))
        .route("/api/filesystem/serve/{*path}", get(serve))
}

#[derive(Debug, Deserialize)]
struct OperationRequest {
    operation_id: String,
}

async fn execute(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OperationRequest>,
) -> Result<Json<Value>, Response> {
    let operation_id = request.operation_id.trim();
    if operation_id.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "operation_id is required",
        ));
    }
    match state.file_ops.approve_and_execute(operation_id).await {
        Ok(operation) => Ok(Json(json!({
            "data": {
                "operation_id": operation.operation_id,
                "state": operation.state.as_str(),
                "path": operation.path,
            }
        }))),
        Err(err) => {
            warn!("执行文件操作失败: {operation_id}, {err}");
            Err(error_response_with_detail(
                StatusCode::UNPROCESSABLE_ENTITY,
                Some("OPERATION_FAILED"),
                "file operation failed",
                None,
                Some(json!({ "operation_id": operation_id })),
            ))
        }
    }
}

async fn reject(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OperationRequest>,
) -> Result<Json<Value>, Response> {
    let operation_id = request.operation_id.trim();
    if operation_id.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "operation_id is required",
        ));
    }
    match state.file_ops.reject(operation_id) {
        Ok(operation) => Ok(Json(json!({
            "data": {
                "operation_id": operation.operation_id,
                "state": operation.state.as_str(),
            }
        }))),
        Err(err) => {
            warn!("拒绝文件操作失败: {operation_id}, {err}");
            Err(error_response_with_detail(
                StatusCode::NOT_FOUND,
                Some("OPERATION_NOT_FOUND"),
                "file operation not found",
                None,
                Some(json!({ "operation_id": operation_id })),
            ))
        }
    }
}

/// 下发工作区文件，带越界防护与按扩展名推断的 Content-Type。
async fn serve(
    State(state): State<Arc<AppState>>,
    AxumPath(path): AxumPath<String>,
) -> Response {
    let target = match state.file_ops.resolve_serve_path(&path) {
        Ok(target) => target,
        Err(err) => {
            warn!("拒绝越界文件访问: {path}, {err}");
            return error_response(StatusCode::BAD_REQUEST, "invalid file path");
        }
    };
    match tokio::fs::read(&target).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&target)
                .first_or_octet_stream()
                .to_string();
            let mut response = bytes.into_response();
            if let Ok(value) = HeaderValue::from_str(&mime) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            response
        }
        Err(_) => error_response(StatusCode::NOT_FOUND, "file not found"),
    }
}
