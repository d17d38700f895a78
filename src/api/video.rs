// 引导视频元数据透传。
use crate::core::state::AppState;
use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/video", get(video))
}

async fn video(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "data": state.config.video }))
}
