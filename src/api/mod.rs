// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod artifacts;
pub mod chat;
pub mod database;
pub mod errors;
pub mod filesystem;
pub mod video;

use crate::core::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(chat::router())
        .merge(database::router())
        .merge(filesystem::router())
        .merge(artifacts::router())
        .merge(video::router())
        .with_state(state)
}
