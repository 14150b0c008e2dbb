// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod auth;
pub mod data;
pub mod errors;
pub mod files;
pub mod health;
pub mod llm;
pub mod user_context;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let max_upload_bytes = state.files.max_upload_bytes();
    Router::new()
        .merge(health::router())
        .merge(auth::router())
        .merge(data::router())
        .merge(files::router(max_upload_bytes))
        .merge(llm::router())
}
