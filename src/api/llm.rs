// 自然语言分析入口：对话与结构化分析。
use crate::api::errors::{error_response, gateway_error_response};
use crate::api::user_context::CurrentUser;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::{routing::post, Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/llm/chat", post(chat))
        .route("/api/llm/analyze", post(analyze))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    prompt: String,
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<Value>, Response> {
    let response = state
        .analyst
        .chat(&payload.prompt)
        .await
        .map_err(|err| gateway_error_response(&err))?;
    Ok(Json(json!({ "response": response })))
}

#[derive(Debug, Deserialize)]
struct AnalyzeQuery {
    #[serde(default)]
    use_llm: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    query: String,
}

async fn analyze(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(flags): Query<AnalyzeQuery>,
    Json(payload): Json<AnalyzeRequest>,
) -> Result<Json<Value>, Response> {
    let envelope = state
        .analyst
        .analyze(&payload.query, &user.0, flags.use_llm.unwrap_or(true))
        .await
        .map_err(|err| gateway_error_response(&err))?;
    serde_json::to_value(&envelope).map(Json).map_err(|err| {
        error_response(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("结果序列化失败: {err}"),
        )
    })
}
