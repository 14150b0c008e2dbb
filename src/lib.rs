// Library entrypoint for integration tests and the server binary.
pub mod analyst;
pub mod api;
pub mod auth;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod files;
pub mod llm;
pub mod paginate;
pub mod shutdown;
pub mod state;
pub mod table;
pub mod token_service;
pub mod tools;
pub mod upstream;
pub mod user_store;

use api::errors::error_response;
use api::user_context::CurrentUser;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use state::AppState;
use std::sync::Arc;

/// 鉴权中间件：提取 Bearer 令牌并把解析出的用户名写入请求扩展。
/// 令牌错误只对外暴露粗粒度类别，不区分格式错误与签名错误。
pub async fn auth_guard(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if request.method() == axum::http::Method::OPTIONS {
        return Ok(next.run(request).await);
    }
    let path = request.uri().path();
    if !auth::is_protected_path(path) {
        return Ok(next.run(request).await);
    }
    let Some(token) = auth::extract_bearer_token(request.headers()) else {
        return Ok(error_response(StatusCode::UNAUTHORIZED, "缺少访问令牌"));
    };
    match state.tokens.validate(&token) {
        Ok(username) => {
            request.extensions_mut().insert(CurrentUser(username));
            Ok(next.run(request).await)
        }
        Err(token_service::TokenError::Expired) => {
            Ok(error_response(StatusCode::UNAUTHORIZED, "令牌已过期"))
        }
        Err(_) => Ok(error_response(StatusCode::UNAUTHORIZED, "令牌无效")),
    }
}
