// 登录与身份查询。
use crate::api::errors::error_response;
use crate::api::user_context::CurrentUser;
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::{routing::get, routing::post, Extension, Form, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/token", post(issue_token))
        .route("/api/users/me", get(me))
}

#[derive(Debug, Deserialize)]
struct TokenForm {
    username: String,
    password: String,
}

async fn issue_token(
    State(state): State<Arc<AppState>>,
    Form(payload): Form<TokenForm>,
) -> Result<Json<Value>, Response> {
    let username = payload.username.trim().to_string();
    let password = payload.password;
    let user_store = state.user_store.clone();
    let username_check = username.clone();
    // Argon2 校验是 CPU 密集操作，放到阻塞线程池执行。
    let verified = tokio::task::spawn_blocking(move || {
        user_store.verify_login(&username_check, &password)
    })
    .await
    .map_err(|err| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("登录校验失败: {err}"),
        )
    })?;
    if !verified {
        // 用户不存在与密码错误共用同一响应
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "用户名或密码错误",
        ));
    }
    let token = state.tokens.issue(&username);
    info!("用户 {username} 登录成功");
    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
    })))
}

async fn me(Extension(user): Extension<CurrentUser>) -> Json<Value> {
    Json(json!({ "username": user.0 }))
}
