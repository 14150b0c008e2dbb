// 用户文件接口：上传、清单、删除与按 CSV 浏览。
use crate::api::errors::{error_response, gateway_error_response};
use crate::api::user_context::CurrentUser;
use crate::error::GatewayError;
use crate::paginate::DEFAULT_PAGE_SIZE;
use crate::state::AppState;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::{routing::delete, routing::get, routing::post, Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router(max_upload_bytes: u64) -> Router<Arc<AppState>> {
    // multipart 头部与分隔符留出余量，实际大小仍由处理器逐块校验
    let body_limit = (max_upload_bytes as usize).saturating_add(1024 * 1024);
    Router::new()
        .route("/api/data/upload", post(upload))
        .route("/api/data/files", get(list_files))
        .route("/api/data/files/:filename", delete(delete_file))
        .route("/api/data/explore/:filename", post(explore_file))
        .layer(DefaultBodyLimit::max(body_limit))
}

async fn upload(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<Json<Value>, Response> {
    let max_bytes = state.files.max_upload_bytes();
    while let Some(mut field) = multipart.next_field().await.map_err(|err| {
        error_response(StatusCode::BAD_REQUEST, format!("解析上传内容失败: {err}"))
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(|name| name.to_string())
            .unwrap_or_default();
        // 逐块累积并即时校验大小，超限立即中止而不是读完再拒绝。
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(|err| {
            error_response(StatusCode::BAD_REQUEST, format!("读取上传数据失败: {err}"))
        })? {
            if (bytes.len() + chunk.len()) as u64 > max_bytes {
                let err = GatewayError::TooLarge(format!(
                    "文件超出大小上限 {max_bytes} 字节"
                ));
                return Err(gateway_error_response(&err));
            }
            bytes.extend_from_slice(&chunk);
        }
        let stored = state
            .files
            .save(&user.0, &filename, bytes)
            .await
            .map_err(|err| gateway_error_response(&err))?;
        return Ok(Json(json!({ "filename": stored })));
    }
    Err(error_response(StatusCode::BAD_REQUEST, "缺少 file 字段"))
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<Value>, Response> {
    let files = state
        .files
        .list(&user.0)
        .await
        .map_err(|err| gateway_error_response(&err))?;
    Ok(Json(json!(files)))
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(filename): Path<String>,
) -> Result<StatusCode, Response> {
    state
        .files
        .delete(&user.0, &filename)
        .await
        .map_err(|err| gateway_error_response(&err))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ExploreQuery {
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    page_size: Option<usize>,
}

async fn explore_file(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(filename): Path<String>,
    Query(query): Query<ExploreQuery>,
) -> Result<Json<Value>, Response> {
    let envelope = state
        .files
        .browse(
            &user.0,
            &filename,
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await
        .map_err(|err| gateway_error_response(&err))?;
    serde_json::to_value(&envelope).map(Json).map_err(|err| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("结果序列化失败: {err}"),
        )
    })
}
