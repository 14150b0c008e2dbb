// 市场数据接入：接口清单与带缓存的分页取数。
use crate::api::errors::{error_response, gateway_error_response};
use crate::api::user_context::CurrentUser;
use crate::error::GatewayError;
use crate::paginate::{self, DEFAULT_PAGE_SIZE};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::{routing::get, routing::post, Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/mcp-data/interfaces", get(list_interfaces))
        .route("/api/mcp-data", post(fetch_data))
}

async fn list_interfaces(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut interfaces = Vec::new();
    for category in state.catalog.categories() {
        for interface in &category.interfaces {
            interfaces.push(json!({
                "name": interface.name,
                "description": interface.description,
                "example_params": interface.example_params,
                "category": category.name,
            }));
        }
    }
    Json(Value::Array(interfaces))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    page_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct McpDataRequest {
    interface: String,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    request_id: Option<String>,
}

async fn fetch_data(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<PageQuery>,
    Json(payload): Json<McpDataRequest>,
) -> Result<Json<Value>, Response> {
    let interface = payload.interface.trim().to_string();
    if interface.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "缺少 interface"));
    }
    if !state.catalog.has(&interface) {
        let err = GatewayError::UnknownInterface(format!("接口不存在: {interface}"));
        return Err(gateway_error_response(&err));
    }
    info!(
        "数据请求: 用户 {}, 接口 {interface}, request_id {:?}",
        user.0, payload.request_id
    );
    let invoker = state.invoker.clone();
    let interface_owned = interface.clone();
    let params_snapshot = payload.params.clone();
    let table = state
        .cache
        .get_or_compute(&interface, &payload.params, move || async move {
            invoker.call(&interface_owned, &params_snapshot).await
        })
        .await
        .map_err(|err| gateway_error_response(&err))?;
    let envelope = paginate::paginate(
        &table,
        query.page.unwrap_or(1),
        query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    );
    serde_json::to_value(&envelope)
        .map(Json)
        .map_err(|err| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("结果序列化失败: {err}"),
            )
        })
}
