// 服务入口：加载配置、装配状态、挂载路由与中间件。
use akgate_server::config::{load_config, Config};
use akgate_server::state::AppState;
use akgate_server::{api, auth_guard, shutdown};
use axum::middleware::from_fn_with_state;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_tracing(&config);
    // 启动失败（缺密钥、目录不可写、目录文件缺失）直接以非零码退出。
    let state = Arc::new(AppState::new(config.clone())?);
    info!(
        "已加载 {} 个用户、{} 个上游接口",
        state.user_store.len(),
        state.catalog.list().len()
    );

    let app = api::build_router(state.clone())
        .layer(from_fn_with_state(state.clone(), auth_guard))
        .layer(build_cors(&config))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = bind_address(&config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("数据网关已启动: http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown::shutdown_signal());
    if let Err(err) = server.await {
        warn!("服务退出异常: {err}");
    }
    Ok(())
}

fn init_tracing(config: &Config) {
    // RUST_LOG 优先，未设置时退回配置项，默认 info。
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn bind_address(config: &Config) -> String {
    // 保留环境变量覆盖，便于容器化部署。
    let host = std::env::var("AKGATE_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("AKGATE_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

fn build_cors(config: &Config) -> CorsLayer {
    let mut cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any);
    match config
        .cors
        .allow_origins
        .as_ref()
        .map(|value| value.iter().map(|item| item.as_str()).collect::<Vec<_>>())
    {
        Some(origins) if origins.iter().any(|value| *value == "*") => {
            cors = cors.allow_origin(Any);
        }
        Some(origins) => {
            let values = origins
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_origin(AllowOrigin::list(values));
            }
        }
        None => {
            cors = cors.allow_origin(Any);
        }
    }
    cors
}
