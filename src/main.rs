// Rust 入口：挂载静态资源与 API 路由。
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::FutureExt;
use noah_server::config::{load_config, Config};
use noah_server::shutdown::shutdown_signal;
use noah_server::state::AppState;
use std::any::Any as StdAny;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_tracing(&config);
    let state = Arc::new(AppState::new(config.clone())?);

    // 挂载 API 路由与静态资源入口。
    let app = noah_server::build_router(state.clone());
    let app = mount_static(app, "web", "/");

    let cors = build_cors(&config);
    let app = app
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(panic_guard));

    let addr = bind_address(&config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("Noah API 服务已启动: http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("服务退出异常: {err}");
    }

    Ok(())
}

fn init_tracing(config: &Config) {
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
    let host = std::env::var("NOAH_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("NOAH_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

fn mount_static(app: Router, dir: &str, route: &str) -> Router {
    let path = PathBuf::from(dir);
    if path.exists() {
        // 目录存在时才挂载，避免容器裁剪后启动报错。
        let service = ServeDir::new(path).append_index_html_on_directories(true);
        let trimmed = route.trim_end_matches('/');
        if trimmed.is_empty() {
            app.fallback_service(service)
        } else {
            let nested = Router::new().fallback_service(service);
            app.nest(&format!("{trimmed}/"), nested)
        }
    } else {
        app
    }
}

fn build_cors(config: &Config) -> CorsLayer {
    // 读取配置并转换为 tower-http 的 CORS 规则。
    let mut cors = CorsLayer::new();

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

    match config
        .cors
        .allow_methods
        .as_ref()
        .map(|value| value.iter().map(|item| item.as_str()).collect::<Vec<_>>())
    {
        Some(methods) if methods.iter().any(|value| *value == "*") => {
            cors = cors.allow_methods(Any);
        }
        Some(methods) => {
            let values = methods
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_methods(AllowMethods::list(values));
            }
        }
        None => {
            cors = cors.allow_methods(Any);
        }
    }

    match config
        .cors
        .allow_headers
        .as_ref()
        .map(|value| value.iter().map(|item| item.as_str()).collect::<Vec<_>>())
    {
        Some(headers) if headers.iter().any(|value| *value == "*") => {
            cors = cors.allow_headers(Any);
        }
        Some(headers) => {
            let values = headers
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect::<Vec<_>>();
            if !values.is_empty() {
                cors = cors.allow_headers(AllowHeaders::list(values));
            }
        }
        None => {
            cors = cors.allow_headers(Any);
        }
    }

    if config.cors.allow_credentials.unwrap_or(false) {
        cors = cors.allow_credentials(true);
    }

    cors
}

async fn panic_guard(request: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let result = AssertUnwindSafe(next.run(request)).catch_unwind().await;
    match result {
        Ok(response) => Ok(response),
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("panic while handling {method} {path}: {detail}");
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Noah is experiencing technical difficulties right now. Please try again in a moment.",
            )
                .into_response())
        }
    }
}

fn panic_message(panic: &(dyn StdAny + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
