use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use axum::{
    Extension, Router,
    http::{HeaderValue, Method, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{Config, DatabaseConfig, LogFormat};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    db::bootstrap,
    handlers::socket::ws_handler,
    middleware::request_context::{self, RequestIdState},
    routes,
    services::{ChatStore, EchoGenerator, Generator, MemoryChatStore, OpenAiGenerator, PgChatStore},
    tracer,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus handle. The recorder is installed on first use;
/// if another recorder is already installed the handle renders an empty registry.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new().install_recorder().unwrap_or_else(|err| {
                warn!(error = %err, "prometheus recorder not installed");
                PrometheusBuilder::new().build_recorder().handle()
            })
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
/// Returns the configured level.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates a database connection pool from the database settings.
///
/// # Errors
/// Returns an error if the database connection pool cannot be created.
pub async fn create_database_pool(db: &DatabaseConfig) -> Result<sqlx::PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect(&db.url)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(pool)
}

/// Connects, bootstraps and returns the Postgres store, or the in-memory
/// store when no database URL is configured.
///
/// # Errors
/// Returns an error if the database is unreachable or a bootstrap script fails.
pub async fn create_store(db: &DatabaseConfig) -> anyhow::Result<Arc<dyn ChatStore>> {
    if db.url.trim().is_empty() {
        warn!("no database configured; chats are kept in memory only");
        return Ok(Arc::new(MemoryChatStore::new()));
    }

    let pool = create_database_pool(db).await?;
    bootstrap::ensure_liveness(&pool).await?;
    bootstrap::run(&pool, db).await?;
    Ok(Arc::new(PgChatStore::new(pool)))
}

/// The OpenAI-compatible generator, or the echo generator when no endpoint is set.
///
/// # Errors
/// Returns an error if the HTTP client cannot be built.
pub fn create_generator(config: &Config) -> anyhow::Result<Arc<dyn Generator>> {
    if config.generation.endpoint.trim().is_empty() {
        warn!("no generation endpoint configured; replies echo the user");
        return Ok(Arc::new(EchoGenerator));
    }
    Ok(Arc::new(OpenAiGenerator::new(&config.generation)?))
}

/// Creates the CORS layer. An empty origin list allows any origin.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::list([Method::GET, Method::OPTIONS]))
        .allow_headers(AllowHeaders::any())
        .max_age(Duration::from_secs(600));

    if config.server.cors_allowed_origins.is_empty() {
        cors.allow_origin(AllowOrigin::any())
    } else {
        let origins = config
            .server
            .cors_allowed_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(
    state: Arc<AppState>,
    config: &Config,
    metrics_handle: PrometheusHandle,
) -> Router {
    let request_id_state = RequestIdState::from_config(config);

    Router::new()
        .route("/ws", get(ws_handler))
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .layer(Extension(metrics_handle))
        .layer(create_cors_layer(config))
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
        .with_state(state)
}

/// Resolves when the process receives Ctrl-C.
pub async fn create_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

/// Starts the server and runs until a shutdown signal arrives.
///
/// # Errors
/// Returns an error if the store, generator or listener cannot be set up.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!("Starting server...");

    let metrics_handle = metrics_handle();
    let store = create_store(&config.database).await?;
    let generator = create_generator(&config)?;
    let state = Arc::new(AppState::new(&config, store, generator));
    state.coordinator.history().ensure_reaper();

    let app = create_app_router(Arc::clone(&state), &config, metrics_handle);

    let host: std::net::IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::new(host, config.server.port);
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal())
        .await?;

    state.coordinator.history().shutdown();
    if tokio::time::timeout(DRAIN_TIMEOUT, state.coordinator.drain())
        .await
        .is_err()
    {
        warn!("background tasks still running at shutdown");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use std::{
        io::{self, Write},
        sync::Mutex,
    };
    use tower::ServiceExt;
    use tracing::Subscriber;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct BufferMakeWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    struct BufferWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for BufferMakeWriter {
        type Writer = BufferWriter;

        fn make_writer(&'a self) -> Self::Writer {
            BufferWriter {
                buffer: Arc::clone(&self.buffer),
            }
        }
    }

    impl Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn subscriber_with_writer<W>(config: &Config, writer: W) -> Box<dyn Subscriber + Send + Sync>
    where
        W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
    {
        let builder = fmt::fmt()
            .with_env_filter(build_env_filter(config))
            .with_target(false)
            .with_writer(writer);

        if matches!(config.logging.format, LogFormat::Json) {
            Box::new(builder.json().with_ansi(false).finish())
        } else {
            Box::new(builder.with_ansi(false).finish())
        }
    }

    fn capture(config: &Config) -> String {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = subscriber_with_writer(
            config,
            BufferMakeWriter {
                buffer: Arc::clone(&buffer),
            },
        );
        let dispatch = tracing::dispatcher::Dispatch::new(subscriber);
        tracing::dispatcher::with_default(&dispatch, || {
            info!(chat_id = "c1", "turn finished");
        });
        let contents = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        contents
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap()
            .to_string()
    }

    #[test]
    fn json_log_format_produces_json_output() {
        let mut config = Config::default();
        config.logging.format = LogFormat::Json;

        let value: Value = serde_json::from_str(&capture(&config)).unwrap();
        assert_eq!(value["fields"]["message"], "turn finished");
        assert_eq!(value["fields"]["chat_id"], "c1");
    }

    #[test]
    fn text_log_format_emits_plain_events() {
        let line = capture(&Config::default());
        assert!(serde_json::from_str::<Value>(&line).is_err());
        assert!(line.contains("turn finished"));
    }

    fn app() -> Router {
        let config = Config::default();
        let state = Arc::new(AppState::in_memory(&config));
        create_app_router(state, &config, metrics_handle())
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_payload() {
        let router = app();
        metrics::counter!("confab_generation_started_total").increment(1);

        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("confab_generation_started_total"));
    }

    #[tokio::test]
    async fn responses_carry_request_id() {
        let response = app()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn socket_route_rejects_plain_requests() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/ws?user_id=u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[test]
    fn configured_origins_are_applied() {
        let mut config = Config::default();
        config.server.cors_allowed_origins = vec!["https://chat.example".into()];
        let layer = create_cors_layer(&config);
        assert!(format!("{layer:?}").contains("chat.example"));
    }

    #[tokio::test]
    async fn empty_database_url_selects_memory_store() {
        let db = DatabaseConfig {
            url: String::new(),
            ..DatabaseConfig::default()
        };
        let store = create_store(&db).await.unwrap();
        assert!(store.ping().await.is_ok());
    }

    #[test]
    fn empty_endpoint_selects_echo_generator() {
        assert!(create_generator(&Config::default()).is_ok());
    }
}
