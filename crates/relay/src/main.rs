mod api;
mod auth;
mod config;
mod cors;
mod db;
mod engine;
mod error;
mod gateway;
mod membership;
mod metrics;
mod presence;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::{future::IntoFuture, sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::jwt::JwtAccessTokenService,
    config::{LogFormat, RelayConfig},
    engine::BroadcastEngine,
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
    },
    gateway::PersistenceGateway,
    metrics::RelayMetrics,
    ws::{handler::Liveness, WsRouterState},
};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("PARLEY_RELAY_JWT_SECRET is unset; using the development-only secret");
    }

    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );
    let gateway = PersistenceGateway::connect(config.database_url.as_deref())
        .await
        .context("failed to initialize message persistence gateway")?;
    info!(backend = gateway.backend_name(), "persistence gateway ready");

    let metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&metrics));

    let engine = Arc::new(BroadcastEngine::new(
        gateway,
        config.heartbeat_interval.as_millis() as u64,
    ));
    let app = build_router(&config, engine, jwt_service, metrics, Instant::now());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    let shutdown = CancellationToken::new();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .into_future();

    let grace = config.shutdown_grace;
    tokio::select! {
        result = server => result.context("relay server exited unexpectedly"),
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_secs = grace.as_secs(), "connections did not drain in time, forcing shutdown");
            Ok(())
        }
    }
}

fn init_tracing(config: &RelayConfig) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn build_router(
    config: &RelayConfig,
    engine: Arc<BroadcastEngine>,
    jwt_service: Arc<JwtAccessTokenService>,
    metrics: Arc<RelayMetrics>,
    started_at: Instant,
) -> Router {
    let ws_state = WsRouterState {
        engine: Arc::clone(&engine),
        jwt_service,
        allowed_origins: config.cors_origins.as_deref().map(Arc::from),
        liveness: Liveness {
            interval: config.heartbeat_interval,
            timeout: config.heartbeat_timeout,
        },
    };

    let mut router = Router::new()
        .route("/healthz", get(move || healthz(started_at)))
        .route("/metrics", get(render_metrics).with_state(metrics))
        .merge(ws::router(ws_state));

    match config.internal_token.as_deref() {
        Some(token) => router = router.merge(api::router(engine, token)),
        None => info!("PARLEY_RELAY_INTERNAL_TOKEN is unset; internal broadcast intake disabled"),
    }

    apply_middleware(router).layer(cors::cors_layer(config.cors_origins.as_deref()))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz(started_at: Instant) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_secs": started_at.elapsed().as_secs(),
    }))
}

async fn render_metrics(State(metrics): State<Arc<RelayMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render_prometheus(),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    shutdown.cancel();
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc, time::Instant};

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, MAX_REQUEST_BODY_BYTES};
    use crate::{
        auth::jwt::JwtAccessTokenService, config::RelayConfig, engine::BroadcastEngine,
        gateway::PersistenceGateway, metrics::RelayMetrics,
    };

    fn test_config(internal_token: Option<&str>) -> RelayConfig {
        let mut vars = HashMap::from([(
            "PARLEY_RELAY_JWT_SECRET",
            "parley_test_secret_that_is_definitely_long_enough",
        )]);
        if let Some(token) = internal_token {
            vars.insert("PARLEY_RELAY_INTERNAL_TOKEN", token);
        }
        RelayConfig::from_env_fn(|key| {
            vars.get(key).map(|value| value.to_string()).ok_or(std::env::VarError::NotPresent)
        })
    }

    fn test_router(internal_token: Option<&str>) -> (Router, Arc<RelayMetrics>) {
        let config = test_config(internal_token);
        let jwt_service = Arc::new(
            JwtAccessTokenService::new(&config.jwt_secret)
                .expect("test jwt service should initialize"),
        );
        let engine = Arc::new(BroadcastEngine::new(PersistenceGateway::memory(), 15_000));
        let metrics = Arc::new(RelayMetrics::default());
        let router =
            build_router(&config, engine, jwt_service, Arc::clone(&metrics), Instant::now());
        (router, metrics)
    }

    #[tokio::test]
    async fn health_check_reports_status_and_request_id() {
        let (router, _metrics) = test_router(None);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-request-id", "req-health-1")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-request-id").unwrap(), "req-health-1");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let body: Value = serde_json::from_slice(&bytes).expect("body should be json");
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_string());
        assert!(body["uptime_secs"].is_u64());
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let (router, metrics) = test_router(None);
        metrics.record_fanout(3, 1);

        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .expect("metrics request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let body = String::from_utf8(bytes.to_vec()).expect("body should be utf8");
        assert!(body.contains("relay_fanout_deliveries_total 3"));
    }

    #[tokio::test]
    async fn internal_intake_is_only_mounted_with_a_token() {
        let request = || {
            Request::builder()
                .method(Method::POST)
                .uri("/internal/v1/groups/1/broadcasts")
                .header("content-type", "application/json")
                .header("x-parley-internal-token", "secret-token")
                .body(Body::from(r#"{"type":"message_deleted","message_id":1,"deleted_by":2}"#))
                .unwrap()
        };

        let (disabled, _) = test_router(None);
        let response = disabled.oneshot(request()).await.expect("request should complete");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let (enabled, _) = test_router(Some("secret-token"));
        let response = enabled.oneshot(request()).await.expect("request should complete");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(Router::new().route("/panic", get(panic_route)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/panic")
                    .body(Body::empty())
                    .expect("panic request should build"),
            )
            .await
            .expect("panic request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn request_body_limit_is_enforced() {
        async fn echo(body: String) -> String {
            body
        }

        let oversized_body = "a".repeat(MAX_REQUEST_BODY_BYTES + 1);
        let app = apply_middleware(Router::new().route("/echo", post(echo)));

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/echo")
                    .header("content-type", "text/plain")
                    .body(Body::from(oversized_body))
                    .expect("echo request should build"),
            )
            .await
            .expect("echo request should return a response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
