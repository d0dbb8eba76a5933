//! Token Pool Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of upstream bearer tokens from TOKEN_LIST or a tokens file
//! 2. Forwards every request bearing the proxy API key to the upstream with a
//!    pooled token
//! 3. Fails over to the next token when the upstream rejects or errors
//! 4. Exposes pool state and reset/reload controls on a separate admin port

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use common::Secret;
use metrics_exporter_prometheus::PrometheusHandle;
use token_pool::{Pool, PoolStatus};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::Config;
use crate::proxy::ProxyState;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-lifetime request counters surfaced on /health.
#[derive(Clone)]
struct ServiceMetrics {
    requests_total: Arc<AtomicU64>,
    errors_total: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
    started_at: Instant,
}

impl ServiceMetrics {
    fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

impl AppState {
    fn new(
        pool: Arc<Pool>,
        upstream_url: String,
        timeout: Duration,
        api_key: Secret<String>,
        prometheus: PrometheusHandle,
    ) -> Self {
        let metrics = ServiceMetrics::new();
        let proxy = ProxyState {
            client: reqwest::Client::new(),
            upstream_url,
            timeout,
            pool,
            api_key,
            requests_total: metrics.requests_total.clone(),
            errors_total: metrics.errors_total.clone(),
            in_flight: metrics.in_flight.clone(),
        };
        Self {
            proxy,
            metrics,
            prometheus,
        }
    }
}

/// Build the proxy router: health, metrics, and a catch-all that forwards
/// everything else upstream.
///
/// At most `max_connections` requests are processed concurrently; the rest
/// wait for a slot.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting token-proxy");

    // Must be installed before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let tokens = config
        .pool
        .tokens
        .as_ref()
        .context("token list missing after config load")?;
    let api_key = config
        .proxy
        .api_key
        .clone()
        .context("API key missing after config load")?;
    let pool = Arc::new(
        Pool::new(tokens.expose(), config.pool.max_failures)
            .context("failed to initialize token pool")?,
    );
    metrics::record_pool(&pool.stats());

    info!(
        listen_addr = %config.proxy.listen_addr,
        admin_addr = %config.admin.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        tokens = pool.len(),
        max_failures = pool.max_failures(),
        "configuration loaded"
    );

    let app_state = AppState::new(
        pool.clone(),
        config.proxy.upstream_url.clone(),
        Duration::from_secs(config.proxy.timeout_secs),
        api_key,
        prometheus_handle,
    );
    let in_flight = app_state.metrics.in_flight.clone();
    let app = build_router(app_state, config.proxy.max_connections);
    let admin_app =
        admin::build_admin_router(AdminState::new(pool, config.token_source()));

    let listener = TcpListener::bind(config.proxy.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.proxy.listen_addr))?;
    let admin_listener = TcpListener::bind(config.admin.listen_addr)
        .await
        .with_context(|| format!("failed to bind admin to {}", config.admin.listen_addr))?;

    info!(
        addr = %config.proxy.listen_addr,
        admin_addr = %config.admin.listen_addr,
        "accepting requests"
    );

    // The drain timer starts at signal receipt, not at server start: both
    // servers are told to drain, then the drain is raced against the timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let proxy_server = tokio::spawn({
        let mut rx = shutdown_rx.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await
        }
    });
    let admin_server = tokio::spawn({
        let mut rx = shutdown_rx;
        async move {
            axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await
        }
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        tokio::join!(proxy_server, admin_server)
    })
    .await;

    match drained {
        Ok((proxy_result, admin_result)) => {
            for (name, result) in [("proxy", proxy_result), ("admin", admin_result)] {
                match result {
                    Ok(Ok(())) => info!(server = name, "server drained"),
                    Ok(Err(e)) => error!(server = name, error = %e, "server error during shutdown"),
                    Err(e) => error!(server = name, error = %e, "server task panicked"),
                }
            }
        }
        Err(_) => {
            warn!(
                remaining = in_flight.load(Ordering::Relaxed),
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Returns 200 while at least one token is active, 503 once the pool is
/// exhausted and every proxied request would be rejected.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.proxy.pool.stats();
    let pool_status = stats.status();
    let status_code = match pool_status {
        PoolStatus::Unhealthy => axum::http::StatusCode::SERVICE_UNAVAILABLE,
        PoolStatus::Healthy | PoolStatus::Degraded => axum::http::StatusCode::OK,
    };

    let body = serde_json::json!({
        "status": pool_status,
        "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
        "requests_served": state.metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": state.metrics.errors_total.load(Ordering::Relaxed),
        "tokens": {
            "total": stats.total_tokens,
            "active": stats.active_tokens,
            "inactive": stats.inactive_tokens,
        },
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies all non-health requests to upstream.
///
/// The API key check happens inside `proxy_request` so rejected calls are
/// still counted and get a request id.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    /// A PrometheusHandle that does not touch the global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    const TEST_API_KEY: &str = "sk-proxy-test";

    fn test_app_state(upstream_url: &str, pool: Arc<Pool>) -> AppState {
        AppState::new(
            pool,
            upstream_url.to_string(),
            Duration::from_secs(5),
            Secret::from(TEST_API_KEY),
            test_prometheus_handle(),
        )
    }

    /// GET request carrying the proxy's API key.
    fn authed(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {TEST_API_KEY}"))
            .body(Body::empty())
            .unwrap()
    }

    fn test_pool(tokens: &str, max_failures: u32) -> Arc<Pool> {
        Arc::new(Pool::new(tokens, max_failures).unwrap())
    }

    /// Mock upstream that accepts any bearer token starting with "good" and
    /// echoes the request back as JSON. Everything else gets a 401.
    async fn start_mock_upstream() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            let app =
                axum::Router::new().fallback(|request: axum::http::Request<Body>| async move {
                    let auth = request
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    if request.uri().path().starts_with("/missing") {
                        return (
                            StatusCode::NOT_FOUND,
                            [("x-upstream", "mock")],
                            r#"{"detail":"no such route"}"#.to_string(),
                        );
                    }
                    if !auth.starts_with("Bearer good") {
                        return (
                            StatusCode::UNAUTHORIZED,
                            [("x-upstream", "mock")],
                            r#"{"detail":"invalid token"}"#.to_string(),
                        );
                    }

                    let custom = request
                        .headers()
                        .get("x-custom")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let method = request.method().to_string();
                    let path = request.uri().path().to_string();
                    let query = request.uri().query().unwrap_or("").to_string();
                    let body_bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                        .await
                        .unwrap();
                    let body = serde_json::json!({
                        "authorization": auth,
                        "x_custom": custom,
                        "method": method,
                        "path": path,
                        "query": query,
                        "body": String::from_utf8_lossy(&body_bytes),
                    });
                    (StatusCode::OK, [("x-upstream", "mock")], body.to_string())
                });
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn forwards_with_pooled_bearer_and_strips_client_auth() {
        let (url, _server) = start_mock_upstream().await;
        let pool = test_pool("good-1", 3);
        let app = build_router(test_app_state(&url, pool), 10);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat?stream=false")
                    .header("authorization", format!("Bearer {TEST_API_KEY}"))
                    .header("x-custom", "kept")
                    .header("connection", "keep-alive")
                    .body(Body::from(r#"{"model":"m"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "mock");
        let json = body_json(response).await;
        assert_eq!(json["authorization"], "Bearer good-1");
        assert_eq!(json["x_custom"], "kept");
        assert_eq!(json["method"], "POST");
        assert_eq!(json["path"], "/api/chat");
        assert_eq!(json["query"], "stream=false");
        assert_eq!(json["body"], r#"{"model":"m"}"#);
    }

    #[tokio::test]
    async fn fails_over_past_rejected_token() {
        let (url, _server) = start_mock_upstream().await;
        let pool = test_pool("bad-1,good-2", 3);
        let app = build_router(test_app_state(&url, pool.clone()), 10);

        let response = app
            .oneshot(authed("/v1/models"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["authorization"], "Bearer good-2");
        assert_eq!(pool.credential(0).unwrap().consecutive_failures, 1);
        assert_eq!(pool.credential(1).unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn all_tokens_rejected_returns_502() {
        let (url, _server) = start_mock_upstream().await;
        let pool = test_pool("bad-1,bad-2", 3);
        let state = test_app_state(&url, pool.clone());
        let errors = state.metrics.errors_total.clone();
        let app = build_router(state, 10);

        let response = app
            .oneshot(authed("/v1/models"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "upstream_error");
        assert!(json["error"]["message"].as_str().unwrap().contains("401"));
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
        assert_eq!(pool.stats().failure_distribution.get(&1), Some(&2));
        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn client_errors_pass_through_without_failing_tokens() {
        let (url, _server) = start_mock_upstream().await;
        let pool = test_pool("good-1,good-2,good-3", 3);
        let app = build_router(test_app_state(&url, pool.clone()), 10);

        for _ in 0..4 {
            let response = app
                .clone()
                .oneshot(authed("/missing/route"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(response.headers().get("x-upstream").unwrap(), "mock");
            let json = body_json(response).await;
            assert_eq!(json["detail"], "no such route");
        }

        let stats = pool.stats();
        assert_eq!(stats.active_tokens, 3);
        assert_eq!(stats.failure_distribution.get(&0), Some(&3));
    }

    #[tokio::test]
    async fn missing_api_key_is_rejected_before_acquire() {
        let (url, _server) = start_mock_upstream().await;
        let pool = test_pool("good-1", 3);
        let state = test_app_state(&url, pool.clone());
        let errors = state.metrics.errors_total.clone();
        let app = build_router(state, 10);

        let response = app
            .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "authentication_error");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
        assert_eq!(errors.load(Ordering::Relaxed), 1);
        assert!(pool.credential(0).unwrap().last_used_at_ms.is_none());
    }

    #[tokio::test]
    async fn wrong_api_key_is_rejected() {
        let (url, _server) = start_mock_upstream().await;
        let pool = test_pool("good-1", 1);
        let app = build_router(test_app_state(&url, pool.clone()), 10);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .header("authorization", "Bearer sk-guess")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(pool.credential(0).unwrap().last_used_at_ms.is_none());
        assert_eq!(pool.stats().active_tokens, 1);
    }

    #[tokio::test]
    async fn correct_api_key_reaches_upstream() {
        let (url, _server) = start_mock_upstream().await;
        let pool = test_pool("good-1", 1);
        let app = build_router(test_app_state(&url, pool.clone()), 10);

        let response = app.oneshot(authed("/v1/models")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["authorization"], "Bearer good-1");
        assert!(pool.credential(0).unwrap().last_used_at_ms.is_some());
    }

    #[tokio::test]
    async fn health_does_not_require_api_key() {
        let pool = test_pool("a", 3);
        let app = build_router(test_app_state("http://unused", pool), 10);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn exhausted_pool_returns_503_without_calling_upstream() {
        // Unroutable upstream: a call would fail with a transport error, not 503.
        let pool = test_pool("bad-1", 1);
        pool.report_failure("bad-1", "HTTP 401");
        let app = build_router(test_app_state("http://127.0.0.1:1", pool), 10);

        let response = app
            .oneshot(authed("/v1/models"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "no_credential_available");
    }

    #[tokio::test]
    async fn unreachable_upstream_counts_as_failure() {
        let pool = test_pool("good-1", 1);
        let app = build_router(test_app_state("http://127.0.0.1:1", pool.clone()), 10);

        let response = app
            .oneshot(authed("/"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(!pool.credential(0).unwrap().active);
    }

    #[tokio::test]
    async fn health_reports_pool_state() {
        let pool = test_pool("a,b", 1);
        pool.report_failure("b", "HTTP 401");
        let app = build_router(test_app_state("http://unused", pool), 10);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["requests_served"], 0);
        assert_eq!(json["tokens"]["total"], 2);
        assert_eq!(json["tokens"]["active"], 1);
        assert_eq!(json["tokens"]["inactive"], 1);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_is_503_when_no_token_active() {
        let pool = test_pool("a", 1);
        pool.report_failure("a", "HTTP 401");
        let app = build_router(test_app_state("http://unused", pool), 10);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let (url, _server) = start_mock_upstream().await;
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let pool = test_pool("good-1", 3);
        let state = AppState::new(
            pool,
            url,
            Duration::from_secs(5),
            Secret::from(TEST_API_KEY),
            handle,
        );
        let app = build_router(state, 10);

        let response = app
            .clone()
            .oneshot(authed("/ping"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("proxy_requests_total"), "got: {text}");
        assert!(text.contains("token_pool_active 1"), "got: {text}");
    }

    #[tokio::test]
    async fn request_counter_tracks_proxied_requests() {
        let (url, _server) = start_mock_upstream().await;
        let pool = test_pool("good-1", 3);
        let state = test_app_state(&url, pool);
        let requests = state.metrics.requests_total.clone();
        let in_flight = state.metrics.in_flight.clone();
        let app = build_router(state, 10);

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(authed("/x"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(requests.load(Ordering::Relaxed), 3);
        assert_eq!(in_flight.load(Ordering::Relaxed), 0);
    }
}
