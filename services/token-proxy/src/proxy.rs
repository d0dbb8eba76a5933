//! Upstream dispatch with token failover
//!
//! Receives inbound requests, strips hop-by-hop and client auth headers,
//! and forwards the body opaquely to the upstream URL with a pooled token as
//! the Bearer credential. Transport errors, timeouts, 401, 403, 429 and 5xx
//! responses count against the token and the next token is tried, up to the
//! pool size. Any other response, including client errors such as 400 or 404,
//! goes back to the caller as-is.
//!
//! Callers must present `Authorization: Bearer <api_key>`; the key is checked
//! before any token is taken from the pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use common::Secret;
use subtle::ConstantTimeEq;
use axum::response::{IntoResponse, Response};
use token_pool::{AcquiredCredential, DispatchError, Pool};
use tracing::{error, info, instrument, warn};

use crate::error::{UpstreamError, body_excerpt};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Maximum inbound request body size.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub timeout: Duration,
    pub pool: Arc<Pool>,
    /// Key inbound callers must present as their Bearer token
    pub api_key: Secret<String>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Decrements the in-flight counter when the request future completes or is
/// dropped mid-flight.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Buffered upstream response that is returned to the caller.
struct UpstreamResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Proxy one inbound request, failing over across pooled tokens.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::enter(&state.in_flight);
    let started = Instant::now();
    let method = request.method().clone();

    let response = if is_authorized(request.headers(), &state.api_key) {
        forward(state, request, &request_id).await
    } else {
        warn!("rejected request with missing or invalid API key");
        error_response(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "missing or invalid API key",
            &request_id,
        )
    };
    if !response.status().is_success() {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    crate::metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    crate::metrics::record_pool(&state.pool.stats());
    response
}

async fn forward(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: &str,
) -> Response {
    let method = request.method().clone();
    let upstream_url = match request.uri().path_and_query() {
        Some(pq) => format!("{}{}", state.upstream_url.trim_end_matches('/'), pq),
        None => state.upstream_url.clone(),
    };

    let mut headers = HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str())
            && name != axum::http::header::HOST
            && name != axum::http::header::AUTHORIZATION
        {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };

    let timeout_secs = state.timeout.as_secs();
    let outcome = token_pool::dispatch(&state.pool, |credential| {
        let attempt = build_attempt(state, &method, &upstream_url, &headers, &body, &credential);
        async move {
            let result = match attempt {
                Ok(request) => send_attempt(request, timeout_secs).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                crate::metrics::record_upstream_error(e.error_type());
            }
            result
        }
    })
    .await;

    match outcome {
        Ok(upstream) => {
            info!(status = upstream.status.as_u16(), "upstream response forwarded");
            let mut response = Response::builder().status(upstream.status);
            for (name, value) in &upstream.headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(axum::body::Body::from(upstream.body))
                .unwrap_or_else(|e| {
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "proxy_error",
                        &format!("response build error: {e}"),
                        request_id,
                    )
                })
        }
        Err(DispatchError::NoCredential { attempts }) => {
            warn!(attempts, "no active upstream token available");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_credential_available",
                "no active upstream token available, retry later",
                request_id,
            )
        }
        Err(DispatchError::Exhausted {
            attempts,
            last_error,
        }) => {
            error!(attempts, error = %last_error, "all upstream attempts failed");
            let status = match last_error {
                UpstreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            error_response(
                status,
                "upstream_error",
                &format!("{attempts} attempt(s) failed, last error: {last_error}"),
                request_id,
            )
        }
    }
}

/// Prepare one upstream attempt carrying `credential` as the Bearer token.
fn build_attempt(
    state: &ProxyState,
    method: &Method,
    upstream_url: &str,
    headers: &HeaderMap,
    body: &Bytes,
    credential: &AcquiredCredential,
) -> Result<reqwest::RequestBuilder, UpstreamError> {
    let mut headers = headers.clone();
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", credential.token.expose()))
        .map_err(|e| UpstreamError::InvalidToken(format!("ordinal {}: {e}", credential.ordinal)))?;
    auth.set_sensitive(true);
    headers.insert(axum::http::header::AUTHORIZATION, auth);

    Ok(state
        .client
        .request(method.clone(), upstream_url)
        .headers(headers)
        .timeout(state.timeout)
        .body(body.clone()))
}

async fn send_attempt(
    request: reqwest::RequestBuilder,
    timeout_secs: u64,
) -> Result<UpstreamResponse, UpstreamError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            UpstreamError::Timeout(timeout_secs)
        } else {
            UpstreamError::Transport(e.to_string())
        }
    })?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            UpstreamError::Timeout(timeout_secs)
        } else {
            UpstreamError::Body(e.to_string())
        }
    })?;

    if is_token_failure(status) {
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            body: body_excerpt(&String::from_utf8_lossy(&body)),
        });
    }

    Ok(UpstreamResponse {
        status,
        headers,
        body,
    })
}

/// Whether an upstream status says the token itself was rejected or the
/// upstream could not serve it. Other statuses are the caller's outcome.
pub fn is_token_failure(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
        )
}

/// Constant-time check of the inbound `Authorization: Bearer <key>` header.
fn is_authorized(headers: &HeaderMap, api_key: &Secret<String>) -> bool {
    let Some(presented) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    presented
        .trim()
        .as_bytes()
        .ct_eq(api_key.expose().as_bytes())
        .into()
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
