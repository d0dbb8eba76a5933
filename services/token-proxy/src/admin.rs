//! Admin API for token pool management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) so it is never
//! reachable through the proxy port.
//!
//! Endpoints:
//! - `GET /admin/tokens`: redacted per-token state
//! - `GET /admin/tokens/stats`: pool summary and failure histogram
//! - `GET /admin/tokens/{index}`: one token's state
//! - `POST /admin/tokens/reset/{index}`: clear one token's failures, reactivate
//! - `POST /admin/tokens/reset-all`: reset every failing or inactive token
//! - `POST /admin/tokens/reload`: rebuild from a new or re-read token list

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde::Deserialize;
use token_pool::Pool;
use tracing::{info, warn};

use crate::config::TokenSource;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
    token_source: TokenSource,
}

impl AdminState {
    pub fn new(pool: Arc<Pool>, token_source: TokenSource) -> Self {
        Self { pool, token_source }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/tokens", get(list_tokens))
        .route("/admin/tokens/stats", get(token_stats))
        .route("/admin/tokens/{index}", get(get_token))
        .route("/admin/tokens/reset/{index}", post(reset_token))
        .route("/admin/tokens/reset-all", post(reset_all_tokens))
        .route("/admin/tokens/reload", post(reload_tokens))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

fn error_body(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({
        "status": "error",
        "message": message.into(),
    })
}

/// GET /admin/tokens: never exposes token values.
async fn list_tokens(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "success",
            "data": state.pool.credentials(),
        }),
    )
}

/// GET /admin/tokens/stats
async fn token_stats(State(state): State<AdminState>) -> impl IntoResponse {
    let stats = state.pool.stats();
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "success",
            "pool_status": stats.status(),
            "data": stats,
        }),
    )
}

/// GET /admin/tokens/{index}
async fn get_token(
    State(state): State<AdminState>,
    Path(index): Path<usize>,
) -> impl IntoResponse {
    match state.pool.credential(index) {
        Some(info) => json_response(
            StatusCode::OK,
            serde_json::json!({ "status": "success", "data": info }),
        ),
        None => json_response(
            StatusCode::NOT_FOUND,
            error_body(format!("invalid token index: {index}")),
        ),
    }
}

/// POST /admin/tokens/reset/{index}
async fn reset_token(
    State(state): State<AdminState>,
    Path(index): Path<usize>,
) -> impl IntoResponse {
    if !state.pool.reset_one(index) {
        return json_response(
            StatusCode::BAD_REQUEST,
            error_body(format!("invalid token index: {index}")),
        );
    }
    crate::metrics::record_pool(&state.pool.stats());
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "success",
            "message": format!("token {index} reset"),
        }),
    )
}

/// POST /admin/tokens/reset-all
async fn reset_all_tokens(State(state): State<AdminState>) -> impl IntoResponse {
    let reset_count = state.pool.reset_all();
    crate::metrics::record_pool(&state.pool.stats());
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "success",
            "message": "all tokens reset",
            "reset_count": reset_count,
        }),
    )
}

/// Optional body for the reload endpoint.
#[derive(Debug, Default, Deserialize)]
struct ReloadRequest {
    #[serde(default)]
    tokens: Option<String>,
}

/// POST /admin/tokens/reload
///
/// Token list precedence: request body `tokens` > TOKEN_LIST / tokens_file
/// re-read > the list the pool was last built from. An empty list is rejected
/// and the running pool is left as it was.
async fn reload_tokens(State(state): State<AdminState>, body: Bytes) -> impl IntoResponse {
    let request: ReloadRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ReloadRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    error_body(format!("invalid reload request body: {e}")),
                );
            }
        }
    };

    let token_list = match request.tokens {
        Some(tokens) => Some(common::Secret::new(tokens)),
        None => match state.token_source.resolve() {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(error = %e, "token source unreadable, reload aborted");
                return json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_body(format!("reload failed: {e}")),
                );
            }
        },
    };

    let result = state
        .pool
        .reload(token_list.as_ref().map(|t| t.expose().as_str()));
    match result {
        Ok(summary) => {
            info!(
                previous = summary.previous,
                current = summary.current,
                "tokens reloaded via admin API"
            );
            let stats = state.pool.stats();
            crate::metrics::record_pool(&stats);
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "status": "success",
                    "message": "tokens reloaded",
                    "reload": summary,
                    "data": stats,
                }),
            )
        }
        Err(e) => json_response(
            StatusCode::BAD_REQUEST,
            error_body(format!("reload failed: {e}")),
        ),
    }
}
