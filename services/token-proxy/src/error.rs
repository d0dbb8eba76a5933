//! Upstream attempt errors
//!
//! Every variant counts as a failure of the token used for the attempt;
//! `Status` is only built for statuses that implicate the token (401, 403,
//! 429, 5xx). They never leave the request path as Rust errors: the proxy
//! handler turns the final one into a JSON error response.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream timeout after {0}s")]
    Timeout(u64),

    #[error("upstream connection failed: {0}")]
    Transport(String),

    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream response read error: {0}")]
    Body(String),

    #[error("token cannot be sent as a header value: {0}")]
    InvalidToken(String),
}

impl UpstreamError {
    /// Metric label for `proxy_upstream_errors_total`.
    pub fn error_type(&self) -> &'static str {
        match self {
            UpstreamError::Timeout(_) => "timeout",
            UpstreamError::Transport(_) => "connection",
            UpstreamError::Status { .. } => "status",
            UpstreamError::Body(_) => "body",
            UpstreamError::InvalidToken(_) => "invalid_token",
        }
    }
}

/// Longest upstream body excerpt kept in an error message.
const MAX_BODY_EXCERPT: usize = 512;

/// Truncate an upstream error body on a char boundary for logs and responses.
pub fn body_excerpt(body: &str) -> String {
    if body.len() <= MAX_BODY_EXCERPT {
        return body.to_string();
    }
    let mut end = MAX_BODY_EXCERPT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
