//! Error types for pool operations

/// Errors from pool construction and reload.
///
/// Every other pool operation is total: unknown tokens, out-of-range ordinals
/// and an exhausted pool are reported through return values, not errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
