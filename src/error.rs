// src/error.rs
// Standardized error types for Vellum

use thiserror::Error;

/// Main error type for the Vellum library
#[derive(Error, Debug)]
pub enum VellumError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vector table missing")]
    VecTableMissing,

    #[error("vector dimension mismatch: expected {expected}, received {received}")]
    VecDimensionMismatch { expected: usize, received: usize },

    #[error("vector index error: {0}")]
    VecIndex(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("provider rate limited")]
    ProviderRateLimited,

    #[error("malformed provider response: {0}")]
    ProviderMalformedResponse(String),

    #[error("stream cancelled")]
    Cancelled,

    #[error("resource loader failed: {0}")]
    ResourceLoaderFailed(String),

    #[error("resource summary generation failed: {0}")]
    ResourceSummaryFailed(String),

    #[error("context update conflict: conversation changed while summarizing")]
    ContextStaleConflict,

    #[error("context summary failed: {0}")]
    ContextSummaryFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using VellumError
pub type Result<T> = std::result::Result<T, VellumError>;

impl From<String> for VellumError {
    fn from(s: String) -> Self {
        VellumError::Other(s)
    }
}

impl From<tokio::task::JoinError> for VellumError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            VellumError::Cancelled
        } else {
            VellumError::Other(err.to_string())
        }
    }
}

impl From<VellumError> for String {
    fn from(err: VellumError) -> Self {
        err.to_string()
    }
}

impl VellumError {
    /// Whether this error corrupts nothing and only degrades background
    /// maintenance (log-and-continue territory).
    pub fn is_background_degradation(&self) -> bool {
        matches!(
            self,
            VellumError::ContextStaleConflict
                | VellumError::ContextSummaryFailed(_)
                | VellumError::ResourceLoaderFailed(_)
                | VellumError::ResourceSummaryFailed(_)
        )
    }
}
