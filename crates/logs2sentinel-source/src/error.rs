//! Source-side error classification
//!
//! opendal error kinds are folded into the pipeline taxonomy here, so the
//! retry controller and per-object failure accounting see uniform
//! categories regardless of the underlying store.

use logs2sentinel_core::{ParseError, Retryable};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("store rate limited: {0}")]
    RateLimited(String),

    #[error("store timeout: {0}")]
    Timeout(String),

    #[error("transient store error: {0}")]
    Transient(String),

    #[error("terminal store error: {0}")]
    Terminal(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("batch handler failed: {0}")]
    Handler(String),

    #[error("rate limiter: {0}")]
    Admission(#[from] logs2sentinel_resilience::RateLimitError),
}

impl SourceError {
    /// Fold an opendal error into the taxonomy. SlowDown/Throttling-class
    /// responses surface as `RateLimited`; anything the store marks
    /// temporary (InternalError, ServiceUnavailable, connection resets) is
    /// `Transient`.
    pub fn from_opendal(context: &str, e: opendal::Error) -> Self {
        let message = format!("{context}: {e}");
        match e.kind() {
            opendal::ErrorKind::NotFound => SourceError::NotFound(message),
            opendal::ErrorKind::PermissionDenied => SourceError::AccessDenied(message),
            opendal::ErrorKind::RateLimited => SourceError::RateLimited(message),
            opendal::ErrorKind::ConfigInvalid | opendal::ErrorKind::Unsupported => {
                SourceError::Terminal(message)
            }
            _ if e.is_temporary() => SourceError::Transient(message),
            _ => SourceError::Terminal(message),
        }
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::RateLimited(_) | SourceError::Timeout(_) | SourceError::Transient(_)
        )
    }
}
