//! Error taxonomy shared across the pipeline
//!
//! Every remote-facing crate maps its failures onto this classification so
//! retry budgets and circuit breakers treat them uniformly:
//!
//! | category        | disposition                                   |
//! |-----------------|-----------------------------------------------|
//! | InvalidArgument | terminal to the caller, never retried         |
//! | NotFound        | terminal, per-object failure                  |
//! | Timeout         | retryable, counts toward the breaker          |
//! | RemoteTransient | retryable, counts toward the breaker          |
//! | RemoteTerminal  | non-retryable, counts toward the breaker      |
//! | ParseError      | non-retryable, per-object drop                |

use thiserror::Error;

/// Retryability classification for the retry controller.
///
/// Types that do not implement this are treated as non-retryable by callers
/// that need a default.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Raised when raw object bytes cannot be decoded into a record.
///
/// Always non-retryable: the input will not get better on a second attempt.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid UTF-8 in log line: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("unable to parse timestamp: {0}")]
    Timestamp(String),

    #[error("invalid field value for {field}: {message}")]
    Field { field: String, message: String },

    #[error("invalid JSON format: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON payload exceeds maximum size: {size} bytes > {max_size} bytes")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("JSON nesting depth exceeds maximum: {depth} levels > {max_depth} levels")]
    TooDeep { depth: usize, max_depth: usize },

    #[error("JSON payload is not an object")]
    NotAnObject,

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("field {field} expected {expected}, got {actual}")]
    SchemaType {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl Retryable for ParseError {
    fn is_retryable(&self) -> bool {
        false
    }
}
