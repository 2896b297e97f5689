use std::time::Duration;

/// Crate-wide error taxonomy for the intake pipeline.
///
/// Every fallible pipeline operation ultimately reports one of these classes,
/// so the executor can decide uniformly whether a failure is worth retrying.
/// Variants carry rendered messages rather than source errors: results are
/// shared between deduplicated callers and must be `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// Bad input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network/5xx-class failure. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The recognition service rejected the request (content safety, bad
    /// payload). Terminal for the item, never retried.
    #[error("recognition rejected: {0}")]
    Recognition(String),

    /// Circuit breaker is open for this operation key; the call failed fast
    /// without invoking the underlying operation.
    #[error("circuit open for operation `{key}`")]
    CircuitOpen { key: String },

    /// Per-call timeout elapsed. Treated like a transient network failure.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Record store failure.
    #[error("datastore error: {0}")]
    Database(String),
}

impl PipelineError {
    /// Default retry classification used by the executor when the caller
    /// supplies no predicate of its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return Self::Transient(e.to_string());
        }
        match e.status() {
            Some(status) if status.is_server_error() => Self::Transient(e.to_string()),
            Some(_) => Self::Validation(e.to_string()),
            None => Self::Transient(e.to_string()),
        }
    }
}
