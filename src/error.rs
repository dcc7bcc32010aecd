//! Shared error taxonomy for the orchestrator core.
//!
//! Every failure that can surface out of a handler, the middleware pipeline,
//! or a store/transport adapter is folded into [`OrchestratorError`] before
//! it reaches the bus dispatcher, which classifies it into retry/DLQ/drop
//! (see [`crate::bus`]).

use std::fmt;

use crate::store::StoreError;

/// Errors produced or recognized by the orchestrator core.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The store's expected-version update found a different version than
    /// the caller expected. Classified transient by the default classifier.
    #[error("concurrency violation for saga {saga_id}: expected version {expected}, found {actual}")]
    ConcurrencyViolation {
        saga_id: uuid::Uuid,
        expected: u64,
        actual: u64,
    },

    /// Explicit opt-in by a handler or middleware signalling a retryable
    /// failure (e.g. a downstream call timed out).
    #[error("transient error: {0}")]
    Transient(String),

    /// A handler requested a timeout outside `[minMs, maxMs]`.
    /// Permanent by default (routes to DLQ).
    #[error("invalid timeout: {ms}ms is outside the bound [{min_ms}, {max_ms}]")]
    InvalidTimeout { ms: u64, min_ms: u64, max_ms: u64 },

    /// A handler or middleware rejected the message on validation grounds.
    /// Permanent by default.
    #[error("validation error: {0}")]
    Validation(String),

    /// Error escaping a user-supplied handler closure. Permanent by default
    /// unless the classifier recognizes the inner error as transient.
    #[error("handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A failure surfaced by the pluggable [`crate::store::Store`],
    /// including `insert`'s `DuplicateCorrelation` (another worker likely
    /// won the race to create the instance; a retry will find it via
    /// `getByCorrelationId`) and `update`'s `ConcurrencyViolation`.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A failure surfaced by the pluggable [`crate::transport::Transport`].
    #[error("transport error: {0}")]
    Transport(String),
}

impl OrchestratorError {
    /// Built-in transience classification, per spec §4.7 step 2.
    ///
    /// The bus's pluggable [`crate::bus::ErrorClassifier`] may override this;
    /// it is also consulted by the default classifier.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::ConcurrencyViolation { .. } => true,
            OrchestratorError::Transient(_) => true,
            OrchestratorError::Store(StoreError::ConcurrencyViolation { .. }) => true,
            OrchestratorError::Store(StoreError::DuplicateCorrelation { .. }) => true,
            OrchestratorError::InvalidTimeout { .. } => false,
            OrchestratorError::Validation(_) => false,
            OrchestratorError::Handler(e) => is_transient_message(&e.to_string()),
            OrchestratorError::Store(_) => false,
            OrchestratorError::Transport(msg) => is_transient_message(msg),
        }
    }
}

/// Matches the transient-pattern set from spec §4.7: network refused/reset/
/// timeout, socket hang-up, host unreachable.
pub(crate) fn is_transient_message(message: &str) -> bool {
    const PATTERNS: &[&str] = &[
        "connection refused",
        "connection reset",
        "timed out",
        "timeout",
        "socket hang up",
        "host unreachable",
        "network unreachable",
    ];
    let lower = message.to_ascii_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}

/// Convenience helper for handlers to construct a boxed [`OrchestratorError::Handler`].
pub fn handler_error<E>(err: E) -> OrchestratorError
where
    E: std::error::Error + Send + Sync + 'static,
{
    OrchestratorError::Handler(Box::new(err))
}

/// Simple string-based handler error for cases that don't warrant a
/// dedicated error type.
#[derive(Debug)]
pub struct StringError(pub String);

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StringError {}

impl From<String> for OrchestratorError {
    fn from(message: String) -> Self {
        OrchestratorError::Handler(Box::new(StringError(message)))
    }
}

impl From<&str> for OrchestratorError {
    fn from(message: &str) -> Self {
        OrchestratorError::from(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_violation_is_transient() {
        let e = OrchestratorError::ConcurrencyViolation {
            saga_id: uuid::Uuid::nil(),
            expected: 1,
            actual: 2,
        };
        assert!(e.is_transient());
    }

    #[test]
    fn invalid_timeout_is_permanent() {
        let e = OrchestratorError::InvalidTimeout {
            ms: 0,
            min_ms: 1000,
            max_ms: 604_800_000,
        };
        assert!(!e.is_transient());
    }

    #[test]
    fn transient_pattern_match_is_case_insensitive() {
        assert!(is_transient_message("Connection Refused by peer"));
        assert!(is_transient_message("socket hang up"));
        assert!(!is_transient_message("invalid field 'total'"));
    }
}
