//! Pluggable, versioned saga-state persistence (spec §4.4).
//!
//! Stores must implement these semantics via whatever native primitive
//! they have (SQL `UPDATE ... WHERE version=?`, document conditional
//! updates, KV compare-and-swap). The state payload is serialized as an
//! opaque JSON-like document; metadata fields may be projected to
//! columns/indices for query helpers, but the canonical truth is the
//! serialized state.

use async_trait::async_trait;
use uuid::Uuid;

use crate::state::SagaState;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `insert` found an existing row for `(saga_name, correlation_id)`.
    #[error("duplicate correlation: saga {saga_name:?}, correlation {correlation_id:?}")]
    DuplicateCorrelation {
        saga_name: String,
        correlation_id: String,
    },

    /// `update`'s expected version did not match the stored version.
    #[error("concurrency violation for saga {saga_id}: expected {expected}, actual {actual}")]
    ConcurrencyViolation {
        saga_id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// No row found for the given identity.
    #[error("saga not found: {0}")]
    NotFound(String),

    /// Any other backend-specific failure (connection loss, serialization
    /// failure, etc.), carried as an opaque, transport-agnostic message.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Versioned saga-state persistence.
///
/// Implementations: a real adapter backed by SQL/document/KV storage, or
/// [`crate::testing::MemoryStore`] for tests.
#[async_trait]
pub trait Store: Send + Sync {
    /// Look up an instance by its stable identity.
    async fn get_by_id(&self, saga_name: &str, saga_id: Uuid) -> Result<Option<SagaState>>;

    /// Look up an instance by its correlation key.
    async fn get_by_correlation_id(
        &self,
        saga_name: &str,
        correlation_id: &str,
    ) -> Result<Option<SagaState>>;

    /// Create a new instance. Fails with [`StoreError::DuplicateCorrelation`]
    /// if `(saga_name, correlation_id)` already has a row.
    async fn insert(&self, saga_name: &str, correlation_id: &str, state: SagaState) -> Result<()>;

    /// Atomically update an existing instance. The stored row's version
    /// must equal `expected_version`; on success the row's state and
    /// version become `state`/`state.metadata.version`. Mismatch fails
    /// with [`StoreError::ConcurrencyViolation`].
    async fn update(&self, saga_name: &str, state: SagaState, expected_version: u64) -> Result<()>;

    /// Remove an instance. Store-local concern (garbage collection of
    /// completed instances); not invoked by the orchestrator core.
    async fn delete(&self, saga_name: &str, saga_id: Uuid) -> Result<()>;
}
