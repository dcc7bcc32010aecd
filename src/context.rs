//! Per-delivery contexts: the handler-facing [`SagaContext`] and the
//! middleware-facing [`PipelineContext`].
//!
//! Per spec §9's design note, pending mutations (completion flag, timeout
//! set/clear, outbound publishes) are *value-returning* on a per-delivery
//! struct rather than heap-shared mutable state — the orchestrator core
//! applies them after the handler returns.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::message::{Envelope, PublishOptions};
use crate::state::SagaStateMetadata;

/// A pending outbound publish recorded by a handler via [`SagaContext::publish`]
/// or [`SagaContext::schedule`]. Applied by the orchestrator after the core
/// step completes (spec §4.2 step 4i — not transactional with the store write).
#[derive(Debug, Clone)]
pub struct PendingPublish {
    pub envelope: Envelope,
    pub options: PublishOptions,
}

/// Pending timeout mutation requested by a handler (spec §4.2 step 4f, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingTimeout {
    Set(u64),
    Clear,
}

/// Bounds a handler's `setTimeout` request must satisfy (spec §4.6, §6
/// `timeoutBounds`).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutBounds {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for TimeoutBounds {
    fn default() -> Self {
        Self {
            min_ms: 1_000,
            max_ms: 604_800_000,
        }
    }
}

/// Context handed to a saga's `handle`/`createInitialState` closures.
///
/// Captures the metadata the handler needs to answer `getTimeoutRemaining()`
/// accurately, and accumulates the pending mutations (`complete`,
/// `setTimeout`/`clearTimeout`, outbound publishes) that the orchestrator
/// applies once the handler returns.
pub struct SagaContext {
    saga_name: String,
    correlation_id: String,
    metadata: SagaStateMetadata,
    now: DateTime<Utc>,
    bounds: TimeoutBounds,
    is_completed: bool,
    pending_timeout: Option<PendingTimeout>,
    pending_publishes: Vec<PendingPublish>,
}

impl SagaContext {
    pub fn new(
        saga_name: impl Into<String>,
        correlation_id: impl Into<String>,
        metadata: SagaStateMetadata,
        now: DateTime<Utc>,
        bounds: TimeoutBounds,
    ) -> Self {
        Self {
            saga_name: saga_name.into(),
            correlation_id: correlation_id.into(),
            metadata,
            now,
            bounds,
            is_completed: false,
            pending_timeout: None,
            pending_publishes: Vec::new(),
        }
    }

    pub fn saga_name(&self) -> &str {
        &self.saga_name
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn saga_id(&self) -> Uuid {
        self.metadata.saga_id
    }

    /// Mark the instance terminal. Equivalent to the handler returning
    /// `isCompleted: true`.
    pub fn complete(&mut self) {
        self.is_completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// Request a new active timeout. Fails with
    /// [`OrchestratorError::InvalidTimeout`] if `ms` is outside
    /// `[minMs, maxMs]` (spec §4.6, §8 boundary behaviors).
    pub fn set_timeout(&mut self, ms: u64) -> Result<(), OrchestratorError> {
        if ms < self.bounds.min_ms || ms > self.bounds.max_ms {
            return Err(OrchestratorError::InvalidTimeout {
                ms,
                min_ms: self.bounds.min_ms,
                max_ms: self.bounds.max_ms,
            });
        }
        self.pending_timeout = Some(PendingTimeout::Set(ms));
        Ok(())
    }

    /// Clear any active timeout. Does not recall an already-scheduled
    /// `SagaTimeoutExpired` delivery (spec §4.6) — timeout handlers must
    /// guard against stale deliveries.
    pub fn clear_timeout(&mut self) {
        self.pending_timeout = Some(PendingTimeout::Clear);
    }

    /// Remaining time on the active timeout: pending change in this
    /// context takes precedence over the persisted metadata (spec §4.6).
    pub fn timeout_remaining(&self) -> Option<chrono::Duration> {
        match self.pending_timeout {
            Some(PendingTimeout::Clear) => None,
            Some(PendingTimeout::Set(ms)) => Some(chrono::Duration::milliseconds(ms as i64)),
            None => self.metadata.timeout_remaining(self.now),
        }
    }

    /// Record an outbound publish. Issued during handler execution; not
    /// transactional with the store write (spec §4.2 step 4i, §9).
    pub fn publish(&mut self, envelope: Envelope, options: PublishOptions) {
        self.pending_publishes.push(PendingPublish { envelope, options });
    }

    /// Convenience for publishing to a named endpoint with no extra options.
    pub fn publish_to(&mut self, endpoint: impl Into<String>, envelope: Envelope) {
        self.publish(envelope, PublishOptions::to(endpoint));
    }

    pub(crate) fn pending_timeout(&self) -> Option<PendingTimeout> {
        self.pending_timeout
    }

    pub(crate) fn take_pending_publishes(&mut self) -> Vec<PendingPublish> {
        std::mem::take(&mut self.pending_publishes)
    }
}

/// Mutable context threaded through the middleware pipeline (spec §4.3).
///
/// Middleware may read/alter `metadata` (a scratch map, not the persisted
/// state's metadata), observe `pre_state`/`post_state` after `next()`
/// returns, and call `set_trace_context` prior to instance creation to
/// have it captured in initial metadata.
pub struct PipelineContext {
    pub envelope: Envelope,
    pub saga_name: String,
    pub correlation_id: String,
    pub existing_state: Option<crate::state::SagaState>,
    /// Scratch metadata for middleware to pass data between stages
    /// (distinct from [`SagaStateMetadata`]).
    pub metadata: HashMap<String, String>,
    trace_parent: Option<String>,
    trace_state: Option<String>,
    /// Populated by the orchestrator core once it has determined the
    /// instance identity (fresh or existing).
    pub saga_id: Option<Uuid>,
    /// Populated after the core step: the state before the handler ran.
    pub pre_state: Option<crate::state::SagaState>,
    /// Populated after the core step: the state persisted by the handler.
    pub post_state: Option<crate::state::SagaState>,
    /// Populated if the core step raised an error.
    pub error: Option<String>,
}

impl PipelineContext {
    pub fn new(
        envelope: Envelope,
        saga_name: impl Into<String>,
        correlation_id: impl Into<String>,
        existing_state: Option<crate::state::SagaState>,
    ) -> Self {
        Self {
            envelope,
            saga_name: saga_name.into(),
            correlation_id: correlation_id.into(),
            existing_state,
            metadata: HashMap::new(),
            trace_parent: None,
            trace_state: None,
            saga_id: None,
            pre_state: None,
            post_state: None,
            error: None,
        }
    }

    /// Middleware hook: set trace context to be captured in a freshly
    /// created instance's metadata (spec §4.3). Has no effect once the
    /// instance already exists.
    pub fn set_trace_context(&mut self, trace_parent: impl Into<String>, trace_state: Option<String>) {
        self.trace_parent = Some(trace_parent.into());
        self.trace_state = trace_state;
    }

    pub(crate) fn trace_context(&self) -> (Option<String>, Option<String>) {
        (self.trace_parent.clone(), self.trace_state.clone())
    }
}
