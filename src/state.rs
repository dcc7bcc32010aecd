//! Saga instance state and its mandatory metadata envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Mandatory envelope carried by every persisted saga state (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SagaStateMetadata {
    /// Globally unique instance identity, stable for the life of the instance.
    pub saga_id: Uuid,
    /// Monotonically increasing version, incremented on every successful
    /// persisted update. Initial creation persists with version 0.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Once true the instance is terminal; future messages for it are dropped.
    pub is_completed: bool,
    /// Single active timeout, if any (spec §4.6).
    pub timeout_ms: Option<u64>,
    pub timeout_expires_at: Option<DateTime<Utc>>,
    /// Trace context captured at instance creation, if tracing middleware
    /// set it before the instance was inserted.
    pub trace_parent: Option<String>,
    pub trace_state: Option<String>,
}

impl SagaStateMetadata {
    /// Metadata for a brand-new instance: version 0, not completed, no
    /// active timeout, optionally carrying trace context captured by
    /// middleware prior to creation.
    pub fn new_instance(
        saga_id: Uuid,
        now: DateTime<Utc>,
        trace_parent: Option<String>,
        trace_state: Option<String>,
    ) -> Self {
        Self {
            saga_id,
            version: 0,
            created_at: now,
            updated_at: now,
            is_completed: false,
            timeout_ms: None,
            timeout_expires_at: None,
            trace_parent,
            trace_state,
        }
    }

    /// Remaining time on the active timeout, if any, relative to `now`.
    /// Returns `None` if there is no active timeout or it has already
    /// expired.
    pub fn timeout_remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.timeout_expires_at.and_then(|expires_at| {
            let remaining = expires_at - now;
            if remaining > chrono::Duration::zero() {
                Some(remaining)
            } else {
                None
            }
        })
    }
}

/// User-shaped saga state; the runtime treats `data` as opaque and only
/// overlays/reads `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaState {
    pub metadata: SagaStateMetadata,
    /// Opaque, saga-defined state payload.
    pub data: Value,
}

impl SagaState {
    pub fn new(metadata: SagaStateMetadata, data: Value) -> Self {
        Self { metadata, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_starts_at_version_zero_and_not_completed() {
        let now = Utc::now();
        let meta = SagaStateMetadata::new_instance(Uuid::new_v4(), now, None, None);
        assert_eq!(meta.version, 0);
        assert!(!meta.is_completed);
        assert_eq!(meta.created_at, now);
        assert_eq!(meta.updated_at, now);
    }

    #[test]
    fn timeout_remaining_is_none_when_expired() {
        let now = Utc::now();
        let mut meta = SagaStateMetadata::new_instance(Uuid::new_v4(), now, None, None);
        meta.timeout_expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(meta.timeout_remaining(now).is_none());
    }

    #[test]
    fn timeout_remaining_is_some_when_active() {
        let now = Utc::now();
        let mut meta = SagaStateMetadata::new_instance(Uuid::new_v4(), now, None, None);
        meta.timeout_ms = Some(60_000);
        meta.timeout_expires_at = Some(now + chrono::Duration::milliseconds(60_000));
        let remaining = meta.timeout_remaining(now).unwrap();
        assert_eq!(remaining.num_milliseconds(), 60_000);
    }
}
