//! Wire-level message and envelope types.
//!
//! `Envelope` is transport-neutral: it is what a [`crate::transport::Transport`]
//! delivers and publishes. The payload is an opaque JSON-like document —
//! the runtime only ever looks at `r#type` and whatever a saga's
//! correlation rule extracts from `payload`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Header reserved for the current retry attempt count (1-based).
pub const HEADER_ATTEMPT: &str = "x-saga-attempt";
/// Header reserved for the ISO-8601 timestamp of the first delivery attempt.
pub const HEADER_FIRST_SEEN: &str = "x-saga-first-seen";
/// Header reserved for the endpoint a DLQ'd message originated from.
pub const HEADER_ORIGINAL_ENDPOINT: &str = "x-saga-original-endpoint";
/// Header set on DLQ messages: the stringified error.
pub const HEADER_ERROR_MESSAGE: &str = "x-saga-error-message";
/// Header set on DLQ messages: the error's type/variant name.
pub const HEADER_ERROR_TYPE: &str = "x-saga-error-type";
/// W3C trace context headers, propagated by tracing middleware if present.
pub const HEADER_TRACEPARENT: &str = "traceparent";
pub const HEADER_TRACESTATE: &str = "tracestate";

/// Message type discriminator for the runtime-emitted timeout message
/// (spec §6).
pub const SAGA_TIMEOUT_EXPIRED: &str = "SagaTimeoutExpired";

/// Transport-level wrapping of a message with ID, headers, timestamp, and
/// routing hints (spec §3/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique delivery identifier (not the saga ID).
    pub id: Uuid,
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub r#type: String,
    /// Opaque payload; a saga's handler is the only code that knows its shape.
    pub payload: Value,
    /// String-keyed headers, including the runtime's reserved retry/DLQ/
    /// trace-context headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// When this envelope was created (not necessarily when it is delivered —
    /// delayed deliveries keep their original creation timestamp).
    pub timestamp: DateTime<Utc>,
    /// Routing hint used by partitioned transports to preserve best-effort
    /// per-key ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
}

impl Envelope {
    /// Build a new envelope with a fresh ID and the current timestamp.
    pub fn new(r#type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            r#type: r#type.into(),
            payload,
            headers: HashMap::new(),
            timestamp: Utc::now(),
            partition_key: None,
        }
    }

    /// Attach a partition key (builder style).
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Attach a header (builder style).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Current retry attempt count, defaulting to 1 per spec §4.7 step 3.
    pub fn attempt(&self) -> u32 {
        self.headers
            .get(HEADER_ATTEMPT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
    }

    /// First-seen timestamp, defaulting to this envelope's own timestamp.
    pub fn first_seen(&self) -> DateTime<Utc> {
        self.headers
            .get(HEADER_FIRST_SEEN)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(self.timestamp)
    }
}

/// Payload of the runtime-emitted `SagaTimeoutExpired` message (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaTimeoutExpiredPayload {
    pub saga_id: Uuid,
    pub saga_name: String,
    pub correlation_id: String,
    pub timeout_ms: u64,
    pub timeout_set_at: DateTime<Utc>,
}

impl SagaTimeoutExpiredPayload {
    /// Build the envelope the orchestrator publishes when a handler's
    /// `setTimeout` is persisted (spec §4.2 step 4h).
    pub fn into_envelope(self, timeout_ms: u64) -> Envelope {
        let partition_key = self.correlation_id.clone();
        let payload = serde_json::to_value(&self).expect("SagaTimeoutExpiredPayload is always serializable");
        Envelope::new(SAGA_TIMEOUT_EXPIRED, payload)
            .with_partition_key(partition_key)
            .with_header("x-saga-timeout-ms", timeout_ms.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_attempt_is_one() {
        let env = Envelope::new("OrderSubmitted", serde_json::json!({}));
        assert_eq!(env.attempt(), 1);
    }

    #[test]
    fn attempt_header_is_parsed() {
        let env = Envelope::new("OrderSubmitted", serde_json::json!({}))
            .with_header(HEADER_ATTEMPT, "3");
        assert_eq!(env.attempt(), 3);
    }

    #[test]
    fn first_seen_defaults_to_envelope_timestamp() {
        let env = Envelope::new("OrderSubmitted", serde_json::json!({}));
        assert_eq!(env.first_seen(), env.timestamp);
    }

    #[test]
    fn timeout_payload_round_trips_through_envelope() {
        let payload = SagaTimeoutExpiredPayload {
            saga_id: Uuid::new_v4(),
            saga_name: "order".to_string(),
            correlation_id: "o1".to_string(),
            timeout_ms: 60_000,
            timeout_set_at: Utc::now(),
        };
        let env = payload.clone().into_envelope(60_000);
        assert_eq!(env.r#type, SAGA_TIMEOUT_EXPIRED);
        assert_eq!(env.partition_key.as_deref(), Some("o1"));
        let decoded: SagaTimeoutExpiredPayload = serde_json::from_value(env.payload).unwrap();
        assert_eq!(decoded.saga_id, payload.saga_id);
    }
}
