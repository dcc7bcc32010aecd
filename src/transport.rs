//! Pluggable broker connectivity: subscribe/publish with delayed delivery,
//! headers, and partition keys (spec §4.5).

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::message::Envelope;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Handler invoked by a [`Transport`] for each delivered envelope.
///
/// Implemented by the bus runtime's dispatcher (see [`crate::bus`]); a
/// transport should never need its own implementation of this trait.
pub trait DeliveryHandler: Send + Sync {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, ()>;
}

/// Subscription parameters.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Endpoint to subscribe to (by default, the message type).
    pub endpoint: String,
    /// Maximum number of concurrently in-flight deliveries for this
    /// subscription.
    pub concurrency: usize,
}

impl SubscribeOptions {
    pub fn new(endpoint: impl Into<String>, concurrency: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            concurrency: concurrency.max(1),
        }
    }
}

/// Publish parameters.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Destination endpoint. Defaults to the message's own `type` when `None`.
    pub endpoint: Option<String>,
    /// Extra headers to merge into the envelope before it is handed to the
    /// transport (existing envelope headers win on conflict).
    pub headers: Option<std::collections::HashMap<String, String>>,
    /// Defer delivery by at least this many milliseconds.
    pub delay_ms: Option<u64>,
    /// Routing hint for best-effort per-key ordering.
    pub partition_key: Option<String>,
}

impl PublishOptions {
    pub fn to(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Default::default()
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
        self
    }
}

/// Subscribe/publish with delayed delivery, headers, and partition key.
///
/// Implementations: a real broker driver (AMQP, Kafka, ...), or
/// [`crate::testing::MemoryTransport`] for tests. Per spec §4.5,
/// per-partition-key ordering is best-effort only; correctness depends on
/// the store's expected-version check, not transport ordering.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the transport (establish connections, begin polling, ...).
    async fn start(&self) -> Result<()>;

    /// Stop the transport, releasing any held resources.
    async fn stop(&self) -> Result<()>;

    /// Subscribe to an endpoint. `handler` is invoked for each delivered
    /// envelope; the fan-out to multiple orchestrators happens once per
    /// `subscribe` call at the bus level (see [`crate::bus::Bus`]).
    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()>;

    /// Publish an envelope, at-least-once. `delayMs` defers delivery by at
    /// least that duration.
    async fn publish(&self, envelope: Envelope, options: PublishOptions) -> Result<()>;
}
