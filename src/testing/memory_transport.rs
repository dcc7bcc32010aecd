//! In-memory [`Transport`] for tests, grounded on the teacher crate's
//! `bus::mock::MockEventBus`: a recorded publish log plus a fault-injection
//! switch, extended here with delayed-delivery support so timeout
//! scenarios (spec §4.6) are exercisable without a real broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::message::Envelope;
use crate::transport::{DeliveryHandler, PublishOptions, Result, SubscribeOptions, Transport, TransportError};

/// Single-process `Transport`: publishes are delivered in-task to whatever
/// handler is subscribed to the destination endpoint, optionally after a
/// `tokio::time::sleep` to honor `PublishOptions::delay_ms`.
pub struct MemoryTransport {
    subscriptions: RwLock<HashMap<String, Arc<dyn DeliveryHandler>>>,
    published: Mutex<Vec<Envelope>>,
    fail_on_publish: AtomicBool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            fail_on_publish: AtomicBool::new(false),
        }
    }

    /// Every envelope handed to `publish`, in call order, regardless of
    /// whether a subscriber existed to receive it.
    pub fn published(&self) -> Vec<Envelope> {
        self.published.lock().unwrap().clone()
    }

    /// Make every subsequent `publish` call fail, to exercise transport
    /// error propagation.
    pub fn fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe(
        &self,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()> {
        self.subscriptions
            .write()
            .unwrap()
            .insert(options.endpoint, handler);
        Ok(())
    }

    async fn publish(&self, envelope: Envelope, options: PublishOptions) -> Result<()> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("simulated publish failure".to_string()));
        }
        self.published.lock().unwrap().push(envelope.clone());

        let mut envelope = envelope;
        if let Some(headers) = options.headers {
            for (key, value) in headers {
                envelope.headers.entry(key).or_insert(value);
            }
        }
        if let Some(partition_key) = options.partition_key {
            envelope.partition_key = Some(partition_key);
        }
        let endpoint = options.endpoint.unwrap_or_else(|| envelope.r#type.clone());

        let handler = self.subscriptions.read().unwrap().get(&endpoint).cloned();
        let Some(handler) = handler else {
            return Ok(());
        };

        match options.delay_ms.filter(|ms| *ms > 0) {
            Some(delay_ms) => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    handler.handle(envelope).await;
                });
            }
            None => handler.handle(envelope).await,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler(Arc<AtomicUsize>);

    impl DeliveryHandler for CountingHandler {
        fn handle(&self, _envelope: Envelope) -> BoxFuture<'static, ()> {
            let count = self.0.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscriber_is_recorded_but_not_delivered() {
        let transport = MemoryTransport::new();
        transport
            .publish(Envelope::new("X", serde_json::json!({})), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn publish_delivers_immediately_with_no_delay() {
        let transport = MemoryTransport::new();
        let count = Arc::new(AtomicUsize::new(0));
        transport
            .subscribe(
                SubscribeOptions::new("X", 1),
                Arc::new(CountingHandler(count.clone())),
            )
            .await
            .unwrap();
        transport
            .publish(Envelope::new("X", serde_json::json!({})), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fail_on_publish_rejects_subsequent_calls() {
        let transport = MemoryTransport::new();
        transport.fail_on_publish(true);
        let err = transport
            .publish(Envelope::new("X", serde_json::json!({})), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Publish(_)));
    }

    #[tokio::test]
    async fn delayed_publish_delivers_after_sleep() {
        tokio::time::pause();
        let transport = MemoryTransport::new();
        let count = Arc::new(AtomicUsize::new(0));
        transport
            .subscribe(
                SubscribeOptions::new("X", 1),
                Arc::new(CountingHandler(count.clone())),
            )
            .await
            .unwrap();
        transport
            .publish(
                Envelope::new("X", serde_json::json!({})),
                PublishOptions::default().with_delay_ms(1_000),
            )
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::advance(Duration::from_millis(1_001)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
