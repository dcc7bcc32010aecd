//! Bus runtime: wires sagas to a transport and store, fans inbound
//! messages out to every saga that handles them, and owns the retry/DLQ
//! engine (spec §2.7, §4.7, §6).

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::clock::{Clock, SystemClock};
use crate::context::TimeoutBounds;
use crate::definition::SagaDefinition;
use crate::error::OrchestratorError;
use crate::message::{
    Envelope, HEADER_ATTEMPT, HEADER_ERROR_MESSAGE, HEADER_ERROR_TYPE, HEADER_FIRST_SEEN,
    HEADER_ORIGINAL_ENDPOINT,
};
use crate::middleware::MiddlewarePipeline;
use crate::orchestrator::Orchestrator;
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::transport::{DeliveryHandler, PublishOptions, SubscribeOptions, Transport};

/// Decides whether a failure should be redelivered or routed to the DLQ.
/// The default delegates to [`OrchestratorError::is_transient`]; a custom
/// implementation can recognize additional backend-specific error strings.
pub trait ErrorClassifier: Send + Sync {
    fn is_transient(&self, err: &OrchestratorError) -> bool;
}

/// Classifier that trusts each error variant's built-in transience.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorClassifier;

impl ErrorClassifier for DefaultErrorClassifier {
    fn is_transient(&self, err: &OrchestratorError) -> bool {
        err.is_transient()
    }
}

/// Per-saga overrides of the bus-wide worker defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SagaWorkerConfig {
    pub concurrency: Option<usize>,
    pub retry_policy: Option<RetryPolicy>,
}

/// `worker.*` settings from spec.md §6, deserializable so a host application
/// can embed it in its own configuration rather than assembling a [`Bus`]
/// only by hand. Grounded on the teacher crate's `config::messaging::MessagingConfig`
/// (a `#[serde(default)]` config struct with a hand-written `Default` impl
/// mirroring the spec's literal defaults, rather than deriving `Default` and
/// drifting from them).
///
/// `dlqNaming` is the one spec.md §6 option this struct cannot carry: it is
/// a function (`endpoint -> dlqEndpoint`), not data. `dlq_suffix` covers the
/// documented default (`".dlq"` suffix); a host needing a different naming
/// scheme configures it via [`BusBuilder::with_dlq_suffix`] or a custom
/// endpoint-naming closure is out of this struct's scope.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    pub default_concurrency: usize,
    pub retry_policy: RetryPolicy,
    pub sagas: HashMap<String, SagaWorkerConfig>,
    pub dlq_suffix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 4,
            retry_policy: RetryPolicy::default(),
            sagas: HashMap::new(),
            dlq_suffix: ".dlq".to_string(),
        }
    }
}

/// Bus-wide configuration (spec.md §6), excluding the non-serializable
/// collaborators (`transport`, `store`, `sagas[].definition`, `middleware`,
/// `logger`, `errorHandler`) which are always supplied programmatically via
/// [`BusBuilder`]. Apply with [`BusBuilder::with_config`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BusConfig {
    pub worker: WorkerConfig,
    pub timeout_bounds: TimeoutBounds,
}

/// Builder for a [`Bus`], mirroring the teacher crate's config-struct +
/// fluent-registration style (`MessagingConfig`/`init_event_bus`).
pub struct BusBuilder {
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    middleware: MiddlewarePipeline,
    error_classifier: Arc<dyn ErrorClassifier>,
    timeout_bounds: TimeoutBounds,
    default_concurrency: usize,
    default_retry_policy: RetryPolicy,
    dlq_suffix: String,
    sagas: Vec<(Arc<SagaDefinition>, SagaWorkerConfig)>,
    /// Per-saga overrides sourced from a [`BusConfig`] (keyed by saga name,
    /// since the config is loaded before any `SagaDefinition` is built).
    /// Merged with each registration's own [`SagaWorkerConfig`] at
    /// `.build()` time; an explicit field set at `register_with` wins over
    /// the config-sourced value for that same field.
    saga_overrides: HashMap<String, SagaWorkerConfig>,
}

impl BusBuilder {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn Store>) -> Self {
        Self {
            transport,
            store,
            clock: Arc::new(SystemClock),
            middleware: MiddlewarePipeline::new(),
            error_classifier: Arc::new(DefaultErrorClassifier),
            timeout_bounds: TimeoutBounds::default(),
            default_concurrency: 4,
            default_retry_policy: RetryPolicy::default(),
            dlq_suffix: ".dlq".to_string(),
            sagas: Vec::new(),
            saga_overrides: HashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_middleware(mut self, middleware: MiddlewarePipeline) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn with_error_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.error_classifier = classifier;
        self
    }

    pub fn with_timeout_bounds(mut self, bounds: TimeoutBounds) -> Self {
        self.timeout_bounds = bounds;
        self
    }

    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency.max(1);
        self
    }

    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    pub fn with_dlq_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.dlq_suffix = suffix.into();
        self
    }

    /// Apply a deserialized [`BusConfig`]: bus-wide worker defaults, timeout
    /// bounds, and per-saga overrides (matched by [`SagaDefinition::name`]
    /// at `.build()` time, so this may be called before or after
    /// `.register`).
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.default_concurrency = config.worker.default_concurrency.max(1);
        self.default_retry_policy = config.worker.retry_policy;
        self.dlq_suffix = config.worker.dlq_suffix;
        self.timeout_bounds = config.timeout_bounds;
        self.saga_overrides = config.worker.sagas;
        self
    }

    /// Register a saga with bus-wide worker defaults.
    pub fn register(self, definition: Arc<SagaDefinition>) -> Self {
        self.register_with(definition, SagaWorkerConfig::default())
    }

    /// Register a saga with its own concurrency/retry overrides.
    pub fn register_with(mut self, definition: Arc<SagaDefinition>, config: SagaWorkerConfig) -> Self {
        self.sagas.push((definition, config));
        self
    }

    pub fn build(self) -> Bus {
        let mut retry_policies = HashMap::new();
        let mut concurrency_by_saga = HashMap::new();
        for (definition, config) in &self.sagas {
            // Config-sourced override first; an explicit field on this
            // registration's own `SagaWorkerConfig` takes precedence.
            let from_config = self.saga_overrides.get(definition.name());
            let retry_policy = config
                .retry_policy
                .or_else(|| from_config.and_then(|c| c.retry_policy));
            let concurrency = config
                .concurrency
                .or_else(|| from_config.and_then(|c| c.concurrency));
            if let Some(policy) = retry_policy {
                retry_policies.insert(definition.name().to_string(), policy);
            }
            if let Some(concurrency) = concurrency {
                concurrency_by_saga.insert(definition.name().to_string(), concurrency);
            }
        }
        let retry_policies = Arc::new(retry_policies);

        let mut by_type: HashMap<String, Vec<Arc<Orchestrator>>> = HashMap::new();
        for (definition, _) in &self.sagas {
            let orchestrator = Arc::new(Orchestrator::new(
                definition.clone(),
                self.store.clone(),
                self.transport.clone(),
                self.clock.clone(),
                self.middleware.clone(),
                self.timeout_bounds,
            ));
            for message_type in definition.handled_message_types() {
                by_type
                    .entry(message_type.clone())
                    .or_default()
                    .push(orchestrator.clone());
            }
        }

        let mut dispatchers = HashMap::new();
        for (message_type, orchestrators) in by_type {
            let concurrency = orchestrators
                .iter()
                .map(|o| {
                    concurrency_by_saga
                        .get(o.definition().name())
                        .copied()
                        .unwrap_or(self.default_concurrency)
                })
                .max()
                .unwrap_or(self.default_concurrency);
            let dispatcher = BusDispatcher {
                orchestrators,
                transport: self.transport.clone(),
                retry_policies: retry_policies.clone(),
                default_retry_policy: self.default_retry_policy,
                error_classifier: self.error_classifier.clone(),
                dlq_suffix: self.dlq_suffix.clone(),
                semaphore: Arc::new(Semaphore::new(concurrency)),
                concurrency,
            };
            dispatchers.insert(message_type, dispatcher);
        }

        Bus {
            transport: self.transport,
            dispatchers,
        }
    }
}

/// A running (or ready-to-start) collection of sagas sharing one transport
/// and store (spec §2.7).
pub struct Bus {
    transport: Arc<dyn Transport>,
    dispatchers: HashMap<String, BusDispatcher>,
}

impl Bus {
    pub fn builder(transport: Arc<dyn Transport>, store: Arc<dyn Store>) -> BusBuilder {
        BusBuilder::new(transport, store)
    }

    /// Subscribe to every handled message type and start the transport.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        for (message_type, dispatcher) in &self.dispatchers {
            let handler: Arc<dyn DeliveryHandler> = Arc::new(dispatcher.clone());
            self.transport
                .subscribe(
                    SubscribeOptions::new(message_type.clone(), dispatcher.concurrency),
                    handler,
                )
                .await
                .map_err(|e| OrchestratorError::Transport(e.to_string()))?;
        }
        self.transport
            .start()
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))
    }

    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        self.transport
            .stop()
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))
    }

    /// Deliver a single envelope directly, bypassing the transport's
    /// subscribe loop. Used by tests and by callers driving delivery from
    /// an external poll loop.
    pub async fn dispatch(&self, envelope: Envelope) {
        if let Some(dispatcher) = self.dispatchers.get(&envelope.r#type) {
            dispatcher.dispatch(envelope).await;
        } else {
            debug!(message_type = %envelope.r#type, "no saga handles this message type");
        }
    }
}

/// Per-message-type fan-out plus the retry/DLQ engine (spec §4.7).
///
/// One instance per distinct handled message type; cloned cheaply (every
/// field is `Arc`-backed) so it can be handed to the transport as a
/// `'static` [`DeliveryHandler`].
#[derive(Clone)]
struct BusDispatcher {
    orchestrators: Vec<Arc<Orchestrator>>,
    transport: Arc<dyn Transport>,
    retry_policies: Arc<HashMap<String, RetryPolicy>>,
    default_retry_policy: RetryPolicy,
    error_classifier: Arc<dyn ErrorClassifier>,
    dlq_suffix: String,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl BusDispatcher {
    async fn dispatch(&self, envelope: Envelope) {
        let _permit = self.semaphore.acquire().await;
        for orchestrator in &self.orchestrators {
            match orchestrator.deliver(&envelope).await {
                Ok(outcome) => {
                    debug!(
                        saga = %orchestrator.definition().name(),
                        message_type = %envelope.r#type,
                        ?outcome,
                        "delivered"
                    );
                }
                Err(err) => {
                    self.handle_failure(orchestrator.definition().name(), envelope, err)
                        .await;
                    return;
                }
            }
        }
    }

    /// Retry with computed backoff if the error is transient and the
    /// message has not exhausted its attempts; otherwise route to the DLQ
    /// (spec §4.7).
    async fn handle_failure(&self, saga_name: &str, envelope: Envelope, err: OrchestratorError) {
        let attempt = envelope.attempt();
        let policy = self
            .retry_policies
            .get(saga_name)
            .copied()
            .unwrap_or(self.default_retry_policy);
        let transient = self.error_classifier.is_transient(&err);

        if transient && policy.should_retry(attempt) {
            let next_attempt = attempt + 1;
            let jitter_key = format!("{saga_name}:{}", envelope.id);
            // `delay_for_attempt` takes the current (pre-increment) attempt
            // just read off the header, per spec.md §4.7 step 3's literal
            // `base*2^(attempt-1)` formula.
            let delay = policy.delay_for_attempt(attempt, &jitter_key);
            let first_seen = envelope.first_seen();
            let retry_envelope = envelope
                .clone()
                .with_header(HEADER_ATTEMPT, next_attempt.to_string())
                .with_header(HEADER_FIRST_SEEN, first_seen.to_rfc3339());
            let endpoint = envelope.r#type.clone();
            warn!(%saga_name, %endpoint, attempt = next_attempt, error = %err, "retrying after transient error");
            let mut options = PublishOptions::to(endpoint).with_delay_ms(delay.as_millis() as u64);
            if let Some(key) = envelope.partition_key.clone() {
                options = options.with_partition_key(key);
            }
            if let Err(publish_err) = self.transport.publish(retry_envelope, options).await {
                error!(%saga_name, error = %publish_err, "failed to republish for retry");
            }
        } else {
            self.dead_letter(saga_name, envelope, err).await;
        }
    }

    async fn dead_letter(&self, saga_name: &str, envelope: Envelope, err: OrchestratorError) {
        let original_endpoint = envelope.r#type.clone();
        let dlq_endpoint = format!("{original_endpoint}{}", self.dlq_suffix);
        error!(%saga_name, %original_endpoint, error = %err, "routing to dead-letter queue");
        let dlq_envelope = envelope
            .with_header(HEADER_ORIGINAL_ENDPOINT, original_endpoint)
            .with_header(HEADER_ERROR_MESSAGE, err.to_string())
            .with_header(HEADER_ERROR_TYPE, error_variant_name(&err));
        if let Err(publish_err) = self
            .transport
            .publish(dlq_envelope, PublishOptions::to(dlq_endpoint))
            .await
        {
            error!(%saga_name, error = %publish_err, "failed to publish to dead-letter queue");
        }
    }
}

impl DeliveryHandler for BusDispatcher {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move { this.dispatch(envelope).await })
    }
}

fn error_variant_name(err: &OrchestratorError) -> &'static str {
    match err {
        OrchestratorError::ConcurrencyViolation { .. } => "ConcurrencyViolation",
        OrchestratorError::Transient(_) => "Transient",
        OrchestratorError::InvalidTimeout { .. } => "InvalidTimeout",
        OrchestratorError::Validation(_) => "Validation",
        OrchestratorError::Handler(_) => "Handler",
        OrchestratorError::Store(_) => "Store",
        OrchestratorError::Transport(_) => "Transport",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_variant_name_covers_all_variants() {
        assert_eq!(
            error_variant_name(&OrchestratorError::Validation("x".into())),
            "Validation"
        );
        assert_eq!(
            error_variant_name(&OrchestratorError::Transport("x".into())),
            "Transport"
        );
    }

    #[test]
    fn bus_config_deserializes_from_json_with_spec_defaults() {
        let config: BusConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.worker.default_concurrency, 4);
        assert_eq!(config.worker.retry_policy.max_attempts, 3);
        assert_eq!(config.worker.dlq_suffix, ".dlq");
        assert_eq!(config.timeout_bounds.min_ms, 1_000);
        assert_eq!(config.timeout_bounds.max_ms, 604_800_000);
    }

    #[test]
    fn bus_config_deserializes_per_saga_overrides() {
        let json = r#"{
            "worker": {
                "defaultConcurrency": 8,
                "sagas": {
                    "order": { "concurrency": 2, "retryPolicy": { "maxAttempts": 5, "baseDelayMs": 500, "maxDelayMs": 10000, "backoff": "linear" } }
                }
            }
        }"#;
        let config: BusConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.worker.default_concurrency, 8);
        let order = config.worker.sagas.get("order").unwrap();
        assert_eq!(order.concurrency, Some(2));
        assert_eq!(order.retry_policy.unwrap().max_attempts, 5);
    }

    #[test]
    fn with_config_applies_worker_defaults_and_per_saga_override() {
        let transport: Arc<dyn Transport> = Arc::new(crate::testing::MemoryTransport::new());
        let store: Arc<dyn Store> = Arc::new(crate::testing::MemoryStore::new());
        let mut overrides = HashMap::new();
        overrides.insert(
            "order".to_string(),
            SagaWorkerConfig {
                concurrency: Some(7),
                retry_policy: None,
            },
        );
        let config = BusConfig {
            worker: WorkerConfig {
                default_concurrency: 9,
                sagas: overrides,
                ..WorkerConfig::default()
            },
            ..BusConfig::default()
        };
        let builder = BusBuilder::new(transport, store).with_config(config);
        assert_eq!(builder.default_concurrency, 9);
        assert_eq!(
            builder.saga_overrides.get("order").unwrap().concurrency,
            Some(7)
        );
    }
}
