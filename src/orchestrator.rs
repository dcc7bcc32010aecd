//! The per-saga orchestrator: correlates, loads, runs the handler, persists
//! under optimistic concurrency, schedules timeouts, and emits outbound
//! messages (spec §4.2).

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::context::{PendingTimeout, SagaContext, TimeoutBounds};
use crate::definition::SagaDefinition;
use crate::error::OrchestratorError;
use crate::message::{Envelope, SagaTimeoutExpiredPayload};
use crate::middleware::MiddlewarePipeline;
use crate::state::{SagaState, SagaStateMetadata};
use crate::store::Store;
use crate::transport::{PublishOptions, Transport};

/// What happened to a single delivery, for logging and test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// A new instance was created and its handler ran.
    Started,
    /// An existing, non-terminal instance was updated.
    Updated,
    /// No correlation ID could be extracted from the message.
    NoCorrelation,
    /// No instance exists and the correlation rule does not permit starting one.
    CannotStart,
    /// The targeted instance is already completed.
    TargetCompleted,
    /// The message type is handled by the saga but no registered handler's
    /// guard passed for the current state.
    NoHandlerMatched,
}

/// One registered saga's runtime: correlation, instance lifecycle,
/// optimistic-concurrency transitions, and timeout scheduling.
///
/// Cheap to clone: every field is `Arc`-backed or `Copy`. `deliver` clones
/// `self` into the middleware pipeline's terminal closure rather than
/// borrowing, since the closure must satisfy a higher-ranked `Fn` bound
/// over the per-delivery `PipelineContext` lifetime that an external
/// borrow could not.
#[derive(Clone)]
pub struct Orchestrator {
    definition: Arc<SagaDefinition>,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    pipeline: MiddlewarePipeline,
    timeout_bounds: TimeoutBounds,
}

impl Orchestrator {
    pub fn new(
        definition: Arc<SagaDefinition>,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        pipeline: MiddlewarePipeline,
        timeout_bounds: TimeoutBounds,
    ) -> Self {
        Self {
            definition,
            store,
            transport,
            clock,
            pipeline,
            timeout_bounds,
        }
    }

    pub fn definition(&self) -> &Arc<SagaDefinition> {
        &self.definition
    }

    /// Deliver a single envelope through correlation, the middleware
    /// pipeline, and the core step (spec §4.2 steps 1-5).
    #[tracing::instrument(name = "orchestrator.deliver", skip_all, fields(saga = %self.definition.name(), message_type = %envelope.r#type))]
    pub async fn deliver(&self, envelope: &Envelope) -> Result<DeliveryOutcome, OrchestratorError> {
        // Step 1: correlate.
        let correlation = self
            .definition
            .correlation_for(&envelope.r#type, &envelope.payload);
        let Some(correlation_id) = correlation.correlation_id.clone() else {
            debug!("no correlation id extracted; dropping");
            return Ok(DeliveryOutcome::NoCorrelation);
        };

        // Step 2: pre-load state, before the middleware pipeline.
        let existing = self
            .store
            .get_by_correlation_id(self.definition.name(), &correlation_id)
            .await?;

        // Step 3: enter the pipeline with a mutable PipelineContext.
        let mut ctx = crate::context::PipelineContext::new(
            envelope.clone(),
            self.definition.name(),
            correlation_id.clone(),
            existing,
        );

        let outcome = Arc::new(std::sync::Mutex::new(DeliveryOutcome::NoHandlerMatched));
        let can_start = correlation.can_start;

        // `terminal` must satisfy a higher-ranked `Fn` bound over the
        // pipeline's per-call `&mut PipelineContext` lifetime, so it can only
        // close over owned, 'static-compatible data (cloned `Arc`s), never a
        // borrow of `self`. See `Orchestrator`'s doc comment.
        let this = self.clone();
        let outcome_for_closure = outcome.clone();
        let terminal = move |pipeline_ctx: &mut crate::context::PipelineContext| {
            let this = this.clone();
            let outcome = outcome_for_closure.clone();
            Box::pin(async move { this.core_step(pipeline_ctx, can_start, &outcome).await })
                as futures::future::BoxFuture<'_, Result<(), OrchestratorError>>
        };

        let result = self.pipeline.run(&mut ctx, terminal).await;

        if let Err(ref e) = result {
            ctx.error = Some(e.to_string());
        }
        result?;

        let final_outcome = outcome.lock().unwrap().clone();
        Ok(final_outcome)
    }

    /// The core step (spec §4.2 step 4): load-or-create, run the handler,
    /// persist with the expected version, flush outbound publishes, and
    /// schedule any requested timeout.
    async fn core_step(
        &self,
        ctx: &mut crate::context::PipelineContext,
        can_start: bool,
        outcome: &Arc<std::sync::Mutex<DeliveryOutcome>>,
    ) -> Result<(), OrchestratorError> {
        let now = self.clock.now();
        let message_type = ctx.envelope.r#type.clone();
        let payload = ctx.envelope.payload.clone();
        let saga_name = ctx.saga_name.clone();
        let correlation_id = ctx.correlation_id.clone();

        let (pre_state, is_new) = match ctx.existing_state.take() {
            Some(state) => (state, false),
            None => {
                if !can_start {
                    debug!(%correlation_id, "no instance exists and rule does not permit starting one");
                    *outcome.lock().unwrap() = DeliveryOutcome::CannotStart;
                    return Ok(());
                }
                let saga_id = self.clock.new_id();
                let (trace_parent, trace_state) = ctx.trace_context();
                let metadata = SagaStateMetadata::new_instance(saga_id, now, trace_parent, trace_state);
                let mut create_ctx = SagaContext::new(
                    &saga_name,
                    &correlation_id,
                    metadata.clone(),
                    now,
                    self.timeout_bounds,
                );
                let data = self
                    .definition
                    .create_initial_state(&message_type, &payload, &mut create_ctx)?;
                let state = SagaState::new(metadata, data);
                self.store
                    .insert(&saga_name, &correlation_id, state.clone())
                    .await?;
                (state, true)
            }
        };

        if pre_state.metadata.is_completed {
            debug!(saga_id = %pre_state.metadata.saga_id, "instance is completed; dropping message");
            ctx.saga_id = Some(pre_state.metadata.saga_id);
            *outcome.lock().unwrap() = DeliveryOutcome::TargetCompleted;
            return Ok(());
        }

        let saga_id = pre_state.metadata.saga_id;
        ctx.saga_id = Some(saga_id);

        let mut handler_ctx = SagaContext::new(
            &saga_name,
            &correlation_id,
            pre_state.metadata.clone(),
            now,
            self.timeout_bounds,
        );

        let handled = self.definition.handle(
            &message_type,
            &payload,
            &pre_state.data,
            &mut handler_ctx,
        )?;

        let Some(handle_outcome) = handled else {
            debug!(%saga_id, %message_type, "no handler matched for current state; no-op");
            ctx.pre_state = Some(pre_state);
            *outcome.lock().unwrap() = if is_new {
                DeliveryOutcome::Started
            } else {
                DeliveryOutcome::NoHandlerMatched
            };
            return Ok(());
        };

        // Outbound publishes happen during the handler and are not
        // transactional with the store write (spec §4.2 step 4i, §9).
        for pending in handler_ctx.take_pending_publishes() {
            self.dispatch_publish(pending.envelope, pending.options).await?;
        }

        let pre_version = pre_state.metadata.version;
        let mut new_metadata = pre_state.metadata.clone();
        new_metadata.version = pre_version + 1;
        new_metadata.updated_at = now;
        new_metadata.is_completed = handle_outcome
            .is_completed
            .unwrap_or_else(|| handler_ctx.is_completed());

        match handler_ctx.pending_timeout() {
            Some(PendingTimeout::Set(ms)) => {
                new_metadata.timeout_ms = Some(ms);
                new_metadata.timeout_expires_at = Some(now + chrono::Duration::milliseconds(ms as i64));
            }
            Some(PendingTimeout::Clear) => {
                new_metadata.timeout_ms = None;
                new_metadata.timeout_expires_at = None;
            }
            None => {}
        }

        let new_state = SagaState::new(new_metadata.clone(), handle_outcome.new_state);

        self.store
            .update(&saga_name, new_state.clone(), pre_version)
            .await?;

        if let Some(PendingTimeout::Set(ms)) = handler_ctx.pending_timeout() {
            if !new_metadata.is_completed {
                self.publish_timeout_expired(&saga_name, saga_id, &correlation_id, ms, now)
                    .await?;
            }
        }

        ctx.pre_state = Some(pre_state);
        ctx.post_state = Some(new_state);
        *outcome.lock().unwrap() = if is_new {
            DeliveryOutcome::Started
        } else {
            DeliveryOutcome::Updated
        };
        Ok(())
    }

    async fn dispatch_publish(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> Result<(), OrchestratorError> {
        self.transport
            .publish(envelope, options)
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))
    }

    /// Publish the scheduled `SagaTimeoutExpired` message once the state
    /// that requested it has been persisted (spec §4.2 step 4h, §4.6).
    async fn publish_timeout_expired(
        &self,
        saga_name: &str,
        saga_id: Uuid,
        correlation_id: &str,
        timeout_ms: u64,
        set_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), OrchestratorError> {
        let payload = SagaTimeoutExpiredPayload {
            saga_id,
            saga_name: saga_name.to_string(),
            correlation_id: correlation_id.to_string(),
            timeout_ms,
            timeout_set_at: set_at,
        };
        let envelope = payload.into_envelope(timeout_ms);
        let options = PublishOptions::default()
            .with_delay_ms(timeout_ms)
            .with_partition_key(correlation_id.to_string());
        warn_on_publish_err(
            self.transport.publish(envelope, options).await,
            saga_name,
        )?;
        Ok(())
    }
}

fn warn_on_publish_err(
    result: crate::transport::Result<()>,
    saga_name: &str,
) -> Result<(), OrchestratorError> {
    result.map_err(|e| {
        warn!(%saga_name, error = %e, "failed to publish SagaTimeoutExpired");
        OrchestratorError::Transport(e.to_string())
    })
}
