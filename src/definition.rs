//! `SagaDefinition`: the immutable, compiled description of a saga (spec §4.1).
//!
//! The source authoring DSL (out of scope here, per spec §1) expresses
//! handlers and correlation as fluent chains that accumulate closures keyed
//! by string message types. This module is the runtime-visible shape that
//! DSL compiles into: a tagged registry (message type -> guarded handlers)
//! plus a correlation-rule map, assembled via [`SagaDefinitionBuilder`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::context::SagaContext;
use crate::error::OrchestratorError;

/// Result of resolving a message's correlation rule (spec §4.1).
#[derive(Debug, Clone)]
pub struct Correlation {
    /// The business key identifying the target instance, or `None` if the
    /// message carries no usable correlation value.
    pub correlation_id: Option<String>,
    /// Whether this rule is permitted to create a new instance.
    pub can_start: bool,
}

impl Correlation {
    pub fn ignore() -> Self {
        Self {
            correlation_id: None,
            can_start: false,
        }
    }

    pub fn start(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            can_start: true,
        }
    }

    pub fn existing(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            can_start: false,
        }
    }
}

/// Result of a handler's execution (spec §4.1).
pub struct HandleOutcome {
    pub new_state: Value,
    /// Explicit completion; if `None`, `ctx.is_completed()` is authoritative.
    pub is_completed: Option<bool>,
}

impl HandleOutcome {
    pub fn new(new_state: Value) -> Self {
        Self {
            new_state,
            is_completed: None,
        }
    }

    pub fn completed(mut self) -> Self {
        self.is_completed = Some(true);
        self
    }
}

/// A correlation rule: extracts a correlation ID (and whether the rule may
/// start a new instance) from an inbound message's payload.
pub type CorrelationFn = dyn Fn(&Value) -> Correlation + Send + Sync;

/// Pure factory invoked exactly once per instance to build the initial
/// user-shaped state. The runtime overlays authoritative metadata
/// afterwards.
pub type CreateInitialStateFn =
    dyn Fn(&Value, &mut SagaContext) -> Result<Value, OrchestratorError> + Send + Sync;

/// A guard predicate over the current user-shaped state.
pub type GuardFn = dyn Fn(&Value) -> bool + Send + Sync;

/// The handler function proper.
pub type HandlerFn =
    dyn Fn(&Value, &Value, &mut SagaContext) -> Result<HandleOutcome, OrchestratorError>
        + Send
        + Sync;

struct HandlerEntry {
    guard: Option<Arc<GuardFn>>,
    handler: Arc<HandlerFn>,
}

/// Immutable, compiled saga description (spec §4.1).
///
/// Built via [`SagaDefinition::builder`]; once `.build()`'d, a definition
/// never changes — the orchestrator holds it behind an `Arc` and shares it
/// across concurrently-dispatched deliveries.
pub struct SagaDefinition {
    name: String,
    handled_message_types: Vec<String>,
    correlation_rules: HashMap<String, Arc<CorrelationFn>>,
    default_correlation_rule: Option<Arc<CorrelationFn>>,
    create_initial_state: HashMap<String, Arc<CreateInitialStateFn>>,
    handlers: HashMap<String, Vec<HandlerEntry>>,
}

impl SagaDefinition {
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The closed set of message discriminators this saga reacts to.
    pub fn handled_message_types(&self) -> &[String] {
        &self.handled_message_types
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Resolution order: exact match on `message.type` first, then the
    /// wildcard rule; a missing match yields "ignore" (spec §4.1).
    pub fn correlation_for(&self, message_type: &str, payload: &Value) -> Correlation {
        if let Some(rule) = self.correlation_rules.get(message_type) {
            return rule(payload);
        }
        if let Some(rule) = &self.default_correlation_rule {
            return rule(payload);
        }
        Correlation::ignore()
    }

    pub fn create_initial_state(
        &self,
        message_type: &str,
        payload: &Value,
        ctx: &mut SagaContext,
    ) -> Result<Value, OrchestratorError> {
        let factory = self.create_initial_state.get(message_type).ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "saga {:?} has no initial-state factory for starting message type {:?}",
                self.name, message_type
            ))
        })?;
        factory(payload, ctx)
    }

    /// Dispatches by `message.type` to the first handler whose guard
    /// passes (or which has no guard). If none passes, the message is a
    /// no-op for this instance (spec §4.1).
    pub fn handle(
        &self,
        message_type: &str,
        payload: &Value,
        state: &Value,
        ctx: &mut SagaContext,
    ) -> Result<Option<HandleOutcome>, OrchestratorError> {
        let Some(entries) = self.handlers.get(message_type) else {
            return Ok(None);
        };
        for entry in entries {
            let guard_passes = entry
                .guard
                .as_ref()
                .map(|g| g(state))
                .unwrap_or(true);
            if guard_passes {
                return Ok(Some((entry.handler)(payload, state, ctx)?));
            }
        }
        Ok(None)
    }
}

/// Builder for [`SagaDefinition`], mirroring the teacher crate's fluent
/// method-chaining registration style.
pub struct SagaDefinitionBuilder {
    name: String,
    handled_message_types: Vec<String>,
    correlation_rules: HashMap<String, Arc<CorrelationFn>>,
    default_correlation_rule: Option<Arc<CorrelationFn>>,
    create_initial_state: HashMap<String, Arc<CreateInitialStateFn>>,
    handlers: HashMap<String, Vec<HandlerEntry>>,
}

impl SagaDefinitionBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handled_message_types: Vec::new(),
            correlation_rules: HashMap::new(),
            default_correlation_rule: None,
            create_initial_state: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    fn note_handled(&mut self, message_type: &str) {
        if !self.handled_message_types.iter().any(|t| t == message_type) {
            self.handled_message_types.push(message_type.to_string());
        }
    }

    /// Register a starting rule: `canStart = true`, plus the initial-state
    /// factory invoked the first time this message is observed for a new
    /// correlation.
    pub fn on_start<C, I>(mut self, message_type: impl Into<String>, correlate: C, create: I) -> Self
    where
        C: Fn(&Value) -> Correlation + Send + Sync + 'static,
        I: Fn(&Value, &mut SagaContext) -> Result<Value, OrchestratorError> + Send + Sync + 'static,
    {
        let message_type = message_type.into();
        self.note_handled(&message_type);
        self.correlation_rules
            .insert(message_type.clone(), Arc::new(correlate));
        self.create_initial_state
            .insert(message_type, Arc::new(create));
        self
    }

    /// Register a non-starting correlation rule for an already-running
    /// instance (`canStart = false`).
    pub fn on<C>(mut self, message_type: impl Into<String>, correlate: C) -> Self
    where
        C: Fn(&Value) -> Correlation + Send + Sync + 'static,
    {
        let message_type = message_type.into();
        self.note_handled(&message_type);
        self.correlation_rules
            .insert(message_type, Arc::new(correlate));
        self
    }

    /// Register the wildcard correlation rule consulted when no exact
    /// match exists for a handled message type.
    pub fn correlate_default<C>(mut self, correlate: C) -> Self
    where
        C: Fn(&Value) -> Correlation + Send + Sync + 'static,
    {
        self.default_correlation_rule = Some(Arc::new(correlate));
        self
    }

    /// Register an unguarded handler for `message_type`.
    pub fn handle<H>(self, message_type: impl Into<String>, handler: H) -> Self
    where
        H: Fn(&Value, &Value, &mut SagaContext) -> Result<HandleOutcome, OrchestratorError>
            + Send
            + Sync
            + 'static,
    {
        self.handle_entry(message_type, None, handler)
    }

    /// Register a guarded handler for `message_type`. When multiple
    /// handlers are registered for the same type, the first whose guard
    /// passes runs (spec §4.1).
    pub fn handle_when<G, H>(self, message_type: impl Into<String>, guard: G, handler: H) -> Self
    where
        G: Fn(&Value) -> bool + Send + Sync + 'static,
        H: Fn(&Value, &Value, &mut SagaContext) -> Result<HandleOutcome, OrchestratorError>
            + Send
            + Sync
            + 'static,
    {
        self.handle_entry(message_type, Some(Arc::new(guard)), handler)
    }

    fn handle_entry<H>(
        mut self,
        message_type: impl Into<String>,
        guard: Option<Arc<GuardFn>>,
        handler: H,
    ) -> Self
    where
        H: Fn(&Value, &Value, &mut SagaContext) -> Result<HandleOutcome, OrchestratorError>
            + Send
            + Sync
            + 'static,
    {
        let message_type = message_type.into();
        self.note_handled(&message_type);
        self.handlers
            .entry(message_type)
            .or_default()
            .push(HandlerEntry {
                guard,
                handler: Arc::new(handler),
            });
        self
    }

    pub fn build(self) -> Arc<SagaDefinition> {
        Arc::new(SagaDefinition {
            name: self.name,
            handled_message_types: self.handled_message_types,
            correlation_rules: self.correlation_rules,
            default_correlation_rule: self.default_correlation_rule,
            create_initial_state: self.create_initial_state,
            handlers: self.handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn correlate_by_field(field: &'static str, can_start: bool) -> impl Fn(&Value) -> Correlation {
        move |payload| match payload.get(field).and_then(Value::as_str) {
            Some(id) if can_start => Correlation::start(id),
            Some(id) => Correlation::existing(id),
            None => Correlation::ignore(),
        }
    }

    #[test]
    fn correlation_prefers_exact_match_over_default() {
        let def = SagaDefinition::builder("order")
            .on_start("OrderSubmitted", correlate_by_field("orderId", true), |p, _ctx| {
                Ok(p.clone())
            })
            .correlate_default(|_| Correlation::existing("default-id"))
            .build();

        let c = def.correlation_for("OrderSubmitted", &json!({"orderId": "o1"}));
        assert_eq!(c.correlation_id.as_deref(), Some("o1"));
        assert!(c.can_start);
    }

    #[test]
    fn correlation_falls_back_to_default_rule() {
        let def = SagaDefinition::builder("order")
            .on_start("OrderSubmitted", correlate_by_field("orderId", true), |p, _ctx| {
                Ok(p.clone())
            })
            .correlate_default(|_| Correlation::existing("fallback"))
            .build();

        let c = def.correlation_for("SomeOtherType", &json!({}));
        assert_eq!(c.correlation_id.as_deref(), Some("fallback"));
        assert!(!c.can_start);
    }

    #[test]
    fn correlation_with_no_match_and_no_default_is_ignore() {
        let def = SagaDefinition::builder("order")
            .on_start("OrderSubmitted", correlate_by_field("orderId", true), |p, _ctx| {
                Ok(p.clone())
            })
            .build();

        let c = def.correlation_for("Unhandled", &json!({}));
        assert!(c.correlation_id.is_none());
        assert!(!c.can_start);
    }

    #[test]
    fn first_passing_guard_wins_and_no_second_handler_runs() {
        let def = SagaDefinition::builder("order")
            .handle_when(
                "Event",
                |state: &Value| state["status"] == "a",
                |_m, _s, _ctx| Ok(HandleOutcome::new(json!({"status": "from-a"}))),
            )
            .handle_when(
                "Event",
                |_state: &Value| true,
                |_m, _s, _ctx| Ok(HandleOutcome::new(json!({"status": "from-catchall"}))),
            )
            .build();

        let mut ctx_state = json!({"status": "a"});
        let now = chrono::Utc::now();
        let meta = crate::state::SagaStateMetadata::new_instance(uuid::Uuid::new_v4(), now, None, None);
        let mut ctx = SagaContext::new("order", "o1", meta, now, crate::context::TimeoutBounds::default());
        let outcome = def
            .handle("Event", &json!({}), &ctx_state, &mut ctx)
            .unwrap()
            .unwrap();
        assert_eq!(outcome.new_state, json!({"status": "from-a"}));

        ctx_state = json!({"status": "b"});
        let outcome = def
            .handle("Event", &json!({}), &ctx_state, &mut ctx)
            .unwrap()
            .unwrap();
        assert_eq!(outcome.new_state, json!({"status": "from-catchall"}));
    }

    #[test]
    fn handle_with_no_passing_guard_is_noop() {
        let def = SagaDefinition::builder("order")
            .handle_when(
                "Event",
                |state: &Value| state["status"] == "a",
                |_m, _s, _ctx| Ok(HandleOutcome::new(json!({}))),
            )
            .build();

        let now = chrono::Utc::now();
        let meta = crate::state::SagaStateMetadata::new_instance(uuid::Uuid::new_v4(), now, None, None);
        let mut ctx = SagaContext::new("order", "o1", meta, now, crate::context::TimeoutBounds::default());
        let outcome = def
            .handle("Event", &json!({}), &json!({"status": "z"}), &mut ctx)
            .unwrap();
        assert!(outcome.is_none());
    }
}
