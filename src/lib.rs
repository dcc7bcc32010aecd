//! Saga orchestration runtime: correlation, optimistic-concurrency state
//! transitions, a middleware pipeline around handler execution, timeout
//! scheduling, and a retry/DLQ policy engine for event-driven sagas.
//!
//! The moving parts, roughly in the order a message flows through them:
//! a [`transport::Transport`] delivers an [`message::Envelope`] to the
//! [`bus::Bus`]; the bus fans it out to every [`definition::SagaDefinition`]
//! that handles its type; each runs through an [`orchestrator::Orchestrator`],
//! which correlates the message to an instance, runs it through the
//! [`middleware::MiddlewarePipeline`], and persists the result to a
//! [`store::Store`] under optimistic concurrency.

pub mod bus;
pub mod clock;
pub mod context;
pub mod definition;
pub mod error;
pub mod message;
pub mod middleware;
pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod store;
pub mod transport;

pub mod testing;

pub use bus::{
    Bus, BusBuilder, BusConfig, DefaultErrorClassifier, ErrorClassifier, SagaWorkerConfig,
    WorkerConfig,
};
pub use clock::{Clock, DynClock, IdGen, SystemClock};
pub use context::{PipelineContext, SagaContext, TimeoutBounds};
pub use definition::{Correlation, HandleOutcome, SagaDefinition, SagaDefinitionBuilder};
pub use error::OrchestratorError;
pub use message::Envelope;
pub use middleware::{Middleware, MiddlewarePipeline, Next};
pub use orchestrator::{DeliveryOutcome, Orchestrator};
pub use retry::{BackoffKind, RetryPolicy};
pub use state::{SagaState, SagaStateMetadata};
pub use store::{Store, StoreError};
pub use transport::{DeliveryHandler, PublishOptions, SubscribeOptions, Transport, TransportError};
