//! Composable onion around handler execution (spec §4.3).
//!
//! Middleware run in registration order; each either calls `next()` to
//! continue the chain or short-circuits by returning without calling it.
//! The innermost `next()` invokes the orchestrator's core step. This is
//! the saga pipeline's own minimal onion rather than a full `tower::Service`
//! stack — there is exactly one call site, so the extra machinery buys
//! nothing.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::PipelineContext;
use crate::error::OrchestratorError;

/// The remaining chain a middleware may continue into.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    terminal: &'a (dyn for<'c> Fn(&'c mut PipelineContext) -> BoxFuture<'c, Result<(), OrchestratorError>>
              + Send
              + Sync),
}

impl<'a> Next<'a> {
    /// Continue the chain: call the next middleware, or the terminal
    /// (orchestrator core step) adapter once the chain is exhausted.
    pub async fn run(self, ctx: &mut PipelineContext) -> Result<(), OrchestratorError> {
        match self.middlewares.split_first() {
            Some((mw, rest)) => {
                let next = Next {
                    middlewares: rest,
                    terminal: self.terminal,
                };
                mw.call(ctx, next).await
            }
            None => (self.terminal)(ctx).await,
        }
    }
}

/// A single middleware stage.
///
/// May read/alter `ctx.metadata`, observe `ctx.pre_state`/`ctx.post_state`
/// after `next.run(ctx)` returns, call `ctx.set_trace_context` prior to
/// instance creation, and swallow or rethrow errors from `next.run`.
/// Middleware must not publish messages on behalf of the saga — only
/// handlers may, via `SagaContext` (spec §4.3).
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), OrchestratorError>;
}

/// Ordered chain of middleware surrounding the core orchestrator step for
/// a single delivery.
#[derive(Default, Clone)]
pub struct MiddlewarePipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware stage (registration order is execution order).
    pub fn push(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.stages.push(middleware);
        self
    }

    /// Run the pipeline, invoking `terminal` once the chain is exhausted.
    pub async fn run<'c, F>(&self, ctx: &'c mut PipelineContext, terminal: F) -> Result<(), OrchestratorError>
    where
        F: for<'t> Fn(&'t mut PipelineContext) -> BoxFuture<'t, Result<(), OrchestratorError>>
            + Send
            + Sync,
    {
        let next = Next {
            middlewares: &self.stages,
            terminal: &terminal,
        };
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Envelope;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingMiddleware {
        label: &'static str,
        order: Arc<tokio::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for RecordingMiddleware {
        async fn call(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), OrchestratorError> {
            self.order.lock().await.push(self.label);
            next.run(ctx).await?;
            self.order.lock().await.push(self.label);
            Ok(())
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn call(&self, _ctx: &mut PipelineContext, _next: Next<'_>) -> Result<(), OrchestratorError> {
            Ok(())
        }
    }

    fn ctx() -> PipelineContext {
        PipelineContext::new(Envelope::new("X", serde_json::json!({})), "order", "o1", None)
    }

    #[tokio::test]
    async fn middleware_runs_in_registration_order_onion_style() {
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new()
            .push(Arc::new(RecordingMiddleware {
                label: "a",
                order: order.clone(),
            }))
            .push(Arc::new(RecordingMiddleware {
                label: "b",
                order: order.clone(),
            }));

        let terminal_ran = Arc::new(AtomicUsize::new(0));
        let terminal_ran_clone = terminal_ran.clone();
        pipeline
            .run(&mut ctx(), move |_ctx| {
                let terminal_ran = terminal_ran_clone.clone();
                Box::pin(async move {
                    terminal_ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(terminal_ran.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().await, vec!["a", "b", "b", "a"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_terminal() {
        let pipeline = MiddlewarePipeline::new().push(Arc::new(ShortCircuit));
        let terminal_ran = Arc::new(AtomicUsize::new(0));
        let terminal_ran_clone = terminal_ran.clone();
        pipeline
            .run(&mut ctx(), move |_ctx| {
                let terminal_ran = terminal_ran_clone.clone();
                Box::pin(async move {
                    terminal_ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(terminal_ran.load(Ordering::SeqCst), 0);
    }
}
