//! Monotonic timestamps and unique identity generation.
//!
//! Kept as a thin seam (rather than calling `Utc::now()`/`Uuid::new_v4()`
//! directly throughout the orchestrator) so tests can substitute a fixed
//! clock and deterministic IDs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Wall-clock time and unique identity source used by the orchestrator.
///
/// Implementations must be cheap to clone and safe to share across
/// concurrently-dispatched deliveries.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// A fresh globally-unique identifier, used to mint `sagaId`s and
    /// envelope IDs.
    fn new_id(&self) -> Uuid;
}

/// System clock backed by `Utc::now()` and `Uuid::new_v4()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn new_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Trait object alias used by components that hold a clock behind `Arc`.
pub type DynClock = dyn Clock;

/// Extension point for components that need to mint envelope IDs
/// asynchronously (e.g. pulling from a centrally-coordinated sequence).
/// The default [`SystemClock`] implements this trivially.
#[async_trait]
pub trait IdGen: Send + Sync {
    async fn next_id(&self) -> Uuid;
}

#[async_trait]
impl<T: Clock> IdGen for T {
    async fn next_id(&self) -> Uuid {
        self.new_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_produces_distinct_ids() {
        let clock = SystemClock;
        let a = clock.new_id();
        let b = clock.new_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn id_gen_blanket_impl_delegates_to_clock() {
        let clock = SystemClock;
        let id = IdGen::next_id(&clock).await;
        assert!(!id.is_nil());
    }
}
