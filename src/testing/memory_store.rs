//! In-memory [`Store`] for tests, grounded on the teacher crate's
//! `storage::mock::event_store::MockEventStore`: an `RwLock`-guarded map
//! plus boolean fault-injection switches instead of a real backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::state::SagaState;
use crate::store::{Result, Store, StoreError};

#[derive(Default)]
struct Inner {
    by_correlation: HashMap<(String, String), SagaState>,
    id_index: HashMap<(String, Uuid), String>,
}

/// Single-process `Store` backed by a `HashMap`. Not durable; intended for
/// unit/integration tests exercising orchestrator behavior.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_next_insert: AtomicBool,
    fail_next_update: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            fail_next_insert: AtomicBool::new(false),
            fail_next_update: AtomicBool::new(false),
        }
    }

    /// Make the next `insert` call fail with a backend error, to exercise
    /// error propagation without a real storage fault.
    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    /// Make the next `update` call fail with a backend error.
    pub fn fail_next_update(&self) {
        self.fail_next_update.store(true, Ordering::SeqCst);
    }

    /// Snapshot of every persisted instance, for test assertions.
    pub fn all(&self) -> Vec<SagaState> {
        self.inner
            .read()
            .unwrap()
            .by_correlation
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_by_id(&self, saga_name: &str, saga_id: Uuid) -> Result<Option<SagaState>> {
        let inner = self.inner.read().unwrap();
        let Some(correlation_id) = inner.id_index.get(&(saga_name.to_string(), saga_id)) else {
            return Ok(None);
        };
        Ok(inner
            .by_correlation
            .get(&(saga_name.to_string(), correlation_id.clone()))
            .cloned())
    }

    async fn get_by_correlation_id(
        &self,
        saga_name: &str,
        correlation_id: &str,
    ) -> Result<Option<SagaState>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .by_correlation
            .get(&(saga_name.to_string(), correlation_id.to_string()))
            .cloned())
    }

    async fn insert(&self, saga_name: &str, correlation_id: &str, state: SagaState) -> Result<()> {
        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("simulated insert failure".to_string()));
        }
        let mut inner = self.inner.write().unwrap();
        let key = (saga_name.to_string(), correlation_id.to_string());
        if inner.by_correlation.contains_key(&key) {
            return Err(StoreError::DuplicateCorrelation {
                saga_name: saga_name.to_string(),
                correlation_id: correlation_id.to_string(),
            });
        }
        inner
            .id_index
            .insert((saga_name.to_string(), state.metadata.saga_id), correlation_id.to_string());
        inner.by_correlation.insert(key, state);
        Ok(())
    }

    async fn update(&self, saga_name: &str, state: SagaState, expected_version: u64) -> Result<()> {
        if self.fail_next_update.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("simulated update failure".to_string()));
        }
        let mut inner = self.inner.write().unwrap();
        let saga_id = state.metadata.saga_id;
        let Some(correlation_id) = inner
            .id_index
            .get(&(saga_name.to_string(), saga_id))
            .cloned()
        else {
            return Err(StoreError::NotFound(saga_id.to_string()));
        };
        let key = (saga_name.to_string(), correlation_id);
        let current = inner
            .by_correlation
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(saga_id.to_string()))?;
        if current.metadata.version != expected_version {
            return Err(StoreError::ConcurrencyViolation {
                saga_id,
                expected: expected_version,
                actual: current.metadata.version,
            });
        }
        inner.by_correlation.insert(key, state);
        Ok(())
    }

    async fn delete(&self, saga_name: &str, saga_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let Some(correlation_id) = inner.id_index.remove(&(saga_name.to_string(), saga_id)) else {
            return Ok(());
        };
        inner
            .by_correlation
            .remove(&(saga_name.to_string(), correlation_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SagaStateMetadata;
    use chrono::Utc;
    use serde_json::json;

    fn new_state() -> SagaState {
        let now = Utc::now();
        SagaState::new(
            SagaStateMetadata::new_instance(Uuid::new_v4(), now, None, None),
            json!({"status": "new"}),
        )
    }

    #[tokio::test]
    async fn insert_then_get_by_correlation_id_round_trips() {
        let store = MemoryStore::new();
        let state = new_state();
        store.insert("order", "o1", state.clone()).await.unwrap();
        let loaded = store
            .get_by_correlation_id("order", "o1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.metadata.saga_id, state.metadata.saga_id);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = MemoryStore::new();
        store.insert("order", "o1", new_state()).await.unwrap();
        let err = store.insert("order", "o1", new_state()).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCorrelation { .. }));
    }

    #[tokio::test]
    async fn update_with_wrong_expected_version_is_rejected() {
        let store = MemoryStore::new();
        let state = new_state();
        store.insert("order", "o1", state.clone()).await.unwrap();
        let mut updated = state.clone();
        updated.metadata.version = 1;
        let err = store.update("order", updated, 5).await.unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyViolation { .. }));
    }

    #[tokio::test]
    async fn update_with_correct_expected_version_succeeds() {
        let store = MemoryStore::new();
        let state = new_state();
        store.insert("order", "o1", state.clone()).await.unwrap();
        let mut updated = state.clone();
        updated.metadata.version = 1;
        store.update("order", updated, 0).await.unwrap();
        let loaded = store
            .get_by_correlation_id("order", "o1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.metadata.version, 1);
    }

    #[tokio::test]
    async fn get_by_id_resolves_through_index() {
        let store = MemoryStore::new();
        let state = new_state();
        let saga_id = state.metadata.saga_id;
        store.insert("order", "o1", state).await.unwrap();
        let loaded = store.get_by_id("order", saga_id).await.unwrap().unwrap();
        assert_eq!(loaded.metadata.saga_id, saga_id);
    }

    #[tokio::test]
    async fn fail_next_insert_triggers_one_backend_error() {
        let store = MemoryStore::new();
        store.fail_next_insert();
        assert!(store.insert("order", "o1", new_state()).await.is_err());
        store.insert("order", "o1", new_state()).await.unwrap();
    }
}
