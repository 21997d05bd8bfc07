use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{CorrelationId, SagaId};
use tokio::sync::RwLock;

use crate::instance::SagaInstance;
use crate::record::StepExecutionRecord;
use crate::store::SagaStore;
use crate::version::Version;
use crate::{Result, StoreError};

#[derive(Default)]
struct Inner {
    instances: HashMap<SagaId, SagaInstance>,
    records: Vec<StepExecutionRecord>,
}

/// In-memory saga store for tests and embedded use.
///
/// Provides the same contract as the PostgreSQL implementation,
/// including the compare-and-swap `save` and the one-success-per-key
/// append guard.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of execution records stored.
    pub async fn record_count(&self) -> usize {
        self.inner.read().await.records.len()
    }

    /// Clears all instances and records.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.instances.clear();
        inner.records.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn load(&self, id: SagaId) -> Result<Option<SagaInstance>> {
        let inner = self.inner.read().await;
        Ok(inner.instances.get(&id).cloned())
    }

    async fn load_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<SagaInstance>> {
        let inner = self.inner.read().await;
        Ok(inner
            .instances
            .values()
            .find(|i| i.correlation_id == *correlation_id && i.status.is_active())
            .cloned())
    }

    async fn save(&self, instance: &SagaInstance, expected_version: Version) -> Result<Version> {
        let mut inner = self.inner.write().await;

        let actual = inner
            .instances
            .get(&instance.id)
            .map(|i| i.version)
            .unwrap_or_else(Version::initial);

        if actual != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                saga_id: instance.id,
                expected: expected_version,
                actual,
            });
        }

        // At most one active instance per correlation id; the guard
        // lives under the same write lock as the insert so two racing
        // creators cannot both pass it.
        if expected_version == Version::initial()
            && instance.status.is_active()
            && inner.instances.values().any(|other| {
                other.id != instance.id
                    && other.correlation_id == instance.correlation_id
                    && other.status.is_active()
            })
        {
            return Err(StoreError::DuplicateCorrelation(
                instance.correlation_id.clone(),
            ));
        }

        inner.instances.insert(instance.id, instance.clone());
        Ok(instance.version)
    }

    async fn append_record(&self, record: StepExecutionRecord) -> Result<bool> {
        let mut inner = self.inner.write().await;

        let duplicate_attempt = inner.records.iter().any(|r| {
            r.saga_id == record.saga_id
                && r.step_index == record.step_index
                && r.direction == record.direction
                && r.attempt == record.attempt
        });
        let duplicate_success = record.is_success()
            && inner.records.iter().any(|r| {
                r.saga_id == record.saga_id
                    && r.step_index == record.step_index
                    && r.direction == record.direction
                    && r.is_success()
            });

        if duplicate_attempt || duplicate_success {
            return Ok(false);
        }

        inner.records.push(record);
        Ok(true)
    }

    async fn records_for(&self, saga_id: SagaId) -> Result<Vec<StepExecutionRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .filter(|r| r.saga_id == saga_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::StateBag;
    use crate::record::Direction;
    use crate::status::SagaStatus;
    use chrono::Utc;

    fn new_instance(correlation: &str) -> SagaInstance {
        SagaInstance::new(
            "CitizenshipApplication",
            CorrelationId::new(correlation),
            StateBag::new(),
        )
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let store = InMemorySagaStore::new();
        let mut saga = new_instance("C1");
        let expected = saga.bump();

        store.save(&saga, expected).await.unwrap();

        let loaded = store.load(saga.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, saga.id);
        assert_eq!(loaded.version, Version::first());
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let store = InMemorySagaStore::new();
        assert!(store.load(SagaId::new()).await.unwrap().is_none());
        assert!(store.require(SagaId::new()).await.is_err());
    }

    #[tokio::test]
    async fn stale_save_is_rejected() {
        let store = InMemorySagaStore::new();
        let mut saga = new_instance("C1");
        let expected = saga.bump();
        store.save(&saga, expected).await.unwrap();

        // A second writer with the same base version loses.
        let mut stale = saga.clone();
        stale.version = Version::new(2);
        let result = store.save(&stale, Version::initial()).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn correlation_lookup_skips_terminal_instances() {
        let store = InMemorySagaStore::new();
        let correlation = CorrelationId::new("C1");

        let mut done = new_instance("C1");
        done.status = SagaStatus::Completed;
        let expected = done.bump();
        store.save(&done, expected).await.unwrap();

        assert!(
            store
                .load_by_correlation(&correlation)
                .await
                .unwrap()
                .is_none()
        );

        let mut live = new_instance("C1");
        live.start();
        let expected = live.bump();
        store.save(&live, expected).await.unwrap();

        let found = store.load_by_correlation(&correlation).await.unwrap();
        assert_eq!(found.unwrap().id, live.id);

        // Terminal instance is still reachable by id for audit.
        assert!(store.load(done.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn second_active_instance_for_same_correlation_is_rejected() {
        let store = InMemorySagaStore::new();

        let mut winner = new_instance("C1");
        winner.start();
        let expected = winner.bump();
        store.save(&winner, expected).await.unwrap();

        // A racing creator with its own fresh id passes the CAS but
        // must lose on the correlation guard.
        let mut loser = new_instance("C1");
        loser.start();
        let expected = loser.bump();
        let result = store.save(&loser, expected).await;
        assert!(matches!(result, Err(StoreError::DuplicateCorrelation(_))));
        assert!(store.load(loser.id).await.unwrap().is_none());

        // Once the first run is terminal the correlation id is free.
        winner.status = SagaStatus::Completed;
        let expected = winner.bump();
        store.save(&winner, expected).await.unwrap();

        let mut fresh = new_instance("C1");
        fresh.start();
        let expected = fresh.bump();
        store.save(&fresh, expected).await.unwrap();
    }

    #[tokio::test]
    async fn second_success_for_same_key_is_not_appended() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();

        let first = StepExecutionRecord::success(
            saga_id,
            0,
            Direction::Forward,
            1,
            Utc::now(),
            Some(serde_json::json!({"ok": true})),
        );
        assert!(store.append_record(first).await.unwrap());

        let second = StepExecutionRecord::success(
            saga_id,
            0,
            Direction::Forward,
            2,
            Utc::now(),
            None,
        );
        assert!(!store.append_record(second).await.unwrap());

        assert!(
            store
                .has_succeeded(saga_id, 0, Direction::Forward)
                .await
                .unwrap()
        );
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_attempt_is_not_appended() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();

        let record =
            StepExecutionRecord::failure(saga_id, 1, Direction::Forward, 1, Utc::now(), "boom");
        assert!(store.append_record(record.clone()).await.unwrap());
        assert!(!store.append_record(record).await.unwrap());
    }

    #[tokio::test]
    async fn failures_accumulate_and_attempts_count() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();

        for attempt in 1..=3 {
            let record = StepExecutionRecord::failure(
                saga_id,
                1,
                Direction::Compensate,
                attempt,
                Utc::now(),
                "unreachable",
            );
            assert!(store.append_record(record).await.unwrap());
        }

        assert_eq!(
            store.attempts(saga_id, 1, Direction::Compensate).await.unwrap(),
            3
        );
        assert!(
            !store
                .has_succeeded(saga_id, 1, Direction::Compensate)
                .await
                .unwrap()
        );
        assert!(
            store
                .success_record(saga_id, 1, Direction::Compensate)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn records_are_isolated_per_saga() {
        let store = InMemorySagaStore::new();
        let a = SagaId::new();
        let b = SagaId::new();

        store
            .append_record(StepExecutionRecord::success(
                a,
                0,
                Direction::Forward,
                1,
                Utc::now(),
                None,
            ))
            .await
            .unwrap();
        store
            .append_record(StepExecutionRecord::success(
                b,
                0,
                Direction::Forward,
                1,
                Utc::now(),
                None,
            ))
            .await
            .unwrap();

        assert_eq!(store.records_for(a).await.unwrap().len(), 1);
        assert_eq!(store.records_for(b).await.unwrap().len(), 1);
    }
}
