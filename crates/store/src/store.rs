use async_trait::async_trait;
use common::{CorrelationId, SagaId};

use crate::instance::SagaInstance;
use crate::record::{Direction, StepExecutionRecord};
use crate::version::Version;
use crate::{Result, StoreError};

/// Core trait for saga store implementations.
///
/// A saga store persists instance snapshots with compare-and-swap
/// writes and keeps the append-only execution history. All
/// implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Loads an instance by id, terminal or not.
    async fn load(&self, id: SagaId) -> Result<Option<SagaInstance>>;

    /// Loads the active (non-terminal) instance for a correlation id.
    ///
    /// Terminal instances are retained for audit but excluded here.
    async fn load_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<SagaInstance>>;

    /// Persists an instance snapshot.
    ///
    /// `expected_version` is the version the store must currently hold
    /// for this saga (`Version::initial()` for a brand-new instance);
    /// `instance.version` is the version being written. A mismatch
    /// fails with [`StoreError::ConcurrencyConflict`], signalling that
    /// another handler mutated the saga concurrently — the caller must
    /// reload and re-apply.
    async fn save(&self, instance: &SagaInstance, expected_version: Version) -> Result<Version>;

    /// Appends an execution record.
    ///
    /// Records are append-only and never updated. Appending a `Success`
    /// record for a `(saga, step, direction)` key that already has one
    /// is a no-op returning `false` — this is the race-free idempotency
    /// guard against duplicate delivery.
    async fn append_record(&self, record: StepExecutionRecord) -> Result<bool>;

    /// Returns the full ordered execution history for a saga.
    async fn records_for(&self, saga_id: SagaId) -> Result<Vec<StepExecutionRecord>>;

    /// Returns the successful execution record for a key, if any.
    async fn success_record(
        &self,
        saga_id: SagaId,
        step_index: i32,
        direction: Direction,
    ) -> Result<Option<StepExecutionRecord>> {
        let records = self.records_for(saga_id).await?;
        Ok(records.into_iter().find(|r| {
            r.step_index == step_index && r.direction == direction && r.is_success()
        }))
    }

    /// Returns true if a successful execution exists for a key.
    async fn has_succeeded(
        &self,
        saga_id: SagaId,
        step_index: i32,
        direction: Direction,
    ) -> Result<bool> {
        Ok(self
            .success_record(saga_id, step_index, direction)
            .await?
            .is_some())
    }

    /// Returns the number of attempts recorded for a key.
    async fn attempts(
        &self,
        saga_id: SagaId,
        step_index: i32,
        direction: Direction,
    ) -> Result<u32> {
        let records = self.records_for(saga_id).await?;
        Ok(records
            .iter()
            .filter(|r| r.step_index == step_index && r.direction == direction)
            .count() as u32)
    }

    /// Loads an instance by id, failing if it does not exist.
    async fn require(&self, id: SagaId) -> Result<SagaInstance> {
        self.load(id).await?.ok_or(StoreError::NotFound(id))
    }
}
