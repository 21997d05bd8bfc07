use common::{CorrelationId, SagaId};
use definition::RegistryError;
use store::{SagaStatus, StoreError};
use thiserror::Error;

/// Errors surfaced by the coordinator.
///
/// Business step failures are not errors here; they become saga state
/// transitions. `SagaError` covers the cases where the coordinator
/// cannot even decide what to do with an input.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The event correlates to no active saga and initiates none.
    #[error("event '{event_type}' matches no active saga for correlation id {correlation_id}")]
    NoMatchingSaga {
        event_type: String,
        correlation_id: CorrelationId,
    },

    /// A management operation was invoked against a saga in a state
    /// that does not permit it.
    #[error("saga {saga_id} is {actual}; {operation} requires {expected}")]
    InvalidState {
        saga_id: SagaId,
        operation: &'static str,
        expected: &'static str,
        actual: SagaStatus,
    },

    /// An active saga already exists for this correlation id.
    #[error("an active saga already exists for correlation id {0}")]
    AlreadyActive(CorrelationId),

    /// A manual completion/failure named a step other than the one in
    /// flight.
    #[error("step index {requested} does not match current step {current} of saga {saga_id}")]
    StepIndexMismatch {
        saga_id: SagaId,
        requested: i32,
        current: i32,
    },

    /// The instance snapshot points at a step index outside its
    /// definition.
    #[error("saga {saga_id} references step {step_index} outside its definition")]
    StepOutOfRange { saga_id: SagaId, step_index: i32 },

    /// Concurrent writers kept invalidating our snapshot.
    #[error("saga {saga_id}: gave up after {attempts} optimistic concurrency retries")]
    ConflictRetriesExhausted { saga_id: SagaId, attempts: u32 },

    /// Definition registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, SagaError>;
