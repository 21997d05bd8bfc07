use common::{CorrelationId, SagaId};
use thiserror::Error;

use crate::version::Version;

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrency conflict occurred when saving an instance.
    /// The expected version did not match the stored version.
    #[error("concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// A new instance lost the race for its correlation id: another
    /// active instance already claims it.
    #[error("an active saga already exists for correlation id {0}")]
    DuplicateCorrelation(CorrelationId),

    /// The saga instance was not found in the store.
    #[error("saga not found: {0}")]
    NotFound(SagaId),

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be decoded into its domain type.
    #[error("invalid stored value: {0}")]
    Decode(String),
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
