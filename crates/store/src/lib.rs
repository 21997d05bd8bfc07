//! Durable saga state.
//!
//! This crate holds the persisted data model — [`SagaInstance`]
//! snapshots with optimistic-concurrency versioning and the append-only
//! [`StepExecutionRecord`] history — behind the pluggable [`SagaStore`]
//! trait, with an in-memory implementation for tests and embedding and
//! a PostgreSQL implementation for production.

pub mod error;
pub mod instance;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod status;
pub mod store;
pub mod version;

pub use common::{CorrelationId, EventId, SagaId};
pub use error::{Result, StoreError};
pub use instance::{SagaInstance, StateBag};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use record::{Direction, ExecutionOutcome, StepExecutionRecord};
pub use status::SagaStatus;
pub use store::SagaStore;
pub use version::Version;
