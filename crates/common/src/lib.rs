//! Shared identifier types used across the saga coordination crates.

pub mod types;

pub use types::{CorrelationId, EventId, SagaId};
