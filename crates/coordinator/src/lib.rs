//! Saga orchestration.
//!
//! The [`SagaCoordinator`] is the state machine at the heart of the
//! system: on each inbound event it resolves the saga instance (via the
//! [`EventCorrelator`]), consults the definition registry for the
//! current step's contract, runs the step or its compensation through
//! the [`StepExecutor`], and persists every transition through the
//! store's compare-and-swap `save` before any externally visible
//! command is issued for the next step.
//!
//! Failures are absorbed into state transitions: callers only ever
//! observe [`CoordinatorResult`]s and saga statuses, never raw errors
//! from downstream steps.

pub mod actions;
pub mod citizenship;
pub mod coordinator;
pub mod correlator;
pub mod error;
pub mod event;
pub mod executor;
pub mod view;

pub use actions::InMemoryAction;
pub use coordinator::{CoordinatorResult, SagaCoordinator};
pub use correlator::{EventCorrelator, Resolution};
pub use error::SagaError;
pub use event::EventMessage;
pub use executor::{StepExecutor, StepOutcome};
pub use view::{DefinitionView, SagaView};
