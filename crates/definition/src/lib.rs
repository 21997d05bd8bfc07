//! Static saga catalog.
//!
//! A [`SagaDefinition`] is the immutable contract for one saga type: an
//! ordered list of [`StepDefinition`]s, each holding a typed forward
//! action, an optional compensation action, a timeout and a retry
//! policy. Definitions are collected into a [`DefinitionRegistry`] once
//! at process start and passed by reference into the coordinator;
//! changing a step contract requires a new deployment, never a data
//! change.

pub mod action;
pub mod backoff;
pub mod registry;
pub mod step;

pub use action::{ActionContext, ActionError, StepAction};
pub use backoff::BackoffPolicy;
pub use registry::{DefinitionRegistry, RegistryBuilder, RegistryError, SagaDefinition};
pub use step::{StepDefinition, StepDefinitionBuilder, StepSummary};
