//! The typed seam between the coordinator and business steps.

use async_trait::async_trait;
use common::{CorrelationId, SagaId};
use thiserror::Error;

/// Errors an action can report back to the executor.
///
/// The split drives the retry decision: [`ActionError::Retryable`] is a
/// transient fault retried per the step's backoff policy, while
/// [`ActionError::Rejected`] is an explicit business rejection that
/// short-circuits to failure with no retry.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Transient failure; the executor may retry.
    #[error("retryable action failure: {0}")]
    Retryable(String),

    /// Permanent business rejection; never retried.
    #[error("action rejected: {0}")]
    Rejected(String),
}

impl ActionError {
    /// Returns true if the executor is allowed to retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActionError::Retryable(_))
    }
}

/// Invocation context handed to an action.
///
/// `input` is a snapshot of the saga's state bag at invocation time, so
/// later steps can consume the outputs of earlier ones.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// The saga instance being driven.
    pub saga_id: SagaId,
    /// The business key of the saga.
    pub correlation_id: CorrelationId,
    /// Name of the step this action belongs to.
    pub step_name: String,
    /// Snapshot of the accumulated state bag.
    pub input: serde_json::Value,
}

/// A forward or compensating action of one saga step.
///
/// Implementations are resolved once at registry-build time and shared
/// behind an `Arc`; there is no per-call handler lookup. Actions must be
/// idempotent: the coordinator may re-invoke them after a crash or a
/// re-delivered message, and relies on the action producing no
/// additional effect beyond the first application.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Runs the action, returning its output on success.
    ///
    /// For forward actions in an event-driven deployment this issues
    /// the step's command; the business outcome then arrives later as a
    /// completion or failure event. Compensations run to completion and
    /// their return value is the compensation outcome itself.
    async fn run(&self, ctx: ActionContext) -> Result<serde_json::Value, ActionError>;
}
