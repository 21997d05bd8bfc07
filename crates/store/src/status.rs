//! Saga lifecycle states.

use serde::{Deserialize, Serialize};

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// NotStarted ──► Running ──┬──► Completed
///                          ├──► Failed            (nothing to undo)
///                          └──► Compensating ──┬──► Compensated
///                                              └──► CompensationFailed
/// ```
///
/// `Completed`, `Compensated`, `Failed` and `CompensationFailed` are
/// terminal; no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Instance exists but step 0 has not been dispatched.
    #[default]
    NotStarted,

    /// Forward steps are being executed.
    Running,

    /// A step failed and compensations are running in reverse order.
    Compensating,

    /// All steps completed successfully (terminal).
    Completed,

    /// Every successful step was compensated after a failure (terminal).
    Compensated,

    /// The saga failed before any step completed (terminal).
    Failed,

    /// A compensation exhausted its retries; operator intervention is
    /// required (terminal).
    CompensationFailed,
}

impl SagaStatus {
    /// Returns true if the saga can begin running.
    pub fn can_start(&self) -> bool {
        matches!(self, SagaStatus::NotStarted)
    }

    /// Returns true if the saga can begin compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Running)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Compensated
                | SagaStatus::Failed
                | SagaStatus::CompensationFailed
        )
    }

    /// Returns true if the saga still takes part in active-instance
    /// lookups.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::NotStarted => "NotStarted",
            SagaStatus::Running => "Running",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Completed => "Completed",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::Failed => "Failed",
            SagaStatus::CompensationFailed => "CompensationFailed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotStarted" => Ok(SagaStatus::NotStarted),
            "Running" => Ok(SagaStatus::Running),
            "Compensating" => Ok(SagaStatus::Compensating),
            "Completed" => Ok(SagaStatus::Completed),
            "Compensated" => Ok(SagaStatus::Compensated),
            "Failed" => Ok(SagaStatus::Failed),
            "CompensationFailed" => Ok(SagaStatus::CompensationFailed),
            other => Err(format!("unknown saga status: {other}")),
        }
    }
}
