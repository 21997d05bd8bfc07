//! Append-only step execution records.

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

/// Whether an execution ran a step's forward action or its compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Compensate,
}

impl Direction {
    /// Returns the direction name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "Forward",
            Direction::Compensate => "Compensate",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Forward" => Ok(Direction::Forward),
            "Compensate" => Ok(Direction::Compensate),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// How a single execution attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Success,
    Failure,
    TimedOut,
}

impl ExecutionOutcome {
    /// Returns the outcome name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "Success",
            ExecutionOutcome::Failure => "Failure",
            ExecutionOutcome::TimedOut => "TimedOut",
        }
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Success" => Ok(ExecutionOutcome::Success),
            "Failure" => Ok(ExecutionOutcome::Failure),
            "TimedOut" => Ok(ExecutionOutcome::TimedOut),
            other => Err(format!("unknown execution outcome: {other}")),
        }
    }
}

/// One attempted step execution, immutable once written.
///
/// The full ordered sequence for a saga is its audit trail and the
/// replay log for crash recovery; successful records carry the step
/// output so the state bag can be reconstructed independently of the
/// instance snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    /// The saga this execution belongs to.
    pub saga_id: SagaId,
    /// Index of the step in its definition.
    pub step_index: i32,
    /// Forward action or compensation.
    pub direction: Direction,
    /// 1-based attempt counter per (saga, step, direction).
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub completed_at: DateTime<Utc>,
    /// How the attempt ended.
    pub outcome: ExecutionOutcome,
    /// Error message for failed or timed-out attempts.
    pub error_detail: Option<String>,
    /// Step output for successful attempts.
    pub output: Option<serde_json::Value>,
}

impl StepExecutionRecord {
    /// Creates a successful execution record.
    pub fn success(
        saga_id: SagaId,
        step_index: i32,
        direction: Direction,
        attempt: u32,
        started_at: DateTime<Utc>,
        output: Option<serde_json::Value>,
    ) -> Self {
        Self {
            saga_id,
            step_index,
            direction,
            attempt,
            started_at,
            completed_at: Utc::now(),
            outcome: ExecutionOutcome::Success,
            error_detail: None,
            output,
        }
    }

    /// Creates a failed execution record.
    pub fn failure(
        saga_id: SagaId,
        step_index: i32,
        direction: Direction,
        attempt: u32,
        started_at: DateTime<Utc>,
        error_detail: impl Into<String>,
    ) -> Self {
        Self {
            saga_id,
            step_index,
            direction,
            attempt,
            started_at,
            completed_at: Utc::now(),
            outcome: ExecutionOutcome::Failure,
            error_detail: Some(error_detail.into()),
            output: None,
        }
    }

    /// Creates a timed-out execution record.
    pub fn timed_out(
        saga_id: SagaId,
        step_index: i32,
        direction: Direction,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            saga_id,
            step_index,
            direction,
            attempt,
            started_at,
            completed_at: Utc::now(),
            outcome: ExecutionOutcome::TimedOut,
            error_detail: Some("step timed out".to_string()),
            output: None,
        }
    }

    /// Returns true if this record is the successful execution for its
    /// (saga, step, direction) key.
    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }
}
