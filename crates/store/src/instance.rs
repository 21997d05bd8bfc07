//! The saga instance snapshot.

use chrono::{DateTime, Utc};
use common::{CorrelationId, SagaId};
use serde::{Deserialize, Serialize};

use crate::record::{Direction, StepExecutionRecord};
use crate::status::SagaStatus;
use crate::version::Version;

/// Insertion-ordered key→value map accumulated from step outputs and
/// fed back into later steps.
pub type StateBag = serde_json::Map<String, serde_json::Value>;

/// The mutable unit of work tracked by the coordinator.
///
/// Mutated exclusively by the coordinator and persisted through the
/// store's compare-and-swap `save`; never physically deleted — terminal
/// instances are retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Opaque instance identifier.
    pub id: SagaId,
    /// Name of the saga definition driving this instance.
    pub saga_type: String,
    /// Business key linking this instance to its events.
    pub correlation_id: CorrelationId,
    /// Who or what created the saga, when known; events carry no
    /// initiator, so event-materialized instances leave this unset.
    pub initiator_id: Option<String>,
    /// Index of the step currently in flight; `-1` once fully
    /// compensated.
    pub current_step_index: i32,
    /// Lifecycle state.
    pub status: SagaStatus,
    /// Accumulated step outputs.
    pub state_bag: StateBag,
    /// Monotonic counter for optimistic concurrency.
    pub version: Version,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance was last persisted.
    pub updated_at: DateTime<Utc>,
}

impl SagaInstance {
    /// Creates a new `NotStarted` instance.
    pub fn new(
        saga_type: impl Into<String>,
        correlation_id: CorrelationId,
        initial_state: StateBag,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            saga_type: saga_type.into(),
            correlation_id,
            initiator_id: None,
            current_step_index: 0,
            status: SagaStatus::NotStarted,
            state_bag: initial_state,
            version: Version::initial(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Bumps the version for the next persisted write and returns the
    /// version the write must find in the store.
    pub fn bump(&mut self) -> Version {
        let expected = self.version;
        self.version = self.version.next();
        self.updated_at = Utc::now();
        expected
    }

    /// Transitions `NotStarted → Running` at step 0.
    pub fn start(&mut self) {
        self.status = SagaStatus::Running;
        self.current_step_index = 0;
    }

    /// Records a successful forward step: advances the index and marks
    /// the saga `Completed` when the last step finished.
    pub fn advance(&mut self, total_steps: usize) {
        self.current_step_index += 1;
        if self.current_step_index >= total_steps as i32 {
            self.status = SagaStatus::Completed;
        }
    }

    /// Transitions `Running → Compensating`.
    pub fn begin_compensation(&mut self) {
        self.status = SagaStatus::Compensating;
    }

    /// Records one compensated (or skipped) step during rollback:
    /// decrements the index and marks the saga `Compensated` once the
    /// index passes the start.
    pub fn step_compensated(&mut self) {
        self.current_step_index -= 1;
        if self.current_step_index < 0 {
            self.status = SagaStatus::Compensated;
        }
    }

    /// Transitions to the terminal `Failed` state (failure with nothing
    /// to undo).
    pub fn fail(&mut self) {
        self.status = SagaStatus::Failed;
    }

    /// Transitions to the terminal `CompensationFailed` state.
    pub fn compensation_failed(&mut self) {
        self.status = SagaStatus::CompensationFailed;
    }

    /// Folds success records the snapshot has not absorbed yet.
    ///
    /// Records are written before the snapshot, so a crash can leave
    /// successes whose transition never landed. `replay` re-applies
    /// them deterministically: while `Running`, each recorded forward
    /// success at the current index merges its output and advances;
    /// while `Compensating`, each recorded compensation success at the
    /// current index decrements. `step_names` is the definition's
    /// ordered step list, used to key scalar outputs in the bag.
    ///
    /// An up-to-date snapshot replays to itself, which is the
    /// crash-recovery equivalence check.
    pub fn replay(mut self, records: &[StepExecutionRecord], step_names: &[&str]) -> Self {
        loop {
            let index = self.current_step_index;
            match self.status {
                SagaStatus::Running => {
                    let success = records.iter().find(|r| {
                        r.step_index == index
                            && r.direction == Direction::Forward
                            && r.is_success()
                    });
                    let Some(record) = success else { break };
                    let name = step_names.get(index as usize).copied().unwrap_or_default();
                    self.merge_output(
                        name,
                        record.output.clone().unwrap_or(serde_json::Value::Null),
                    );
                    self.advance(step_names.len());
                }
                SagaStatus::Compensating if index >= 0 => {
                    let undone = records.iter().any(|r| {
                        r.step_index == index
                            && r.direction == Direction::Compensate
                            && r.is_success()
                    });
                    if !undone {
                        break;
                    }
                    self.step_compensated();
                }
                _ => break,
            }
        }
        self
    }

    /// Merges a step output into the state bag.
    ///
    /// Object payloads merge key-wise (later steps win on key clashes);
    /// any other non-null payload is stored under the step name.
    pub fn merge_output(&mut self, step_name: &str, output: serde_json::Value) {
        match output {
            serde_json::Value::Null => {}
            serde_json::Value::Object(map) => {
                for (key, value) in map {
                    self.state_bag.insert(key, value);
                }
            }
            other => {
                self.state_bag.insert(step_name.to_string(), other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance() -> SagaInstance {
        SagaInstance::new(
            "CitizenshipApplication",
            CorrelationId::new("C1"),
            StateBag::new(),
        )
    }

    #[test]
    fn new_instance_is_not_started_at_version_zero() {
        let saga = instance();
        assert_eq!(saga.status, SagaStatus::NotStarted);
        assert_eq!(saga.current_step_index, 0);
        assert_eq!(saga.version, Version::initial());
        assert!(saga.state_bag.is_empty());
    }

    #[test]
    fn bump_returns_previous_version() {
        let mut saga = instance();
        assert_eq!(saga.bump(), Version::initial());
        assert_eq!(saga.version, Version::first());
        assert_eq!(saga.bump(), Version::first());
        assert_eq!(saga.version, Version::new(2));
    }

    #[test]
    fn advance_completes_after_last_step() {
        let mut saga = instance();
        saga.start();
        assert_eq!(saga.status, SagaStatus::Running);

        saga.advance(2);
        assert_eq!(saga.current_step_index, 1);
        assert_eq!(saga.status, SagaStatus::Running);

        saga.advance(2);
        assert_eq!(saga.current_step_index, 2);
        assert_eq!(saga.status, SagaStatus::Completed);
    }

    #[test]
    fn compensation_walks_back_to_compensated() {
        let mut saga = instance();
        saga.start();
        saga.advance(4);
        saga.advance(4);
        // Failure at step 2.
        saga.begin_compensation();
        assert_eq!(saga.status, SagaStatus::Compensating);

        saga.step_compensated(); // 2 -> 1
        saga.step_compensated(); // 1 -> 0
        assert_eq!(saga.status, SagaStatus::Compensating);
        saga.step_compensated(); // 0 -> -1
        assert_eq!(saga.current_step_index, -1);
        assert_eq!(saga.status, SagaStatus::Compensated);
    }

    #[test]
    fn merge_output_flattens_objects_and_keeps_order() {
        let mut saga = instance();
        saga.merge_output("kyc", json!({"kyc_score": 87, "kyc_ref": "K-1"}));
        saga.merge_output("issue_passport", json!("P-42"));
        saga.merge_output("noop", json!(null));

        let keys: Vec<&String> = saga.state_bag.keys().collect();
        assert_eq!(keys, ["kyc_score", "kyc_ref", "issue_passport"]);
        assert_eq!(saga.state_bag["issue_passport"], json!("P-42"));
    }

    #[test]
    fn merge_output_later_steps_win() {
        let mut saga = instance();
        saga.merge_output("a", json!({"status": "pending"}));
        saga.merge_output("b", json!({"status": "approved"}));
        assert_eq!(saga.state_bag["status"], json!("approved"));
    }

    #[test]
    fn replay_applies_unabsorbed_forward_successes() {
        const STEPS: [&str; 3] = ["validate", "kyc", "decide"];

        let mut saga = instance();
        saga.start();
        let records = vec![
            StepExecutionRecord::success(
                saga.id,
                0,
                Direction::Forward,
                1,
                chrono::Utc::now(),
                Some(json!({"valid": true})),
            ),
            StepExecutionRecord::success(
                saga.id,
                1,
                Direction::Forward,
                1,
                chrono::Utc::now(),
                Some(json!("K-9")),
            ),
        ];

        let replayed = saga.replay(&records, &STEPS);
        assert_eq!(replayed.current_step_index, 2);
        assert_eq!(replayed.status, SagaStatus::Running);
        assert_eq!(replayed.state_bag["valid"], json!(true));
        // Scalar outputs key under the step name.
        assert_eq!(replayed.state_bag["kyc"], json!("K-9"));
    }

    #[test]
    fn replay_runs_to_completed_at_the_last_step() {
        const STEPS: [&str; 2] = ["a", "b"];

        let mut saga = instance();
        saga.start();
        let records = vec![
            StepExecutionRecord::success(saga.id, 0, Direction::Forward, 1, Utc::now(), None),
            StepExecutionRecord::success(saga.id, 1, Direction::Forward, 1, Utc::now(), None),
        ];

        let replayed = saga.replay(&records, &STEPS);
        assert_eq!(replayed.status, SagaStatus::Completed);
        assert_eq!(replayed.current_step_index, 2);
    }

    #[test]
    fn replay_applies_unabsorbed_compensation_successes() {
        const STEPS: [&str; 3] = ["a", "b", "c"];

        let mut saga = instance();
        saga.start();
        saga.current_step_index = 2;
        saga.begin_compensation();

        let records = vec![
            StepExecutionRecord::success(saga.id, 2, Direction::Compensate, 1, Utc::now(), None),
        ];

        let replayed = saga.replay(&records, &STEPS);
        assert_eq!(replayed.status, SagaStatus::Compensating);
        assert_eq!(replayed.current_step_index, 1);
    }

    #[test]
    fn replay_of_an_up_to_date_snapshot_is_identity() {
        const STEPS: [&str; 2] = ["a", "b"];

        let mut saga = instance();
        saga.start();
        let records = vec![StepExecutionRecord::success(
            saga.id,
            0,
            Direction::Forward,
            1,
            Utc::now(),
            Some(json!({"done": 1})),
        )];
        saga.merge_output("a", json!({"done": 1}));
        saga.advance(2);

        let replayed = saga.clone().replay(&records, &STEPS);
        assert_eq!(replayed.current_step_index, saga.current_step_index);
        assert_eq!(replayed.status, saga.status);
        assert_eq!(replayed.state_bag, saga.state_bag);
    }

    #[test]
    fn serialization_roundtrip() {
        let mut saga = instance();
        saga.start();
        saga.merge_output("kyc", json!({"kyc_ref": "K-9"}));

        let json = serde_json::to_string(&saga).unwrap();
        let restored: SagaInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, saga.id);
        assert_eq!(restored.status, SagaStatus::Running);
        assert_eq!(restored.state_bag["kyc_ref"], json!("K-9"));
    }
}
