//! The saga coordinator proper.

use std::sync::Arc;
use std::time::Instant;

use common::SagaId;
use definition::{DefinitionRegistry, SagaDefinition, StepDefinition};
use store::{Direction, SagaInstance, SagaStatus, SagaStore, StateBag, StoreError};

use crate::correlator::{EventCorrelator, Resolution};
use crate::error::{Result, SagaError};
use crate::event::EventMessage;
use crate::executor::{StepExecutor, StepOutcome};
use crate::view::{DefinitionView, SagaView};

/// Snapshot reloads tolerated before giving up on a contended saga.
const MAX_CONFLICT_RETRIES: u32 = 5;

/// What handling one event did to the saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorResult {
    /// A new instance was created and its first step dispatched.
    Started { saga_id: SagaId },
    /// The current step completed and the next one was dispatched.
    Advanced { saga_id: SagaId, next_step: i32 },
    /// The last step completed; the saga is done.
    Completed { saga_id: SagaId },
    /// Rollback finished; every completed step was undone.
    Compensated { saga_id: SagaId },
    /// A compensation exhausted its retries; manual intervention needed.
    CompensationFailed { saga_id: SagaId },
    /// The saga failed before any step completed; nothing to undo.
    Failed { saga_id: SagaId },
    /// The event had already been applied; no state changed.
    Duplicate,
    /// The event was valid but not actionable in the current state.
    Ignored { reason: String },
}

/// Drives saga instances through their definitions.
///
/// One coordinator serves every registered saga type. All state lives
/// in the store; the coordinator itself can be dropped and rebuilt at
/// any time, and multiple coordinators may share one store — the
/// store's compare-and-swap `save` arbitrates between them.
pub struct SagaCoordinator<S> {
    store: S,
    registry: Arc<DefinitionRegistry>,
    correlator: EventCorrelator<S>,
    executor: StepExecutor<S>,
}

impl<S: SagaStore + Clone> SagaCoordinator<S> {
    /// Creates a coordinator over a store and a frozen registry.
    pub fn new(store: S, registry: Arc<DefinitionRegistry>) -> Self {
        let correlator = EventCorrelator::new(store.clone(), registry.clone());
        let executor = StepExecutor::new(store.clone());
        Self {
            store,
            registry,
            correlator,
            executor,
        }
    }

    /// Handles one inbound event.
    ///
    /// This is the single entry point for event-driven progress: the
    /// event is resolved to an instance, classified against the current
    /// step, and applied. A concurrency conflict means another handler
    /// moved the saga first; the snapshot is reloaded and the event
    /// re-applied against the fresh state, where it usually classifies
    /// as a duplicate.
    #[tracing::instrument(skip_all, fields(
        event_type = %event.event_type,
        correlation_id = %event.correlation_id,
    ))]
    pub async fn handle(&self, event: EventMessage) -> Result<CoordinatorResult> {
        let started = Instant::now();
        metrics::counter!("saga_events_total").increment(1);

        if self.correlator.already_processed(event.event_id).await {
            metrics::counter!("saga_events_duplicate_total").increment(1);
            return Ok(CoordinatorResult::Duplicate);
        }

        let mut resolution = self.correlator.resolve(&event).await?;
        let mut attempt = 0u32;
        let result = loop {
            attempt += 1;
            match self.apply(&event, &resolution).await {
                Ok(result) => break result,
                Err(SagaError::Store(
                    StoreError::ConcurrencyConflict { .. }
                    | StoreError::DuplicateCorrelation(_),
                )) if attempt < MAX_CONFLICT_RETRIES => {
                    tracing::warn!(
                        saga_id = %resolution.instance.id,
                        attempt,
                        "concurrent update, reloading snapshot"
                    );
                    resolution = match self.correlator.resolve(&event).await {
                        Ok(resolution) => resolution,
                        Err(SagaError::NoMatchingSaga { .. }) => {
                            // The racing handler drove the saga to a
                            // terminal state in the meantime.
                            break CoordinatorResult::Ignored {
                                reason: "saga reached a terminal state".to_string(),
                            };
                        }
                        Err(other) => return Err(other),
                    };
                }
                Err(SagaError::Store(
                    StoreError::ConcurrencyConflict { .. }
                    | StoreError::DuplicateCorrelation(_),
                )) => {
                    return Err(SagaError::ConflictRetriesExhausted {
                        saga_id: resolution.instance.id,
                        attempts: attempt,
                    });
                }
                Err(other) => return Err(other),
            }
        };

        self.correlator.mark_processed(event.event_id).await;
        metrics::histogram!("saga_handle_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(result)
    }

    async fn apply(
        &self,
        event: &EventMessage,
        resolution: &Resolution,
    ) -> Result<CoordinatorResult> {
        let mut instance = resolution.instance.clone();
        let definition = self.registry.get(&instance.saga_type)?.clone();

        if resolution.is_new {
            return self.start_instance(&definition, instance).await;
        }

        match instance.status {
            SagaStatus::NotStarted => {
                if event.event_type == definition.initiating_event() {
                    instance.merge_output(&event.event_type, event.payload.clone());
                    self.start_instance(&definition, instance).await
                } else {
                    Ok(CoordinatorResult::Ignored {
                        reason: "saga has not been started".to_string(),
                    })
                }
            }
            SagaStatus::Running => {
                let current = instance.current_step_index;
                if let Some(index) = definition.step_for_completion(&event.event_type) {
                    let index = index as i32;
                    if index < current {
                        metrics::counter!("saga_events_duplicate_total").increment(1);
                        Ok(CoordinatorResult::Duplicate)
                    } else if index > current {
                        tracing::warn!(
                            saga_id = %instance.id,
                            step = index,
                            current,
                            "completion event ahead of current step"
                        );
                        Ok(CoordinatorResult::Ignored {
                            reason: format!(
                                "completion for step {index} while step {current} is in flight"
                            ),
                        })
                    } else {
                        self.complete_current(&definition, instance, event.payload.clone())
                            .await
                    }
                } else if let Some(index) = definition.step_for_failure(&event.event_type) {
                    let index = index as i32;
                    if index != current {
                        Ok(CoordinatorResult::Ignored {
                            reason: format!(
                                "failure for step {index} while step {current} is in flight"
                            ),
                        })
                    } else {
                        let reason = failure_reason(event);
                        // Record the trigger before any transition so the
                        // history explains the rollback.
                        self.executor
                            .record_forward_failure(&instance, current, &reason)
                            .await?;
                        self.fail_and_compensate(&definition, instance, &reason).await
                    }
                } else if event.event_type == definition.initiating_event() {
                    Ok(CoordinatorResult::Duplicate)
                } else {
                    Ok(CoordinatorResult::Ignored {
                        reason: format!(
                            "event '{}' is not part of saga type '{}'",
                            event.event_type, instance.saga_type
                        ),
                    })
                }
            }
            SagaStatus::Compensating => {
                if definition.step_for_failure(&event.event_type).is_some() {
                    // A redelivered failure event resumes an interrupted
                    // rollback; records make the walk idempotent.
                    self.run_compensation(&definition, instance).await
                } else {
                    Ok(CoordinatorResult::Ignored {
                        reason: "rollback in progress".to_string(),
                    })
                }
            }
            terminal => Ok(CoordinatorResult::Ignored {
                reason: format!("saga is {terminal}"),
            }),
        }
    }

    async fn start_instance(
        &self,
        definition: &Arc<SagaDefinition>,
        mut instance: SagaInstance,
    ) -> Result<CoordinatorResult> {
        instance.start();
        let expected = instance.bump();
        self.store.save(&instance, expected).await?;
        metrics::counter!("sagas_started_total").increment(1);
        tracing::info!(
            saga_id = %instance.id,
            saga_type = %instance.saga_type,
            "saga started"
        );

        let saga_id = instance.id;
        match self.dispatch_current(definition, &instance).await? {
            Some(result) => Ok(result),
            None => Ok(CoordinatorResult::Started { saga_id }),
        }
    }

    /// Issues the command for the step the instance currently points at.
    ///
    /// Returns `None` when the command went out and the saga now waits
    /// for its outcome event; returns the terminal result when the
    /// dispatch itself failed and cascaded into rollback.
    async fn dispatch_current(
        &self,
        definition: &Arc<SagaDefinition>,
        instance: &SagaInstance,
    ) -> Result<Option<CoordinatorResult>> {
        let index = instance.current_step_index;
        let step = self.step_at(definition, instance, index)?;

        match self.executor.dispatch(instance, index, step).await? {
            StepOutcome::Success(_) => Ok(None),
            outcome => {
                let reason = outcome.reason().unwrap_or("step failed").to_string();
                self.fail_and_compensate(definition, instance.clone(), &reason)
                    .await
                    .map(Some)
            }
        }
    }

    /// Applies a completion event for the step currently in flight.
    ///
    /// The success record is appended before the snapshot write, so a
    /// crash between the two leaves a gap [`Self::recover`] can close.
    async fn complete_current(
        &self,
        definition: &Arc<SagaDefinition>,
        mut instance: SagaInstance,
        payload: serde_json::Value,
    ) -> Result<CoordinatorResult> {
        let saga_id = instance.id;
        let index = instance.current_step_index;
        let step_name = self.step_at(definition, &instance, index)?.name().to_string();

        let newly = self
            .executor
            .record_forward_success(&instance, index, Some(payload.clone()))
            .await?;
        let output = if newly {
            payload
        } else {
            // Redelivery after a lost snapshot write; reuse the output
            // recorded the first time so replays stay deterministic.
            self.store
                .success_record(saga_id, index, Direction::Forward)
                .await?
                .and_then(|record| record.output)
                .unwrap_or(payload)
        };

        instance.merge_output(&step_name, output);
        instance.advance(definition.len());
        let expected = instance.bump();
        self.store.save(&instance, expected).await?;

        if instance.status == SagaStatus::Completed {
            metrics::counter!("sagas_completed_total").increment(1);
            tracing::info!(saga_id = %saga_id, "saga completed");
            return Ok(CoordinatorResult::Completed { saga_id });
        }

        tracing::info!(
            saga_id = %saga_id,
            step = %step_name,
            next_step = instance.current_step_index,
            "step completed"
        );
        match self.dispatch_current(definition, &instance).await? {
            Some(result) => Ok(result),
            None => Ok(CoordinatorResult::Advanced {
                saga_id,
                next_step: instance.current_step_index,
            }),
        }
    }

    /// Decides between `Failed` and rollback after a step failure.
    ///
    /// `Failed` is reserved for the case where no step ever completed,
    /// so there is nothing to undo; any completed work forces the full
    /// compensation walk.
    async fn fail_and_compensate(
        &self,
        definition: &Arc<SagaDefinition>,
        mut instance: SagaInstance,
        reason: &str,
    ) -> Result<CoordinatorResult> {
        let saga_id = instance.id;

        // The current index is included: a success record for the step
        // may exist even though the snapshot never advanced past it.
        let mut anything_done = false;
        for index in 0..=instance.current_step_index {
            if self.store.has_succeeded(saga_id, index, Direction::Forward).await? {
                anything_done = true;
                break;
            }
        }

        if !anything_done {
            instance.fail();
            let expected = instance.bump();
            self.store.save(&instance, expected).await?;
            metrics::counter!("sagas_failed_total").increment(1);
            tracing::warn!(saga_id = %saga_id, reason, "saga failed with no completed steps");
            return Ok(CoordinatorResult::Failed { saga_id });
        }

        instance.begin_compensation();
        let expected = instance.bump();
        self.store.save(&instance, expected).await?;
        tracing::warn!(saga_id = %saga_id, reason, "saga failed, rolling back");
        self.run_compensation(definition, instance).await
    }

    /// Walks the index down from the failure point, compensating every
    /// step with a recorded forward success, newest first.
    ///
    /// Each decrement is persisted, so an interrupted walk resumes from
    /// where it stopped. Steps without a compensation action, and the
    /// failing step itself, are skipped.
    async fn run_compensation(
        &self,
        definition: &Arc<SagaDefinition>,
        mut instance: SagaInstance,
    ) -> Result<CoordinatorResult> {
        let saga_id = instance.id;

        while instance.current_step_index >= 0 {
            let index = instance.current_step_index;
            let step = self.step_at(definition, &instance, index)?;

            if self.store.has_succeeded(saga_id, index, Direction::Forward).await?
                && step.has_compensation()
            {
                match self.executor.compensate(&instance, index, step).await? {
                    StepOutcome::Success(_) => {
                        tracing::info!(saga_id = %saga_id, step = step.name(), "step compensated");
                    }
                    outcome => {
                        let reason = outcome.reason().unwrap_or("compensation failed");
                        instance.compensation_failed();
                        let expected = instance.bump();
                        self.store.save(&instance, expected).await?;
                        metrics::counter!("saga_compensations_failed_total").increment(1);
                        tracing::error!(
                            saga_id = %saga_id,
                            step = step.name(),
                            reason,
                            "compensation failed, manual intervention required"
                        );
                        return Ok(CoordinatorResult::CompensationFailed { saga_id });
                    }
                }
            }

            instance.step_compensated();
            let expected = instance.bump();
            self.store.save(&instance, expected).await?;
        }

        metrics::counter!("sagas_compensated_total").increment(1);
        tracing::info!(saga_id = %saga_id, "saga fully compensated");
        Ok(CoordinatorResult::Compensated { saga_id })
    }

    fn step_at<'a>(
        &self,
        definition: &'a SagaDefinition,
        instance: &SagaInstance,
        index: i32,
    ) -> Result<&'a StepDefinition> {
        usize::try_from(index)
            .ok()
            .and_then(|index| definition.step(index))
            .ok_or(SagaError::StepOutOfRange {
                saga_id: instance.id,
                step_index: index,
            })
    }

    // ---- management surface -------------------------------------------

    /// Creates a `NotStarted` instance without dispatching anything.
    ///
    /// Rejected when another active instance already claims the
    /// correlation id.
    pub async fn create(
        &self,
        saga_type: &str,
        correlation_id: impl Into<common::CorrelationId>,
        initial_state: StateBag,
        initiator_id: Option<String>,
    ) -> Result<SagaId> {
        let correlation_id = correlation_id.into();
        self.registry.get(saga_type)?;
        if self
            .store
            .load_by_correlation(&correlation_id)
            .await?
            .is_some()
        {
            return Err(SagaError::AlreadyActive(correlation_id));
        }

        let mut instance = SagaInstance::new(saga_type, correlation_id, initial_state);
        instance.initiator_id = initiator_id;
        let expected = instance.bump();
        match self.store.save(&instance, expected).await {
            Ok(_) => {}
            // The store guard closes the race the lookup above can miss.
            Err(StoreError::DuplicateCorrelation(correlation_id)) => {
                return Err(SagaError::AlreadyActive(correlation_id));
            }
            Err(other) => return Err(other.into()),
        }
        tracing::info!(saga_id = %instance.id, saga_type, "saga created");
        Ok(instance.id)
    }

    /// Starts a previously created instance and dispatches step 0.
    pub async fn start(&self, id: SagaId) -> Result<CoordinatorResult> {
        let instance = self.store.require(id).await?;
        if !instance.status.can_start() {
            return Err(SagaError::InvalidState {
                saga_id: id,
                operation: "start",
                expected: "NotStarted",
                actual: instance.status,
            });
        }
        let definition = self.registry.get(&instance.saga_type)?.clone();
        self.start_instance(&definition, instance).await
    }

    /// Returns the instance snapshot with its full execution history.
    pub async fn get(&self, id: SagaId) -> Result<SagaView> {
        let instance = self.store.require(id).await?;
        let history = self.store.records_for(id).await?;
        Ok(SagaView::new(instance, history))
    }

    /// Manually completes the step currently in flight.
    ///
    /// The call is turned into the step's completion event and routed
    /// through [`Self::handle`], so manual and event-driven completions
    /// share one code path and one idempotency guard.
    pub async fn complete_step(
        &self,
        id: SagaId,
        step_index: i32,
        output: serde_json::Value,
    ) -> Result<CoordinatorResult> {
        let (instance, step) = self.step_for_manual(id, step_index, "complete_step").await?;
        let event = EventMessage::new(
            step.completion_event().to_string(),
            instance.correlation_id.clone(),
            output,
        );
        self.handle(event).await
    }

    /// Manually fails the step currently in flight, triggering the same
    /// rollback a failure event would.
    pub async fn fail_step(
        &self,
        id: SagaId,
        step_index: i32,
        error_message: &str,
    ) -> Result<CoordinatorResult> {
        let (instance, step) = self.step_for_manual(id, step_index, "fail_step").await?;
        let event = EventMessage::new(
            step.failure_event().to_string(),
            instance.correlation_id.clone(),
            serde_json::json!({ "reason": error_message }),
        );
        self.handle(event).await
    }

    async fn step_for_manual(
        &self,
        id: SagaId,
        step_index: i32,
        operation: &'static str,
    ) -> Result<(SagaInstance, StepDefinition)> {
        let instance = self.store.require(id).await?;
        if instance.status != SagaStatus::Running {
            return Err(SagaError::InvalidState {
                saga_id: id,
                operation,
                expected: "Running",
                actual: instance.status,
            });
        }
        if step_index != instance.current_step_index {
            return Err(SagaError::StepIndexMismatch {
                saga_id: id,
                requested: step_index,
                current: instance.current_step_index,
            });
        }
        let definition = self.registry.get(&instance.saga_type)?;
        let step = self.step_at(definition, &instance, step_index)?.clone();
        Ok((instance, step))
    }

    /// Forces a rollback of a running saga, or resumes a stuck one.
    ///
    /// A saga parked in `CompensationFailed` is put back into
    /// `Compensating` and re-driven; compensation success records keep
    /// already-undone steps from running twice.
    pub async fn compensate(&self, id: SagaId) -> Result<CoordinatorResult> {
        let mut instance = self.store.require(id).await?;
        let definition = self.registry.get(&instance.saga_type)?.clone();
        match instance.status {
            SagaStatus::Running => {
                self.force_rollback(&definition, instance, "compensation requested")
                    .await
            }
            SagaStatus::Compensating => self.run_compensation(&definition, instance).await,
            SagaStatus::CompensationFailed => {
                instance.begin_compensation();
                let expected = instance.bump();
                self.store.save(&instance, expected).await?;
                tracing::info!(saga_id = %id, "retrying failed rollback");
                self.run_compensation(&definition, instance).await
            }
            other => Err(SagaError::InvalidState {
                saga_id: id,
                operation: "compensate",
                expected: "Running, Compensating or CompensationFailed",
                actual: other,
            }),
        }
    }

    /// Cancels a running saga: the same forced rollback as
    /// [`Self::compensate`], kept as a distinct verb for intent. A saga
    /// already rolling back is left alone.
    pub async fn cancel(&self, id: SagaId) -> Result<CoordinatorResult> {
        let instance = self.store.require(id).await?;
        let definition = self.registry.get(&instance.saga_type)?.clone();
        match instance.status {
            SagaStatus::Running => {
                self.force_rollback(&definition, instance, "saga cancelled").await
            }
            SagaStatus::Compensating => Ok(CoordinatorResult::Ignored {
                reason: "rollback already in progress".to_string(),
            }),
            other => Err(SagaError::InvalidState {
                saga_id: id,
                operation: "cancel",
                expected: "Running",
                actual: other,
            }),
        }
    }

    async fn force_rollback(
        &self,
        definition: &Arc<SagaDefinition>,
        instance: SagaInstance,
        reason: &str,
    ) -> Result<CoordinatorResult> {
        self.executor
            .record_forward_failure(&instance, instance.current_step_index, reason)
            .await?;
        self.fail_and_compensate(definition, instance, reason).await
    }

    /// Serializable projection of a registered definition.
    pub fn definition(&self, saga_type: &str) -> Result<DefinitionView> {
        let definition = self.registry.get(saga_type)?;
        Ok(DefinitionView::from(definition.as_ref()))
    }

    /// Closes the write-ahead gap after a crash.
    ///
    /// Every state change appends its execution record before the
    /// snapshot write, so the only possible inconsistency is a success
    /// record whose transition never landed. `recover` replays the
    /// record stream over the stored snapshot
    /// ([`SagaInstance::replay`]) and persists the repaired state if it
    /// differs. It does not dispatch anything; forward progress resumes
    /// with the next event, rollback via [`Self::compensate`].
    pub async fn recover(&self, id: SagaId) -> Result<SagaView> {
        let instance = self.store.require(id).await?;
        let definition = self.registry.get(&instance.saga_type)?.clone();
        let history = self.store.records_for(id).await?;

        let step_names: Vec<&str> =
            definition.steps().iter().map(StepDefinition::name).collect();
        let before = (instance.current_step_index, instance.status);
        let mut instance = instance.replay(&history, &step_names);

        if (instance.current_step_index, instance.status) != before {
            let expected = instance.bump();
            self.store.save(&instance, expected).await?;
            tracing::info!(
                saga_id = %id,
                status = %instance.status,
                step = instance.current_step_index,
                "recovered unreflected execution records"
            );
        }

        Ok(SagaView::new(instance, history))
    }
}

fn failure_reason(event: &EventMessage) -> String {
    event
        .payload
        .get("reason")
        .or_else(|| event.payload.get("error"))
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| event.event_type.clone())
}
