//! Step execution with timeout, retry and idempotency guards.

use chrono::Utc;
use definition::{ActionContext, StepAction, StepDefinition};
use std::sync::Arc;
use store::{Direction, SagaInstance, SagaStore, StepExecutionRecord};

use crate::error::Result;

/// Terminal outcome of driving one step in one direction.
///
/// Retries happen inside the executor; callers only see the final
/// verdict after the retry budget is spent.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The action returned output.
    Success(serde_json::Value),
    /// The action failed permanently, either by rejection or by
    /// exhausting its retries.
    Failure(String),
    /// The final attempt exceeded the step timeout.
    TimedOut,
}

impl StepOutcome {
    /// Returns true for [`StepOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success(_))
    }

    /// Human-readable reason for a non-success outcome.
    pub fn reason(&self) -> Option<&str> {
        match self {
            StepOutcome::Success(_) => None,
            StepOutcome::Failure(reason) => Some(reason),
            StepOutcome::TimedOut => Some("step timed out"),
        }
    }
}

/// Runs step actions against the store's execution history.
///
/// Every attempt leaves a [`StepExecutionRecord`]; a successful
/// execution for a `(saga, step, direction)` key is recorded exactly
/// once, and re-invocations short-circuit on the existing record
/// instead of re-running the action.
pub struct StepExecutor<S> {
    store: S,
}

impl<S: SagaStore> StepExecutor<S> {
    /// Creates an executor over a store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Records the externally signalled success of a forward step.
    ///
    /// Returns `false` when a success record already exists, which is
    /// the duplicate-delivery signal.
    pub async fn record_forward_success(
        &self,
        instance: &SagaInstance,
        step_index: i32,
        output: Option<serde_json::Value>,
    ) -> Result<bool> {
        let attempt = self
            .store
            .attempts(instance.id, step_index, Direction::Forward)
            .await?
            + 1;
        let record = StepExecutionRecord::success(
            instance.id,
            step_index,
            Direction::Forward,
            attempt,
            Utc::now(),
            output,
        );
        Ok(self.store.append_record(record).await?)
    }

    /// Records an externally signalled or operator-forced step failure.
    pub async fn record_forward_failure(
        &self,
        instance: &SagaInstance,
        step_index: i32,
        reason: &str,
    ) -> Result<()> {
        let attempt = self
            .store
            .attempts(instance.id, step_index, Direction::Forward)
            .await?
            + 1;
        let record = StepExecutionRecord::failure(
            instance.id,
            step_index,
            Direction::Forward,
            attempt,
            Utc::now(),
            reason,
        );
        self.store.append_record(record).await?;
        Ok(())
    }

    /// Issues a step's forward command.
    ///
    /// Success here means the command went out, not that the business
    /// outcome is known; that arrives later as a completion or failure
    /// event, and only the event appends the forward success record. If
    /// the step already has a recorded success the dispatch is skipped
    /// entirely.
    pub async fn dispatch(
        &self,
        instance: &SagaInstance,
        step_index: i32,
        step: &StepDefinition,
    ) -> Result<StepOutcome> {
        if let Some(record) = self
            .store
            .success_record(instance.id, step_index, Direction::Forward)
            .await?
        {
            tracing::debug!(
                saga_id = %instance.id,
                step = step.name(),
                "step already succeeded, skipping dispatch"
            );
            return Ok(StepOutcome::Success(
                record.output.unwrap_or(serde_json::Value::Null),
            ));
        }

        self.drive(instance, step_index, step, Direction::Forward, step.forward(), false)
            .await
    }

    /// Runs a step's compensation to completion.
    ///
    /// Unlike forward dispatch, the action's return value is the
    /// outcome itself, and a success record is appended here. Steps
    /// without a compensation action succeed vacuously.
    pub async fn compensate(
        &self,
        instance: &SagaInstance,
        step_index: i32,
        step: &StepDefinition,
    ) -> Result<StepOutcome> {
        let Some(action) = step.compensation() else {
            return Ok(StepOutcome::Success(serde_json::Value::Null));
        };

        if let Some(record) = self
            .store
            .success_record(instance.id, step_index, Direction::Compensate)
            .await?
        {
            tracing::debug!(
                saga_id = %instance.id,
                step = step.name(),
                "step already compensated, skipping"
            );
            return Ok(StepOutcome::Success(
                record.output.unwrap_or(serde_json::Value::Null),
            ));
        }

        self.drive(instance, step_index, step, Direction::Compensate, action, true)
            .await
    }

    /// The attempt loop shared by dispatch and compensation.
    ///
    /// Attempt numbering continues from the persisted history, so a
    /// resumed saga does not reuse attempt numbers it already burned.
    /// The retry budget (`max_retries`) applies per invocation.
    async fn drive(
        &self,
        instance: &SagaInstance,
        step_index: i32,
        step: &StepDefinition,
        direction: Direction,
        action: &Arc<dyn StepAction>,
        record_success: bool,
    ) -> Result<StepOutcome> {
        let max_attempts = step.max_retries() + 1;
        let mut attempt = self
            .store
            .attempts(instance.id, step_index, direction)
            .await?
            + 1;
        let mut made = 0u32;

        loop {
            made += 1;
            let started_at = Utc::now();
            let ctx = ActionContext {
                saga_id: instance.id,
                correlation_id: instance.correlation_id.clone(),
                step_name: step.name().to_string(),
                input: serde_json::Value::Object(instance.state_bag.clone()),
            };

            match tokio::time::timeout(step.timeout(), action.run(ctx)).await {
                Ok(Ok(output)) => {
                    if record_success {
                        let record = StepExecutionRecord::success(
                            instance.id,
                            step_index,
                            direction,
                            attempt,
                            started_at,
                            Some(output.clone()),
                        );
                        self.store.append_record(record).await?;
                    }
                    return Ok(StepOutcome::Success(output));
                }
                Ok(Err(error)) => {
                    let record = StepExecutionRecord::failure(
                        instance.id,
                        step_index,
                        direction,
                        attempt,
                        started_at,
                        error.to_string(),
                    );
                    self.store.append_record(record).await?;

                    if !error.is_retryable() {
                        tracing::warn!(
                            saga_id = %instance.id,
                            step = step.name(),
                            %direction,
                            %error,
                            "step rejected, not retrying"
                        );
                        return Ok(StepOutcome::Failure(error.to_string()));
                    }
                    if made >= max_attempts {
                        tracing::warn!(
                            saga_id = %instance.id,
                            step = step.name(),
                            %direction,
                            attempts = made,
                            "retry budget exhausted"
                        );
                        return Ok(StepOutcome::Failure(error.to_string()));
                    }
                }
                Err(_) => {
                    let record = StepExecutionRecord::timed_out(
                        instance.id,
                        step_index,
                        direction,
                        attempt,
                        started_at,
                    );
                    self.store.append_record(record).await?;

                    if made >= max_attempts {
                        tracing::warn!(
                            saga_id = %instance.id,
                            step = step.name(),
                            %direction,
                            attempts = made,
                            "step timed out, retry budget exhausted"
                        );
                        return Ok(StepOutcome::TimedOut);
                    }
                }
            }

            metrics::counter!("saga_step_retries_total").increment(1);
            let delay = step.backoff().delay_for(made);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::InMemoryAction;
    use std::time::Duration;
    use store::{CorrelationId, InMemorySagaStore, StateBag};

    fn instance() -> SagaInstance {
        let mut saga = SagaInstance::new(
            "Demo",
            CorrelationId::new("C1"),
            StateBag::new(),
        );
        saga.start();
        saga
    }

    fn step_with(action: InMemoryAction) -> StepDefinition {
        StepDefinition::builder("demo", Arc::new(action))
            .timeout(Duration::from_millis(200))
            .max_retries(2)
            .backoff(definition::BackoffPolicy::None)
            .build()
    }

    #[tokio::test]
    async fn dispatch_success_appends_no_record() {
        let store = InMemorySagaStore::new();
        let executor = StepExecutor::new(store.clone());
        let saga = instance();
        let step = step_with(InMemoryAction::returning(serde_json::json!({"ok": 1})));

        let outcome = executor.dispatch(&saga, 0, &step).await.unwrap();
        assert!(outcome.is_success());
        // The success record belongs to the completion event, not the dispatch.
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn dispatch_skips_already_succeeded_step() {
        let store = InMemorySagaStore::new();
        let executor = StepExecutor::new(store.clone());
        let saga = instance();
        let action = InMemoryAction::returning(serde_json::Value::Null);
        let step = step_with(action.clone());

        executor
            .record_forward_success(&saga, 0, Some(serde_json::json!({"cached": true})))
            .await
            .unwrap();

        let outcome = executor.dispatch(&saga, 0, &step).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Success(serde_json::json!({"cached": true}))
        );
        assert_eq!(action.call_count().await, 0);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let store = InMemorySagaStore::new();
        let executor = StepExecutor::new(store.clone());
        let saga = instance();
        let action = InMemoryAction::rejecting("applicant under age");
        let step = step_with(action.clone());

        let outcome = executor.dispatch(&saga, 0, &step).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failure(_)));
        assert_eq!(action.call_count().await, 1);
        assert_eq!(store.attempts(saga.id, 0, Direction::Forward).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retryable_failure_retries_until_budget_spent() {
        let store = InMemorySagaStore::new();
        let executor = StepExecutor::new(store.clone());
        let saga = instance();
        let action = InMemoryAction::retryable_failing("provider 503");
        let step = step_with(action.clone());

        let outcome = executor.dispatch(&saga, 0, &step).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failure(_)));
        // max_retries = 2 means three attempts total.
        assert_eq!(action.call_count().await, 3);
        assert_eq!(store.attempts(saga.id, 0, Direction::Forward).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn flaky_step_succeeds_after_retry() {
        let store = InMemorySagaStore::new();
        let executor = StepExecutor::new(store.clone());
        let saga = instance();
        let action = InMemoryAction::flaky("provider 503", 2, serde_json::json!({"done": true}));
        let step = step_with(action.clone());

        let outcome = executor.dispatch(&saga, 0, &step).await.unwrap();
        assert_eq!(outcome, StepOutcome::Success(serde_json::json!({"done": true})));
        assert_eq!(action.call_count().await, 3);
        // Two failure records, no success record from dispatch.
        assert_eq!(store.attempts(saga.id, 0, Direction::Forward).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_records_timed_out_attempts() {
        let store = InMemorySagaStore::new();
        let executor = StepExecutor::new(store.clone());
        let saga = instance();
        let action = InMemoryAction::slow(Duration::from_secs(60), serde_json::Value::Null);
        let step = step_with(action.clone());

        let outcome = executor.dispatch(&saga, 0, &step).await.unwrap();
        assert_eq!(outcome, StepOutcome::TimedOut);
        assert_eq!(store.attempts(saga.id, 0, Direction::Forward).await.unwrap(), 3);
        let records = store.records_for(saga.id).await.unwrap();
        assert!(records.iter().all(|r| r.outcome == store::ExecutionOutcome::TimedOut));
    }

    #[tokio::test]
    async fn compensation_records_success_and_is_idempotent() {
        let store = InMemorySagaStore::new();
        let executor = StepExecutor::new(store.clone());
        let saga = instance();
        let comp = InMemoryAction::returning(serde_json::json!({"released": true}));
        let step = StepDefinition::builder("demo", Arc::new(InMemoryAction::default()))
            .compensation(Arc::new(comp.clone()))
            .backoff(definition::BackoffPolicy::None)
            .build();

        let outcome = executor.compensate(&saga, 0, &step).await.unwrap();
        assert!(outcome.is_success());
        assert!(store.has_succeeded(saga.id, 0, Direction::Compensate).await.unwrap());
        assert_eq!(comp.call_count().await, 1);

        // Second run returns the recorded outcome without re-invoking.
        let again = executor.compensate(&saga, 0, &step).await.unwrap();
        assert_eq!(again, StepOutcome::Success(serde_json::json!({"released": true})));
        assert_eq!(comp.call_count().await, 1);
    }

    #[tokio::test]
    async fn missing_compensation_succeeds_vacuously() {
        let store = InMemorySagaStore::new();
        let executor = StepExecutor::new(store.clone());
        let saga = instance();
        let step = step_with(InMemoryAction::default());

        let outcome = executor.compensate(&saga, 0, &step).await.unwrap();
        assert_eq!(outcome, StepOutcome::Success(serde_json::Value::Null));
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn attempt_numbering_resumes_from_history() {
        let store = InMemorySagaStore::new();
        let executor = StepExecutor::new(store.clone());
        let saga = instance();

        executor
            .record_forward_failure(&saga, 0, "first crash")
            .await
            .unwrap();

        let action = InMemoryAction::rejecting("still broken");
        let step = step_with(action);
        executor.dispatch(&saga, 0, &step).await.unwrap();

        let records = store.records_for(saga.id).await.unwrap();
        let attempts: Vec<u32> = records.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
    }
}
