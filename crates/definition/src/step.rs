//! Step definitions.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::action::StepAction;
use crate::backoff::BackoffPolicy;

/// The immutable contract of one saga step.
///
/// Holds the resolved forward action, an optional compensation action,
/// the event names that signal the step's asynchronous outcome, and the
/// timeout/retry policy the executor enforces.
#[derive(Clone)]
pub struct StepDefinition {
    name: String,
    completion_event: String,
    failure_event: String,
    forward: Arc<dyn StepAction>,
    compensation: Option<Arc<dyn StepAction>>,
    timeout: Duration,
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl StepDefinition {
    /// Starts building a step with the given name and forward action.
    pub fn builder(name: impl Into<String>, forward: Arc<dyn StepAction>) -> StepDefinitionBuilder {
        StepDefinitionBuilder {
            name: name.into(),
            completion_event: None,
            failure_event: None,
            forward,
            compensation: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff: BackoffPolicy::default_exponential(),
        }
    }

    /// The step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event type that signals this step completed successfully.
    pub fn completion_event(&self) -> &str {
        &self.completion_event
    }

    /// Event type that signals this step failed.
    pub fn failure_event(&self) -> &str {
        &self.failure_event
    }

    /// The forward action reference.
    pub fn forward(&self) -> &Arc<dyn StepAction> {
        &self.forward
    }

    /// The compensation action, if this step defines one.
    pub fn compensation(&self) -> Option<&Arc<dyn StepAction>> {
        self.compensation.as_ref()
    }

    /// Returns true if this step has a compensating action.
    pub fn has_compensation(&self) -> bool {
        self.compensation.is_some()
    }

    /// Maximum time a single action invocation may take.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay strategy between retries.
    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Serializable projection of this step for diagnostics.
    pub fn summary(&self) -> StepSummary {
        StepSummary {
            name: self.name.clone(),
            completion_event: self.completion_event.clone(),
            failure_event: self.failure_event.clone(),
            has_compensation: self.compensation.is_some(),
            timeout_ms: self.timeout.as_millis() as u64,
            max_retries: self.max_retries,
        }
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("completion_event", &self.completion_event)
            .field("failure_event", &self.failure_event)
            .field("has_compensation", &self.compensation.is_some())
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// Builder for [`StepDefinition`].
pub struct StepDefinitionBuilder {
    name: String,
    completion_event: Option<String>,
    failure_event: Option<String>,
    forward: Arc<dyn StepAction>,
    compensation: Option<Arc<dyn StepAction>>,
    timeout: Duration,
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl StepDefinitionBuilder {
    /// Sets the event type signalling successful completion.
    ///
    /// Defaults to `"<name>.completed"` if not set.
    pub fn completion_event(mut self, event_type: impl Into<String>) -> Self {
        self.completion_event = Some(event_type.into());
        self
    }

    /// Sets the event type signalling failure.
    ///
    /// Defaults to `"<name>.failed"` if not set.
    pub fn failure_event(mut self, event_type: impl Into<String>) -> Self {
        self.failure_event = Some(event_type.into());
        self
    }

    /// Sets the compensating action.
    pub fn compensation(mut self, action: Arc<dyn StepAction>) -> Self {
        self.compensation = Some(action);
        self
    }

    /// Sets the per-invocation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the number of retries allowed after the first attempt.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff policy applied between retries.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Builds the step definition.
    pub fn build(self) -> StepDefinition {
        let completion_event = self
            .completion_event
            .unwrap_or_else(|| format!("{}.completed", self.name));
        let failure_event = self
            .failure_event
            .unwrap_or_else(|| format!("{}.failed", self.name));
        StepDefinition {
            name: self.name,
            completion_event,
            failure_event,
            forward: self.forward,
            compensation: self.compensation,
            timeout: self.timeout,
            max_retries: self.max_retries,
            backoff: self.backoff,
        }
    }
}

/// Serializable step projection returned by the diagnostics surface.
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub name: String,
    pub completion_event: String,
    pub failure_event: String,
    pub has_compensation: bool,
    pub timeout_ms: u64,
    pub max_retries: u32,
}
