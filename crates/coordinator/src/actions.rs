//! Configurable in-memory step actions.
//!
//! These back the example definitions and the test suites; a real
//! deployment implements [`StepAction`] over its own service clients
//! instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use definition::{ActionContext, ActionError, StepAction};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
enum FailureMode {
    #[default]
    Succeed,
    Retryable(String),
    Rejected(String),
}

#[derive(Default)]
struct Inner {
    output: serde_json::Value,
    mode: FailureMode,
    // Number of leading invocations that fail before `mode` flips to
    // success; 0 means the mode applies forever.
    failures_before_success: u32,
    delay: Option<Duration>,
    calls: u32,
    contexts: Vec<ActionContext>,
}

/// A step action whose behavior is scripted up front.
///
/// Shared behind `Arc` like any other action; the interior lock lets
/// tests inspect invocation counts and received contexts afterwards.
#[derive(Clone, Default)]
pub struct InMemoryAction {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryAction {
    /// Succeeds on every call with the given output.
    pub fn returning(output: serde_json::Value) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                output,
                ..Inner::default()
            })),
        }
    }

    /// Fails every call with a permanent business rejection.
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                mode: FailureMode::Rejected(reason.into()),
                ..Inner::default()
            })),
        }
    }

    /// Fails every call with a transient, retryable error.
    pub fn retryable_failing(reason: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                mode: FailureMode::Retryable(reason.into()),
                ..Inner::default()
            })),
        }
    }

    /// Fails the first `failures` calls with a retryable error, then
    /// succeeds with `output`.
    pub fn flaky(reason: impl Into<String>, failures: u32, output: serde_json::Value) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                output,
                mode: FailureMode::Retryable(reason.into()),
                failures_before_success: failures,
                ..Inner::default()
            })),
        }
    }

    /// Sleeps for `delay` before succeeding with `output`.
    pub fn slow(delay: Duration, output: serde_json::Value) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                output,
                delay: Some(delay),
                ..Inner::default()
            })),
        }
    }

    /// Number of times the action has been invoked.
    pub async fn call_count(&self) -> u32 {
        self.inner.read().await.calls
    }

    /// The contexts the action was invoked with, in order.
    pub async fn contexts(&self) -> Vec<ActionContext> {
        self.inner.read().await.contexts.clone()
    }
}

#[async_trait]
impl StepAction for InMemoryAction {
    async fn run(&self, ctx: ActionContext) -> Result<serde_json::Value, ActionError> {
        let (result, delay) = {
            let mut inner = self.inner.write().await;
            inner.calls += 1;
            inner.contexts.push(ctx);

            let exhausted = inner.failures_before_success > 0
                && inner.calls > inner.failures_before_success;
            let result = match (&inner.mode, exhausted) {
                (FailureMode::Succeed, _) | (_, true) => Ok(inner.output.clone()),
                (FailureMode::Retryable(reason), false) => {
                    Err(ActionError::Retryable(reason.clone()))
                }
                (FailureMode::Rejected(reason), false) => {
                    Err(ActionError::Rejected(reason.clone()))
                }
            };
            (result, inner.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}
