//! The citizenship application saga.
//!
//! The reference definition used throughout the tests: validate the
//! application, run KYC, decide, issue the passport. Validation keeps
//! no external state and so has no compensation; everything after it
//! does.

use std::sync::Arc;
use std::time::Duration;

use definition::{BackoffPolicy, SagaDefinition, StepAction, StepDefinition};

pub const SAGA_TYPE: &str = "CitizenshipApplication";

pub const EVENT_APPLICATION_SUBMITTED: &str = "ApplicationSubmitted";
pub const EVENT_VALIDATED: &str = "ApplicationValidated";
pub const EVENT_VALIDATION_FAILED: &str = "ApplicationValidationFailed";
pub const EVENT_KYC_COMPLETED: &str = "KycCompleted";
pub const EVENT_KYC_FAILED: &str = "KycFailed";
pub const EVENT_DECIDED: &str = "ApplicationDecided";
pub const EVENT_DECISION_FAILED: &str = "ApplicationDecisionFailed";
pub const EVENT_PASSPORT_ISSUED: &str = "PassportIssued";
pub const EVENT_PASSPORT_FAILED: &str = "PassportIssuanceFailed";

pub const STEP_VALIDATE: &str = "validate_application";
pub const STEP_KYC: &str = "run_kyc";
pub const STEP_DECIDE: &str = "approve_or_reject";
pub const STEP_ISSUE_PASSPORT: &str = "issue_passport";

/// The actions backing the four steps and their compensations.
///
/// Kept as a plain struct so tests can wire scripted actions in and a
/// deployment can wire real service clients.
pub struct CitizenshipActions {
    pub validate: Arc<dyn StepAction>,
    pub kyc: Arc<dyn StepAction>,
    pub purge_kyc_data: Arc<dyn StepAction>,
    pub decide: Arc<dyn StepAction>,
    pub revoke_decision: Arc<dyn StepAction>,
    pub issue_passport: Arc<dyn StepAction>,
    pub revoke_passport: Arc<dyn StepAction>,
}

/// Builds the citizenship application definition over the given actions.
pub fn definition(actions: CitizenshipActions) -> SagaDefinition {
    SagaDefinition::new(
        SAGA_TYPE,
        EVENT_APPLICATION_SUBMITTED,
        vec![
            StepDefinition::builder(STEP_VALIDATE, actions.validate)
                .completion_event(EVENT_VALIDATED)
                .failure_event(EVENT_VALIDATION_FAILED)
                .timeout(Duration::from_secs(10))
                .max_retries(1)
                .backoff(BackoffPolicy::Fixed(Duration::from_millis(200)))
                .build(),
            StepDefinition::builder(STEP_KYC, actions.kyc)
                .completion_event(EVENT_KYC_COMPLETED)
                .failure_event(EVENT_KYC_FAILED)
                .compensation(actions.purge_kyc_data)
                .timeout(Duration::from_secs(30))
                .max_retries(3)
                .build(),
            StepDefinition::builder(STEP_DECIDE, actions.decide)
                .completion_event(EVENT_DECIDED)
                .failure_event(EVENT_DECISION_FAILED)
                .compensation(actions.revoke_decision)
                .timeout(Duration::from_secs(10))
                .max_retries(1)
                .build(),
            StepDefinition::builder(STEP_ISSUE_PASSPORT, actions.issue_passport)
                .completion_event(EVENT_PASSPORT_ISSUED)
                .failure_event(EVENT_PASSPORT_FAILED)
                .compensation(actions.revoke_passport)
                .timeout(Duration::from_secs(30))
                .max_retries(2)
                .build(),
        ],
    )
}
