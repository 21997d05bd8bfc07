//! Read-only projections for the management surface.

use chrono::{DateTime, Utc};
use common::{CorrelationId, SagaId};
use definition::{SagaDefinition, StepSummary};
use serde::Serialize;
use store::{SagaInstance, SagaStatus, StateBag, StepExecutionRecord, Version};

/// Full picture of one saga: the current snapshot plus its ordered
/// execution history.
#[derive(Debug, Clone, Serialize)]
pub struct SagaView {
    pub id: SagaId,
    pub saga_type: String,
    pub correlation_id: CorrelationId,
    pub initiator_id: Option<String>,
    pub status: SagaStatus,
    pub current_step_index: i32,
    pub state_bag: StateBag,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StepExecutionRecord>,
}

impl SagaView {
    /// Assembles a view from a snapshot and its history.
    pub fn new(instance: SagaInstance, history: Vec<StepExecutionRecord>) -> Self {
        Self {
            id: instance.id,
            saga_type: instance.saga_type,
            correlation_id: instance.correlation_id,
            initiator_id: instance.initiator_id,
            status: instance.status,
            current_step_index: instance.current_step_index,
            state_bag: instance.state_bag,
            version: instance.version,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
            history,
        }
    }
}

/// Serializable projection of a registered definition.
#[derive(Debug, Clone, Serialize)]
pub struct DefinitionView {
    pub saga_type: String,
    pub initiating_event: String,
    pub steps: Vec<StepSummary>,
}

impl From<&SagaDefinition> for DefinitionView {
    fn from(definition: &SagaDefinition) -> Self {
        Self {
            saga_type: definition.saga_type().to_string(),
            initiating_event: definition.initiating_event().to_string(),
            steps: definition.summaries(),
        }
    }
}
