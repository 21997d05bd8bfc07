//! The immutable saga definition registry.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::step::{StepDefinition, StepSummary};

/// Errors raised while building or querying the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No definition registered under this saga type.
    #[error("unknown saga type: {0}")]
    UnknownSagaType(String),

    /// Two definitions were registered under the same saga type.
    #[error("duplicate saga type: {0}")]
    DuplicateSagaType(String),

    /// Two definitions claim the same initiating event.
    #[error("initiating event '{event}' already claimed by saga type '{saga_type}'")]
    DuplicateInitiatingEvent { event: String, saga_type: String },

    /// A definition was registered with no steps.
    #[error("saga type '{0}' has no steps")]
    EmptyDefinition(String),
}

/// The immutable contract for one saga type: an ordered, linear list of
/// steps plus the event that brings new instances into existence.
pub struct SagaDefinition {
    saga_type: String,
    initiating_event: String,
    steps: Vec<StepDefinition>,
}

impl SagaDefinition {
    /// Creates a definition. Step order is execution order.
    pub fn new(
        saga_type: impl Into<String>,
        initiating_event: impl Into<String>,
        steps: Vec<StepDefinition>,
    ) -> Self {
        Self {
            saga_type: saga_type.into(),
            initiating_event: initiating_event.into(),
            steps,
        }
    }

    /// The saga type identifier.
    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// The event type that creates a new instance of this saga.
    pub fn initiating_event(&self) -> &str {
        &self.initiating_event
    }

    /// The ordered step list.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the definition has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The step at `index`, if within bounds.
    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    /// Finds the index of the step whose completion event is `event_type`.
    pub fn step_for_completion(&self, event_type: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.completion_event() == event_type)
    }

    /// Finds the index of the step whose failure event is `event_type`.
    pub fn step_for_failure(&self, event_type: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.failure_event() == event_type)
    }

    /// Serializable projection of the registered step sequence.
    pub fn summaries(&self) -> Vec<StepSummary> {
        self.steps.iter().map(StepDefinition::summary).collect()
    }
}

impl std::fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("saga_type", &self.saga_type)
            .field("initiating_event", &self.initiating_event)
            .field("steps", &self.steps.len())
            .finish()
    }
}

/// Static catalog mapping saga type names to their definitions.
///
/// Built once at startup via [`RegistryBuilder`]; there is no mutation
/// path after [`RegistryBuilder::build`] returns.
pub struct DefinitionRegistry {
    by_type: HashMap<String, Arc<SagaDefinition>>,
    by_initiating_event: HashMap<String, Arc<SagaDefinition>>,
}

impl DefinitionRegistry {
    /// Starts an empty registry builder.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            definitions: Vec::new(),
        }
    }

    /// Looks up the definition for a saga type.
    pub fn get(&self, saga_type: &str) -> Result<&Arc<SagaDefinition>, RegistryError> {
        self.by_type
            .get(saga_type)
            .ok_or_else(|| RegistryError::UnknownSagaType(saga_type.to_string()))
    }

    /// Returns the definition whose initiating event is `event_type`,
    /// or `None` if the event does not start any registered saga.
    pub fn for_initiating_event(&self, event_type: &str) -> Option<&Arc<SagaDefinition>> {
        self.by_initiating_event.get(event_type)
    }

    /// Registered saga type names, unordered.
    pub fn saga_types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(String::as_str)
    }
}

/// Builder collecting definitions before freezing them into a registry.
pub struct RegistryBuilder {
    definitions: Vec<SagaDefinition>,
}

impl RegistryBuilder {
    /// Adds a definition to the catalog.
    pub fn register(mut self, definition: SagaDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Validates and freezes the registry.
    pub fn build(self) -> Result<DefinitionRegistry, RegistryError> {
        let mut by_type = HashMap::new();
        let mut by_initiating_event: HashMap<String, Arc<SagaDefinition>> = HashMap::new();

        for definition in self.definitions {
            if definition.is_empty() {
                return Err(RegistryError::EmptyDefinition(
                    definition.saga_type().to_string(),
                ));
            }
            if let Some(existing) = by_initiating_event.get(definition.initiating_event()) {
                return Err(RegistryError::DuplicateInitiatingEvent {
                    event: definition.initiating_event().to_string(),
                    saga_type: existing.saga_type().to_string(),
                });
            }

            let definition = Arc::new(definition);
            if by_type
                .insert(definition.saga_type().to_string(), definition.clone())
                .is_some()
            {
                return Err(RegistryError::DuplicateSagaType(
                    definition.saga_type().to_string(),
                ));
            }
            by_initiating_event.insert(
                definition.initiating_event().to_string(),
                definition.clone(),
            );
        }

        Ok(DefinitionRegistry {
            by_type,
            by_initiating_event,
        })
    }
}
