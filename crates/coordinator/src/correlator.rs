//! Event-to-instance resolution.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use common::EventId;
use definition::DefinitionRegistry;
use store::{SagaInstance, SagaStore, StateBag};
use tokio::sync::RwLock;

use crate::error::{Result, SagaError};
use crate::event::EventMessage;

/// The instance an event resolved to.
///
/// `is_new` marks an instance materialized from an initiating event
/// that has not been persisted yet; the coordinator owns its first
/// save.
#[derive(Debug)]
pub struct Resolution {
    pub instance: SagaInstance,
    pub is_new: bool,
}

/// Maps inbound events to saga instances.
///
/// Resolution order: an active instance for the event's correlation id
/// wins; otherwise, if the event type initiates a registered saga, a
/// fresh instance is materialized. Anything else is an error the caller
/// routes to its dead-letter handling.
///
/// The correlator also keeps a bounded in-process record of event ids
/// already handled, so a transport re-delivering the same message in
/// quick succession is acknowledged without touching the store. Ids
/// are evicted oldest-first once the record reaches capacity; an id
/// that fell out is simply re-checked against the store. The durable
/// idempotency guard is the store's one-success-per-step rule; this
/// set is only a fast path.
pub struct EventCorrelator<S> {
    store: S,
    registry: Arc<DefinitionRegistry>,
    seen: RwLock<SeenSet>,
}

/// Capacity of the processed-event fast path.
const SEEN_CAPACITY: usize = 10_000;

struct SeenSet {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl SeenSet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, event_id: EventId) {
        if !self.ids.insert(event_id) {
            return;
        }
        self.order.push_back(event_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, event_id: &EventId) -> bool {
        self.ids.contains(event_id)
    }
}

impl<S: SagaStore> EventCorrelator<S> {
    /// Creates a correlator over a store and a frozen registry.
    pub fn new(store: S, registry: Arc<DefinitionRegistry>) -> Self {
        Self::with_seen_capacity(store, registry, SEEN_CAPACITY)
    }

    /// Creates a correlator with an explicit fast-path capacity.
    pub fn with_seen_capacity(
        store: S,
        registry: Arc<DefinitionRegistry>,
        capacity: usize,
    ) -> Self {
        Self {
            store,
            registry,
            seen: RwLock::new(SeenSet::with_capacity(capacity)),
        }
    }

    /// Returns true if this event id already completed processing.
    pub async fn already_processed(&self, event_id: EventId) -> bool {
        self.seen.read().await.contains(&event_id)
    }

    /// Marks an event id as fully processed.
    ///
    /// Called only after the resulting state transition is persisted;
    /// an event that errored mid-way stays unmarked so the transport's
    /// redelivery retries it.
    pub async fn mark_processed(&self, event_id: EventId) {
        self.seen.write().await.insert(event_id);
    }

    /// Resolves an event to its saga instance.
    pub async fn resolve(&self, event: &EventMessage) -> Result<Resolution> {
        if let Some(instance) = self.store.load_by_correlation(&event.correlation_id).await? {
            return Ok(Resolution {
                instance,
                is_new: false,
            });
        }

        if let Some(definition) = self.registry.for_initiating_event(&event.event_type) {
            let mut instance = SagaInstance::new(
                definition.saga_type(),
                event.correlation_id.clone(),
                StateBag::new(),
            );
            // The initiating payload seeds the state bag for step 0.
            instance.merge_output(&event.event_type, event.payload.clone());
            return Ok(Resolution {
                instance,
                is_new: true,
            });
        }

        Err(SagaError::NoMatchingSaga {
            event_type: event.event_type.clone(),
            correlation_id: event.correlation_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use definition::{ActionContext, ActionError, StepAction, StepDefinition};
    use serde_json::json;
    use store::{InMemorySagaStore, SagaStatus};

    struct Noop;

    #[async_trait]
    impl StepAction for Noop {
        async fn run(&self, _ctx: ActionContext) -> std::result::Result<serde_json::Value, ActionError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn registry() -> Arc<DefinitionRegistry> {
        let definition = definition::SagaDefinition::new(
            "Demo",
            "DemoRequested",
            vec![
                StepDefinition::builder("only", Arc::new(Noop))
                    .completion_event("OnlyDone")
                    .failure_event("OnlyFailed")
                    .build(),
            ],
        );
        Arc::new(
            DefinitionRegistry::builder()
                .register(definition)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn initiating_event_materializes_unsaved_instance() {
        let store = InMemorySagaStore::new();
        let correlator = EventCorrelator::new(store.clone(), registry());

        let event = EventMessage::new("DemoRequested", "C1", json!({"applicant": "a"}));
        let resolution = correlator.resolve(&event).await.unwrap();

        assert!(resolution.is_new);
        assert_eq!(resolution.instance.saga_type, "Demo");
        assert_eq!(resolution.instance.status, SagaStatus::NotStarted);
        assert_eq!(resolution.instance.state_bag["applicant"], json!("a"));
        // Materialized, not persisted.
        assert!(store.load(resolution.instance.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn active_instance_wins_over_initiation() {
        let store = InMemorySagaStore::new();
        let correlator = EventCorrelator::new(store.clone(), registry());

        let mut existing = SagaInstance::new("Demo", "C1".into(), StateBag::new());
        existing.start();
        let expected = existing.bump();
        store.save(&existing, expected).await.unwrap();

        let event = EventMessage::new("DemoRequested", "C1", json!({}));
        let resolution = correlator.resolve(&event).await.unwrap();
        assert!(!resolution.is_new);
        assert_eq!(resolution.instance.id, existing.id);
    }

    #[tokio::test]
    async fn unknown_event_without_instance_is_rejected() {
        let correlator = EventCorrelator::new(InMemorySagaStore::new(), registry());
        let event = EventMessage::new("SomethingElse", "C1", json!({}));
        assert!(matches!(
            correlator.resolve(&event).await,
            Err(SagaError::NoMatchingSaga { .. })
        ));
    }

    #[tokio::test]
    async fn processed_marking() {
        let correlator = EventCorrelator::new(InMemorySagaStore::new(), registry());
        let id = EventId::new();
        assert!(!correlator.already_processed(id).await);
        correlator.mark_processed(id).await;
        assert!(correlator.already_processed(id).await);
    }

    #[tokio::test]
    async fn processed_record_evicts_oldest_at_capacity() {
        let correlator =
            EventCorrelator::with_seen_capacity(InMemorySagaStore::new(), registry(), 3);

        let ids: Vec<EventId> = (0..4).map(|_| EventId::new()).collect();
        for id in &ids {
            correlator.mark_processed(*id).await;
        }

        assert!(!correlator.already_processed(ids[0]).await);
        for id in &ids[1..] {
            assert!(correlator.already_processed(*id).await);
        }

        // Re-marking an id already present does not grow the record.
        correlator.mark_processed(ids[3]).await;
        assert!(correlator.already_processed(ids[1]).await);
    }
}
