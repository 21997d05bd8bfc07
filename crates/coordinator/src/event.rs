//! Inbound event envelope.

use common::{CorrelationId, EventId};
use serde::{Deserialize, Serialize};

/// An event delivered to the coordinator, already decoded from whatever
/// transport carried it.
///
/// Delivery is assumed at-least-once and unordered; the `event_id` lets
/// re-deliveries be acknowledged without reprocessing, and the
/// `correlation_id` links the event to a saga instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique id of this delivery's logical event.
    pub event_id: EventId,
    /// Event type name, matched against the definitions' initiating,
    /// completion and failure events.
    pub event_type: String,
    /// Business key of the saga this event belongs to.
    pub correlation_id: CorrelationId,
    /// Event payload; merged into the state bag on step completion.
    pub payload: serde_json::Value,
}

impl EventMessage {
    /// Creates an event with a fresh id.
    pub fn new(
        event_type: impl Into<String>,
        correlation_id: impl Into<CorrelationId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            correlation_id: correlation_id.into(),
            payload,
        }
    }

    /// Creates an event with an explicit id, as handed over by a
    /// transport that stamps its own message ids.
    pub fn with_id(
        event_id: EventId,
        event_type: impl Into<String>,
        correlation_id: impl Into<CorrelationId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            correlation_id: correlation_id.into(),
            payload,
        }
    }
}
