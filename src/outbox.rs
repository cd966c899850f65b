//! Outbox replay records and publish reporting.
//!
//! The outbox store itself is an external collaborator: events are written
//! durably in the same transaction as the business state change that
//! produced them, and a drain worker replays them through
//! [`PubSubEventBus::publish_from_outbox`](crate::PubSubEventBus::publish_from_outbox).
//! Replayed events keep their original id so downstream consumers can
//! deduplicate a replay of an already-published event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::PublishError;
use crate::event::BusEvent;
use crate::serializer::{EncodeError, JsonSerializer};

/// A durably queued outgoing event awaiting publish.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingEventInfo {
    /// Message id preserved across replays, used for downstream dedup.
    pub id: String,
    /// Logical event name.
    pub event_name: String,
    /// Serialized event body.
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
}

impl OutgoingEventInfo {
    pub fn new(id: impl Into<String>, event_name: impl Into<String>, body: Vec<u8>) -> Self {
        OutgoingEventInfo {
            id: id.into(),
            event_name: event_name.into(),
            body,
            correlation_id: None,
        }
    }

    /// Build a record from a typed event.
    pub fn encode<E: BusEvent>(id: impl Into<String>, event: &E) -> Result<Self, EncodeError> {
        Ok(OutgoingEventInfo::new(
            id,
            E::event_name(),
            JsonSerializer::serialize(event)?,
        ))
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Where a published event originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Direct,
    Outbox,
}

/// Local notification raised after an outbox-sourced publish is accepted by
/// the transport. Delivered through the bus's event emitter for in-process
/// tracing and metrics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistributedEventSent {
    pub source: EventSource,
    pub event_name: String,
    pub message_id: String,
    pub sent_at: DateTime<Utc>,
}

/// One record that failed during a batch replay.
#[derive(Debug)]
pub struct OutboxFailure {
    pub id: String,
    pub event_name: String,
    pub error: PublishError,
}

/// Outcome of a batch outbox replay. Every record is attempted; a failure
/// never stops the rest of the batch, it is reported here for the outbox
/// subsystem's retry policy.
#[derive(Debug, Default)]
pub struct OutboxBatchReport {
    pub published: usize,
    pub failures: Vec<OutboxFailure>,
}

impl OutboxBatchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}
