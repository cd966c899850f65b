//! Transport contract - the opaque publisher/subscriber service.
//!
//! The bus never talks wire protocol itself; it drives two narrow client
//! traits that a transport integration implements:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     PubSubEventBus                          │
//! │   publish pipeline              dispatch pipeline           │
//! └─────────────────────────────────────────────────────────────┘
//!            │                              │
//!            ▼                              ▼
//! ┌─────────────────────┐      ┌─────────────────────────────┐
//! │   PublisherClient   │      │      SubscriberClient       │
//! │ get/create topic    │      │ get/create subscription     │
//! │ publish(topic, msg) │      │ pull / ack / nack           │
//! └─────────────────────┘      └─────────────────────────────┘
//!          │                              │
//!          ▼                              ▼
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────────────┐
//! │InMemoryPubSub│  │ gRPC client  │   │  emulator endpoint   │
//! │ (included)   │  │ (external)   │   │     (external)       │
//! └─────────────┘   └──────────────┘   └──────────────────────┘
//! ```
//!
//! The transport is assumed to provide at-least-once delivery with a
//! per-subscription backlog; redeliveries of one message reuse its
//! `message_id`, which is what the inbox keys on.

mod memory;

pub use memory::{InMemoryPubSub, MemoryClientFactory};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Fully-qualified topic resource name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopicName {
    project_id: String,
    topic_id: String,
}

impl TopicName {
    pub fn new(project_id: impl Into<String>, topic_id: impl Into<String>) -> Self {
        TopicName {
            project_id: project_id.into(),
            topic_id: topic_id.into(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/topics/{}", self.project_id, self.topic_id)
    }
}

/// Fully-qualified subscription resource name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionName {
    project_id: String,
    subscription_id: String,
}

impl SubscriptionName {
    pub fn new(project_id: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        SubscriptionName {
            project_id: project_id.into(),
            subscription_id: subscription_id.into(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }
}

impl fmt::Display for SubscriptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/subscriptions/{}",
            self.project_id, self.subscription_id
        )
    }
}

/// A message handed to the transport for publication.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WireMessage {
    /// Serialized event body.
    pub data: Vec<u8>,
    /// String attributes carried alongside the body.
    pub attributes: HashMap<String, String>,
    /// Ordering key; only honored by subscriptions created with ordering
    /// enabled.
    pub ordering_key: Option<String>,
}

/// A message delivered by the transport.
///
/// Redeliveries produce a fresh instance carrying the same `message_id` with
/// an incremented `delivery_attempt`.
#[derive(Clone, Debug)]
pub struct DeliveredMessage {
    /// Transport-assigned message id, stable across redeliveries.
    pub message_id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub ordering_key: Option<String>,
    /// 1-based count of deliveries of this message, this one included.
    pub delivery_attempt: u32,
}

impl DeliveredMessage {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Where the transport routes a message once it exhausts its delivery
/// attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    pub dead_letter_topic: TopicName,
    pub max_delivery_attempts: u32,
}

/// Everything needed to create a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionSpec {
    pub name: SubscriptionName,
    pub topic: TopicName,
    pub ack_deadline_seconds: u32,
    pub enable_message_ordering: bool,
    pub retention: Duration,
    pub filter: Option<String>,
    pub dead_letter: Option<DeadLetterPolicy>,
}

/// Errors surfaced by transport clients, mirroring RPC status codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The named resource does not exist.
    NotFound(String),
    /// The named resource already exists (creation race).
    AlreadyExists(String),
    /// The transport endpoint could not be reached.
    Unavailable(String),
    /// The transport refused the request.
    Rejected(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotFound(resource) => write!(f, "not found: {}", resource),
            TransportError::AlreadyExists(resource) => write!(f, "already exists: {}", resource),
            TransportError::Unavailable(detail) => write!(f, "transport unavailable: {}", detail),
            TransportError::Rejected(detail) => write!(f, "request rejected: {}", detail),
        }
    }
}

impl std::error::Error for TransportError {}

/// Publishing side of the transport.
pub trait PublisherClient: Send + Sync {
    /// Existence check; `NotFound` when the topic is missing.
    fn get_topic(&self, topic: &TopicName) -> Result<(), TransportError>;

    fn create_topic(&self, topic: &TopicName) -> Result<(), TransportError>;

    /// Publish one message; returns the transport-assigned message id.
    fn publish(&self, topic: &TopicName, message: WireMessage) -> Result<String, TransportError>;
}

/// Consuming side of the transport.
pub trait SubscriberClient: Send + Sync {
    /// Existence check; `NotFound` when the subscription is missing.
    fn get_subscription(&self, subscription: &SubscriptionName) -> Result<(), TransportError>;

    fn create_subscription(&self, spec: &SubscriptionSpec) -> Result<(), TransportError>;

    /// Pull up to `max_messages` deliverable messages. Non-blocking; an empty
    /// batch means nothing is currently deliverable.
    fn pull(
        &self,
        subscription: &SubscriptionName,
        max_messages: usize,
    ) -> Result<Vec<DeliveredMessage>, TransportError>;

    /// Confirm a delivered message as processed.
    fn ack(&self, subscription: &SubscriptionName, message_id: &str) -> Result<(), TransportError>;

    /// Reject a delivered message; the transport redelivers it, or routes it
    /// to the dead-letter topic once attempts are exhausted.
    fn nack(&self, subscription: &SubscriptionName, message_id: &str) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_name_formatting() {
        let topic = TopicName::new("acme-prod", "orders");
        assert_eq!(topic.to_string(), "projects/acme-prod/topics/orders");

        let subscription = SubscriptionName::new("acme-prod", "orders-sub");
        assert_eq!(
            subscription.to_string(),
            "projects/acme-prod/subscriptions/orders-sub"
        );
    }

    #[test]
    fn delivered_message_attribute_lookup() {
        let mut attributes = HashMap::new();
        attributes.insert("EventName".to_string(), "OrderCreated".to_string());
        let message = DeliveredMessage {
            message_id: "m-1".to_string(),
            data: Vec::new(),
            attributes,
            ordering_key: None,
            delivery_attempt: 1,
        };

        assert_eq!(message.attribute("EventName"), Some("OrderCreated"));
        assert_eq!(message.attribute("Missing"), None);
    }
}
