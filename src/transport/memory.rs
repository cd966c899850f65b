//! In-memory transport for testing and single-process scenarios.
//!
//! Plays the role the emulator plays in a real deployment: a full
//! publisher/subscriber pair with redelivery on nack, delivery-attempt
//! counting, dead-letter routing, and ordering-key FIFO. Cloning a handle
//! shares the underlying broker state, so a publisher and subscriber built
//! from the same instance see the same topics.
//!
//! Subscription filter expressions are stored but not evaluated.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::connection::{ClientFactory, ClientSettings};

use super::{
    DeliveredMessage, PublisherClient, SubscriberClient, SubscriptionName, SubscriptionSpec,
    TopicName, TransportError, WireMessage,
};

#[derive(Clone)]
struct QueuedMessage {
    message_id: String,
    message: WireMessage,
    /// Deliveries so far; incremented as the message is pulled.
    delivery_attempt: u32,
}

struct SubscriptionState {
    spec: SubscriptionSpec,
    queue: VecDeque<QueuedMessage>,
    /// Pulled but not yet acked/nacked, keyed by message id.
    outstanding: HashMap<String, QueuedMessage>,
    /// Ordering keys with an outstanding message (ordered subscriptions).
    blocked_keys: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashSet<String>,
    subscriptions: HashMap<String, SubscriptionState>,
    next_message_id: u64,
}

impl BrokerState {
    fn assign_message_id(&mut self) -> String {
        self.next_message_id += 1;
        format!("mem-{:08x}", self.next_message_id)
    }

    /// Fan a message out to every subscription bound to the topic.
    fn publish_to_topic(&mut self, topic: &TopicName, message: WireMessage) -> String {
        let message_id = self.assign_message_id();
        let topic_name = topic.to_string();
        for state in self
            .subscriptions
            .values_mut()
            .filter(|state| state.spec.topic.to_string() == topic_name)
        {
            state.queue.push_back(QueuedMessage {
                message_id: message_id.clone(),
                message: message.clone(),
                delivery_attempt: 0,
            });
        }
        message_id
    }
}

/// In-memory pub/sub broker implementing both client traits.
#[derive(Clone)]
pub struct InMemoryPubSub {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        InMemoryPubSub::new()
    }
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        InMemoryPubSub {
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages queued (not yet pulled) on a subscription.
    pub fn pending(&self, subscription: &SubscriptionName) -> usize {
        self.lock()
            .subscriptions
            .get(&subscription.to_string())
            .map(|state| state.queue.len())
            .unwrap_or(0)
    }

    /// Messages pulled but not yet acked/nacked on a subscription.
    pub fn outstanding(&self, subscription: &SubscriptionName) -> usize {
        self.lock()
            .subscriptions
            .get(&subscription.to_string())
            .map(|state| state.outstanding.len())
            .unwrap_or(0)
    }
}

impl PublisherClient for InMemoryPubSub {
    fn get_topic(&self, topic: &TopicName) -> Result<(), TransportError> {
        if self.lock().topics.contains(&topic.to_string()) {
            Ok(())
        } else {
            Err(TransportError::NotFound(topic.to_string()))
        }
    }

    fn create_topic(&self, topic: &TopicName) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.topics.insert(topic.to_string()) {
            Ok(())
        } else {
            Err(TransportError::AlreadyExists(topic.to_string()))
        }
    }

    fn publish(&self, topic: &TopicName, message: WireMessage) -> Result<String, TransportError> {
        let mut state = self.lock();
        if !state.topics.contains(&topic.to_string()) {
            return Err(TransportError::NotFound(topic.to_string()));
        }
        Ok(state.publish_to_topic(topic, message))
    }
}

impl SubscriberClient for InMemoryPubSub {
    fn get_subscription(&self, subscription: &SubscriptionName) -> Result<(), TransportError> {
        if self
            .lock()
            .subscriptions
            .contains_key(&subscription.to_string())
        {
            Ok(())
        } else {
            Err(TransportError::NotFound(subscription.to_string()))
        }
    }

    fn create_subscription(&self, spec: &SubscriptionSpec) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.topics.contains(&spec.topic.to_string()) {
            return Err(TransportError::NotFound(spec.topic.to_string()));
        }
        let key = spec.name.to_string();
        if state.subscriptions.contains_key(&key) {
            return Err(TransportError::AlreadyExists(key));
        }
        state.subscriptions.insert(
            key,
            SubscriptionState {
                spec: spec.clone(),
                queue: VecDeque::new(),
                outstanding: HashMap::new(),
                blocked_keys: HashSet::new(),
            },
        );
        Ok(())
    }

    fn pull(
        &self,
        subscription: &SubscriptionName,
        max_messages: usize,
    ) -> Result<Vec<DeliveredMessage>, TransportError> {
        let mut state = self.lock();
        let sub = state
            .subscriptions
            .get_mut(&subscription.to_string())
            .ok_or_else(|| TransportError::NotFound(subscription.to_string()))?;

        let ordered = sub.spec.enable_message_ordering;
        let mut skipped_keys = sub.blocked_keys.clone();
        let mut delivered = Vec::new();
        let mut remaining = VecDeque::with_capacity(sub.queue.len());

        while let Some(mut queued) = sub.queue.pop_front() {
            let key = queued
                .message
                .ordering_key
                .clone()
                .filter(|key| ordered && !key.is_empty());

            let blocked = key
                .as_ref()
                .map(|key| skipped_keys.contains(key))
                .unwrap_or(false);

            if delivered.len() >= max_messages || blocked {
                // Later messages with the same key stay behind this one.
                if let Some(key) = key {
                    skipped_keys.insert(key);
                }
                remaining.push_back(queued);
                continue;
            }

            queued.delivery_attempt += 1;
            if let Some(key) = key {
                skipped_keys.insert(key.clone());
                sub.blocked_keys.insert(key);
            }
            delivered.push(DeliveredMessage {
                message_id: queued.message_id.clone(),
                data: queued.message.data.clone(),
                attributes: queued.message.attributes.clone(),
                ordering_key: queued.message.ordering_key.clone(),
                delivery_attempt: queued.delivery_attempt,
            });
            sub.outstanding.insert(queued.message_id.clone(), queued);
        }

        sub.queue = remaining;
        Ok(delivered)
    }

    fn ack(&self, subscription: &SubscriptionName, message_id: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        let sub = state
            .subscriptions
            .get_mut(&subscription.to_string())
            .ok_or_else(|| TransportError::NotFound(subscription.to_string()))?;

        if let Some(queued) = sub.outstanding.remove(message_id) {
            if let Some(key) = &queued.message.ordering_key {
                sub.blocked_keys.remove(key);
            }
        }
        Ok(())
    }

    fn nack(&self, subscription: &SubscriptionName, message_id: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        let key = subscription.to_string();
        let sub = state
            .subscriptions
            .get_mut(&key)
            .ok_or_else(|| TransportError::NotFound(key))?;

        let Some(queued) = sub.outstanding.remove(message_id) else {
            return Ok(());
        };
        if let Some(ordering_key) = &queued.message.ordering_key {
            sub.blocked_keys.remove(ordering_key);
        }

        let exhausted_policy = match sub.spec.dead_letter.clone() {
            Some(policy) if queued.delivery_attempt >= policy.max_delivery_attempts => Some(policy),
            _ => None,
        };

        match exhausted_policy {
            // Redeliver ahead of later messages to keep per-key order.
            None => sub.queue.push_front(queued),
            Some(policy) => {
                if state.topics.contains(&policy.dead_letter_topic.to_string()) {
                    state.publish_to_topic(&policy.dead_letter_topic, queued.message);
                } else {
                    warn!(
                        topic = %policy.dead_letter_topic,
                        message_id,
                        "dead-letter topic missing, dropping exhausted message"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Client factory handing out handles to one shared in-memory broker.
pub struct MemoryClientFactory {
    broker: InMemoryPubSub,
}

impl MemoryClientFactory {
    pub fn new(broker: InMemoryPubSub) -> Self {
        MemoryClientFactory { broker }
    }
}

impl ClientFactory for MemoryClientFactory {
    fn publisher(
        &self,
        _settings: &ClientSettings,
    ) -> Result<Arc<dyn PublisherClient>, TransportError> {
        Ok(Arc::new(self.broker.clone()))
    }

    fn subscriber(
        &self,
        _settings: &ClientSettings,
    ) -> Result<Arc<dyn SubscriberClient>, TransportError> {
        Ok(Arc::new(self.broker.clone()))
    }
}
