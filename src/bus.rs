//! The distributed event bus.
//!
//! `PubSubEventBus` bridges the application's typed event model to a cloud
//! pub/sub transport: publish once, have every registered handler - local or
//! in another process - receive the event at least once, with the inbox
//! keeping actual processing exactly-once.
//!
//! ```text
//! publish(event) ──▶ serialize ──▶ stamp attributes ──▶ transport topic
//!                                                            │
//!                         subscription backlog ◀─────────────┘
//!                                │
//! initialize() ──▶ provision ──▶ dispatch pool ──▶ handlers ──▶ ack/nack
//! ```
//!
//! Lifecycle: `Uninitialized -> Provisioning -> Consuming -> Stopped`.
//! `initialize()` resolves the connection, provisions the topic and
//! subscription, starts the consume machinery and applies the handler
//! registrations configured on the builder. `stop()` ends intake and lets
//! in-flight dispatches finish.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use event_emitter_rs::EventEmitter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, ConnectionConfig, EventBusOptions, PubSubConfig};
use crate::connection::{ClientFactory, ConnectionError, ConnectionRegistry};
use crate::dispatch::{DispatchEngine, DispatchError, DispatchPool, DispatchStats, PoolConfig};
use crate::event::{
    BusEvent, DispatchContext, EventHandler, HandlerError, CORRELATION_ID_ATTRIBUTE,
    EVENT_NAME_ATTRIBUTE, MESSAGE_ID_ATTRIBUTE,
};
use crate::inbox::{InboxStore, IncomingEventInfo};
use crate::outbox::{
    DistributedEventSent, EventSource, OutboxBatchReport, OutboxFailure, OutgoingEventInfo,
};
use crate::registry::{HandlerRegistry, SubscriptionGuard};
use crate::serializer::{EncodeError, JsonSerializer};
use crate::topology::{Provisioner, ProvisionError};
use crate::transport::{
    DeadLetterPolicy, SubscriptionName, SubscriptionSpec, TopicName, TransportError, WireMessage,
};

/// Emitter event carrying [`DistributedEventSent`] notifications.
const SENT_EVENT: &str = "distributed_event_sent";

/// Error publishing an event to the transport.
#[derive(Debug)]
pub enum PublishError {
    /// `initialize()` has not resolved the target topic yet.
    NotInitialized,
    /// Event body serialization failed.
    Serialization(EncodeError),
    /// The connection could not supply a publisher client.
    Connection(ConnectionError),
    /// The transport rejected the message.
    Transport(TransportError),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NotInitialized => {
                write!(f, "event bus is not initialized; call initialize() first")
            }
            PublishError::Serialization(err) => err.fmt(f),
            PublishError::Connection(err) => err.fmt(f),
            PublishError::Transport(err) => write!(f, "transport rejected publish: {}", err),
        }
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PublishError::NotInitialized => None,
            PublishError::Serialization(err) => Some(err),
            PublishError::Connection(err) => Some(err),
            PublishError::Transport(err) => Some(err),
        }
    }
}

impl From<EncodeError> for PublishError {
    fn from(err: EncodeError) -> Self {
        PublishError::Serialization(err)
    }
}

impl From<ConnectionError> for PublishError {
    fn from(err: ConnectionError) -> Self {
        PublishError::Connection(err)
    }
}

impl From<TransportError> for PublishError {
    fn from(err: TransportError) -> Self {
        PublishError::Transport(err)
    }
}

/// Error bringing the bus up.
#[derive(Debug)]
pub enum InitError {
    Config(ConfigError),
    Connection(ConnectionError),
    Provision(ProvisionError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Config(err) => err.fmt(f),
            InitError::Connection(err) => err.fmt(f),
            InitError::Provision(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InitError::Config(err) => Some(err),
            InitError::Connection(err) => Some(err),
            InitError::Provision(err) => Some(err),
        }
    }
}

impl From<ConfigError> for InitError {
    fn from(err: ConfigError) -> Self {
        InitError::Config(err)
    }
}

impl From<ConnectionError> for InitError {
    fn from(err: ConnectionError) -> Self {
        InitError::Connection(err)
    }
}

impl From<ProvisionError> for InitError {
    fn from(err: ProvisionError) -> Self {
        InitError::Provision(err)
    }
}

/// Bus lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Provisioning,
    Consuming,
    Stopped,
}

/// Per-call publish options.
///
/// Attribute layering: configured default attributes first, overridden by
/// `attributes` here; the reserved `EventName`, `MessageId` and correlation
/// attributes are stamped last and cannot be overridden by either layer.
#[derive(Debug, Default)]
pub struct PublishOptions {
    /// Caller-supplied attributes.
    pub attributes: HashMap<String, String>,
    /// Message id to stamp instead of generating one; outbox replays use
    /// this to preserve identity for downstream dedup.
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Ordering key; meaningful when the subscription has ordering enabled.
    pub ordering_key: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        PublishOptions::default()
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }
}

type DeferredRegistration = Box<dyn FnOnce(&HandlerRegistry) -> SubscriptionGuard + Send>;

struct Lifecycle {
    state: LifecycleState,
    pool: Option<DispatchPool>,
    pending: Vec<DeferredRegistration>,
}

/// Builder for [`PubSubEventBus`].
pub struct EventBusBuilder {
    options: EventBusOptions,
    connections: PubSubConfig,
    factory: Option<Arc<dyn ClientFactory>>,
    inbox: Option<Arc<dyn InboxStore>>,
    pending: Vec<DeferredRegistration>,
}

impl EventBusBuilder {
    pub fn new(options: EventBusOptions) -> Self {
        EventBusBuilder {
            options,
            connections: PubSubConfig::default(),
            factory: None,
            inbox: None,
            pending: Vec::new(),
        }
    }

    /// Named connection table the bus resolves against.
    pub fn connections(mut self, connections: PubSubConfig) -> Self {
        self.connections = connections;
        self
    }

    /// Factory building the transport clients.
    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Enable inbox dedup backed by the given store.
    pub fn inbox(mut self, inbox: Arc<dyn InboxStore>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Register a handler when `initialize()` brings the bus up.
    pub fn handler<E, H>(mut self, handler: Arc<H>) -> Self
    where
        E: BusEvent,
        H: EventHandler<E> + 'static,
    {
        self.pending
            .push(Box::new(move |registry| registry.subscribe::<E, H>(handler)));
        self
    }

    pub fn build(self) -> Result<PubSubEventBus, ConfigError> {
        if self.options.topic_id.is_empty() {
            return Err(ConfigError::MissingOption("topic_id"));
        }
        if self.options.subscription_id.is_empty() {
            return Err(ConfigError::MissingOption("subscription_id"));
        }
        let factory = self
            .factory
            .ok_or(ConfigError::MissingOption("client_factory"))?;

        let registry = HandlerRegistry::new();
        let engine = Arc::new(DispatchEngine::new(registry.clone(), self.inbox.clone()));

        Ok(PubSubEventBus {
            options: self.options,
            connections: Arc::new(ConnectionRegistry::new(self.connections, factory)),
            registry,
            engine,
            emitter: Mutex::new(EventEmitter::new()),
            topic: RwLock::new(None),
            subscription: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Uninitialized,
                pool: None,
                pending: self.pending,
            }),
        })
    }
}

/// Distributed event bus over a cloud pub/sub transport.
pub struct PubSubEventBus {
    options: EventBusOptions,
    connections: Arc<ConnectionRegistry>,
    registry: HandlerRegistry,
    engine: Arc<DispatchEngine>,
    emitter: Mutex<EventEmitter>,
    topic: RwLock<Option<TopicName>>,
    subscription: RwLock<Option<SubscriptionName>>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for PubSubEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubEventBus")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PubSubEventBus {
    pub fn builder(options: EventBusOptions) -> EventBusBuilder {
        EventBusBuilder::new(options)
    }

    pub fn options(&self) -> &EventBusOptions {
        &self.options
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Register a handler instance for events of type `E`.
    pub fn subscribe<E, H>(&self, handler: Arc<H>) -> SubscriptionGuard
    where
        E: BusEvent,
        H: EventHandler<E> + 'static,
    {
        self.registry.subscribe::<E, H>(handler)
    }

    /// Register a closure for events of type `E`.
    pub fn subscribe_fn<E, F>(&self, callback: F) -> SubscriptionGuard
    where
        E: BusEvent,
        F: Fn(&E, &DispatchContext) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.registry.subscribe_fn(callback)
    }

    pub fn unsubscribe<E, H>(&self, handler: &Arc<H>)
    where
        E: BusEvent,
        H: EventHandler<E> + 'static,
    {
        self.registry.unsubscribe::<E, H>(handler)
    }

    pub fn unsubscribe_all<E: BusEvent>(&self) {
        self.registry.unsubscribe_all::<E>()
    }

    /// Register a callback for [`DistributedEventSent`] notifications.
    pub fn on_event_sent<F>(&self, callback: F)
    where
        F: Fn(DistributedEventSent) + Send + Sync + 'static,
    {
        if let Ok(mut emitter) = self.emitter.lock() {
            emitter.on(SENT_EVENT, move |sent: DistributedEventSent| callback(sent));
        }
    }

    /// Bring the bus to the Consuming state. Idempotent: re-entry while past
    /// Uninitialized is a no-op.
    pub fn initialize(&self) -> Result<(), InitError> {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if lifecycle.state != LifecycleState::Uninitialized {
            return Ok(());
        }

        lifecycle.state = LifecycleState::Provisioning;
        match self.bring_up(&mut lifecycle) {
            Ok(()) => {
                lifecycle.state = LifecycleState::Consuming;
                Ok(())
            }
            Err(err) => {
                lifecycle.state = LifecycleState::Uninitialized;
                Err(err)
            }
        }
    }

    fn bring_up(&self, lifecycle: &mut Lifecycle) -> Result<(), InitError> {
        let connection_name = self.options.connection_name.as_deref();
        let connection = self.connections.resolve(connection_name)?.clone();

        let topic = TopicName::new(&connection.project_id, &self.options.topic_id);
        let subscription =
            SubscriptionName::new(&connection.project_id, &self.options.subscription_id);

        let publisher = self.connections.publisher(connection_name)?;
        Provisioner::ensure_topic(publisher.as_ref(), &topic, self.options.auto_create_topic)?;

        let subscriber = self.connections.subscriber(connection_name)?;
        let spec = self.subscription_spec(&connection, topic.clone(), subscription.clone());
        Provisioner::ensure_subscription(
            subscriber.as_ref(),
            &spec,
            self.options.auto_create_subscription,
        )?;

        *self.topic.write().unwrap_or_else(PoisonError::into_inner) = Some(topic.clone());
        *self
            .subscription
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription.clone());

        lifecycle.pool = Some(DispatchPool::start(
            subscriber,
            self.engine.clone(),
            PoolConfig {
                subscription: subscription.clone(),
                max_messages: self.options.max_messages,
                workers: self.options.max_concurrent_handlers,
                ordered: self.options.enable_message_ordering,
            },
        ));

        // Statically configured handlers come up once consuming has started.
        for register in lifecycle.pending.drain(..) {
            register(&self.registry);
        }

        info!(topic = %topic, subscription = %subscription, "event bus initialized");
        Ok(())
    }

    fn subscription_spec(
        &self,
        connection: &ConnectionConfig,
        topic: TopicName,
        name: SubscriptionName,
    ) -> SubscriptionSpec {
        let dead_letter = self
            .options
            .dead_letter_topic_id
            .as_ref()
            .map(|topic_id| DeadLetterPolicy {
                dead_letter_topic: TopicName::new(&connection.project_id, topic_id),
                max_delivery_attempts: self.options.max_delivery_attempts,
            });

        SubscriptionSpec {
            name,
            topic,
            ack_deadline_seconds: self.options.ack_deadline_seconds,
            enable_message_ordering: self.options.enable_message_ordering,
            retention: Duration::from_secs(
                u64::from(self.options.message_retention_days) * 24 * 60 * 60,
            ),
            filter: self.options.subscription_filter.clone(),
            dead_letter,
        }
    }

    /// Stop consuming. Intake ends immediately; in-flight dispatches finish.
    /// Safe to call repeatedly. Publishing remains possible after stopping.
    pub fn stop(&self) -> DispatchStats {
        let pool = {
            let mut lifecycle = self
                .lifecycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if lifecycle.state == LifecycleState::Consuming {
                lifecycle.state = LifecycleState::Stopped;
            }
            lifecycle.pool.take()
        };

        match pool {
            Some(pool) => {
                pool.signal_stop();
                let stats = pool.stop();
                info!(
                    acked = stats.acked,
                    nacked = stats.nacked,
                    "event bus stopped"
                );
                stats
            }
            None => DispatchStats::default(),
        }
    }

    /// Serialize and publish a typed event. Returns the transport-assigned
    /// message id.
    pub fn publish<E: BusEvent>(&self, event: &E) -> Result<String, PublishError> {
        self.publish_with(event, PublishOptions::default())
    }

    /// Publish a typed event with explicit options.
    pub fn publish_with<E: BusEvent>(
        &self,
        event: &E,
        options: PublishOptions,
    ) -> Result<String, PublishError> {
        // Publishing a type records its name, so locally published events
        // are decodable when they come back around.
        self.registry.ensure_entry::<E>();
        let body = JsonSerializer::serialize(event)?;
        self.publish_raw(E::event_name(), body, options)
    }

    /// Publish a pre-serialized body under a logical event name.
    pub fn publish_raw(
        &self,
        event_name: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<String, PublishError> {
        let topic = self
            .topic
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PublishError::NotInitialized)?;
        let publisher = self
            .connections
            .publisher(self.options.connection_name.as_deref())?;

        let message_id = options
            .message_id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        // Defaults first, caller attributes on top, reserved keys last so
        // neither layer can override them.
        let mut attributes = self.options.default_attributes.clone();
        attributes.extend(options.attributes);
        attributes.insert(EVENT_NAME_ATTRIBUTE.to_string(), event_name.to_string());
        attributes.insert(MESSAGE_ID_ATTRIBUTE.to_string(), message_id.clone());
        if let Some(correlation_id) = &options.correlation_id {
            attributes.insert(
                CORRELATION_ID_ATTRIBUTE.to_string(),
                correlation_id.clone(),
            );
        }

        let transport_id = publisher.publish(
            &topic,
            WireMessage {
                data: body,
                attributes,
                ordering_key: options.ordering_key,
            },
        )?;

        debug!(
            event = event_name,
            message_id = %message_id,
            transport_id = %transport_id,
            "published event"
        );
        Ok(transport_id)
    }

    /// Publish a replayed outbox record, preserving its id for downstream
    /// dedup, and raise a [`DistributedEventSent`] notification.
    pub fn publish_from_outbox(&self, outgoing: &OutgoingEventInfo) -> Result<(), PublishError> {
        let mut options = PublishOptions::new().with_message_id(&*outgoing.id);
        if let Some(correlation_id) = &outgoing.correlation_id {
            options = options.with_correlation_id(correlation_id);
        }
        self.publish_raw(&outgoing.event_name, outgoing.body.clone(), options)?;
        self.notify_sent(EventSource::Outbox, &outgoing.event_name, &outgoing.id);
        Ok(())
    }

    /// Replay a batch of outbox records in order. Every record is attempted;
    /// failures are reported per record and never stop the rest of the
    /// batch.
    pub fn publish_many_from_outbox(&self, outgoing: &[OutgoingEventInfo]) -> OutboxBatchReport {
        let mut report = OutboxBatchReport::default();
        for record in outgoing {
            match self.publish_from_outbox(record) {
                Ok(()) => report.published += 1,
                Err(error) => {
                    warn!(
                        event = %record.event_name,
                        outbox_id = %record.id,
                        error = %error,
                        "outbox replay failed for record"
                    );
                    report.failures.push(OutboxFailure {
                        id: record.id.clone(),
                        event_name: record.event_name.clone(),
                        error,
                    });
                }
            }
        }
        report
    }

    /// Process an event captured durably by an external inbox store. Handler
    /// failures propagate to the caller (the inbox drain worker owns the
    /// retry policy).
    pub fn process_from_inbox(&self, incoming: &IncomingEventInfo) -> Result<(), DispatchError> {
        let Some(entry) = self.registry.entry_for_name(&incoming.event_name) else {
            debug!(
                event = %incoming.event_name,
                "no event type registered, skipping inbox event"
            );
            return Ok(());
        };

        let event = match (entry.decode)(&incoming.body) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    event = %incoming.event_name,
                    message_id = %incoming.message_id,
                    error = %err,
                    "dropping undecodable inbox event"
                );
                return Ok(());
            }
        };

        let ctx = DispatchContext {
            message_id: incoming.message_id.clone(),
            event_name: incoming.event_name.clone(),
            correlation_id: incoming.correlation_id.clone(),
        };
        self.engine.dispatch_tree(&entry, event.as_ref(), &ctx)
    }

    fn notify_sent(&self, source: EventSource, event_name: &str, message_id: &str) {
        if let Ok(mut emitter) = self.emitter.lock() {
            emitter.emit(
                SENT_EVENT,
                DistributedEventSent {
                    source,
                    event_name: event_name.to_string(),
                    message_id: message_id.to_string(),
                    sent_at: Utc::now(),
                },
            );
        }
    }
}

impl Drop for PubSubEventBus {
    fn drop(&mut self) {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = lifecycle.pool.take() {
            pool.signal_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        DeliveredMessage, InMemoryPubSub, MemoryClientFactory, PublisherClient, SubscriberClient,
    };
    use crate::config::ConnectionConfig;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize)]
    struct InvoicePaid {
        invoice_id: String,
    }

    impl BusEvent for InvoicePaid {
        fn event_name() -> &'static str {
            "InvoicePaid"
        }
    }

    fn bus_with_broker(options: EventBusOptions) -> (PubSubEventBus, InMemoryPubSub) {
        let broker = InMemoryPubSub::new();
        let bus = PubSubEventBus::builder(options)
            .connections(PubSubConfig::new().with_default(ConnectionConfig::new("proj")))
            .client_factory(Arc::new(MemoryClientFactory::new(broker.clone())))
            .build()
            .unwrap();
        (bus, broker)
    }

    fn tap_subscription(broker: &InMemoryPubSub, topic: &str, name: &str) -> SubscriptionName {
        let spec = SubscriptionSpec {
            name: SubscriptionName::new("proj", name),
            topic: TopicName::new("proj", topic),
            ack_deadline_seconds: 60,
            enable_message_ordering: false,
            retention: Duration::from_secs(60),
            filter: None,
            dead_letter: None,
        };
        broker.create_subscription(&spec).unwrap();
        spec.name
    }

    #[test]
    fn builder_requires_topic_subscription_and_factory() {
        let err = PubSubEventBus::builder(EventBusOptions::default())
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingOption("topic_id"));

        let err = PubSubEventBus::builder(EventBusOptions::new("orders", ""))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingOption("subscription_id"));

        let err = PubSubEventBus::builder(EventBusOptions::new("orders", "orders-sub"))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingOption("client_factory"));
    }

    #[test]
    fn publish_before_initialize_is_rejected() {
        let (bus, _broker) = bus_with_broker(EventBusOptions::new("orders", "orders-sub"));
        let err = bus
            .publish(&InvoicePaid {
                invoice_id: "inv-1".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, PublishError::NotInitialized));
    }

    #[test]
    fn initialize_with_unknown_connection_fails() {
        let broker = InMemoryPubSub::new();
        let bus = PubSubEventBus::builder(
            EventBusOptions::new("orders", "orders-sub").with_connection_name("Missing"),
        )
        .connections(PubSubConfig::new().with_default(ConnectionConfig::new("proj")))
        .client_factory(Arc::new(MemoryClientFactory::new(broker)))
        .build()
        .unwrap();

        assert!(matches!(bus.initialize(), Err(InitError::Config(_))));
        assert_eq!(bus.state(), LifecycleState::Uninitialized);
        bus.stop();
    }

    #[test]
    fn initialize_is_idempotent_and_provisions_topology() {
        let (bus, broker) = bus_with_broker(EventBusOptions::new("orders", "orders-sub"));
        bus.initialize().unwrap();
        bus.initialize().unwrap();
        assert_eq!(bus.state(), LifecycleState::Consuming);

        broker.get_topic(&TopicName::new("proj", "orders")).unwrap();
        broker
            .get_subscription(&SubscriptionName::new("proj", "orders-sub"))
            .unwrap();
        bus.stop();
        assert_eq!(bus.state(), LifecycleState::Stopped);
    }

    #[test]
    fn published_messages_carry_the_wire_attribute_contract() {
        let (bus, broker) = bus_with_broker(
            EventBusOptions::new("orders", "orders-sub")
                .with_default_attribute("service", "billing")
                .with_default_attribute("EventName", "Spoofed")
                .with_max_concurrent_handlers(1),
        );
        bus.initialize().unwrap();
        let tap = tap_subscription(&broker, "orders", "tap");

        bus.publish_with(
            &InvoicePaid {
                invoice_id: "inv-1".to_string(),
            },
            PublishOptions::new()
                .with_attribute("tenant", "acme")
                .with_attribute("service", "checkout")
                .with_correlation_id("corr-1"),
        )
        .unwrap();

        let batch = broker.pull(&tap, 1).unwrap();
        let message: &DeliveredMessage = &batch[0];

        // Reserved keys win over both default and caller attributes.
        assert_eq!(message.attribute("EventName"), Some("InvoicePaid"));
        let stamped_id = message.attribute("MessageId").unwrap();
        assert_eq!(stamped_id.len(), 32, "generated ids are 32-char hex");
        assert_eq!(message.attribute("X-Correlation-Id"), Some("corr-1"));

        // Caller attributes override defaults.
        assert_eq!(message.attribute("service"), Some("checkout"));
        assert_eq!(message.attribute("tenant"), Some("acme"));
        bus.stop();
    }

    #[test]
    fn outbox_replay_preserves_the_record_id_and_notifies() {
        let (bus, broker) = bus_with_broker(EventBusOptions::new("orders", "orders-sub"));
        bus.initialize().unwrap();
        let tap = tap_subscription(&broker, "orders", "tap");

        let sent: Arc<Mutex<Vec<DistributedEventSent>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let sent = sent.clone();
            bus.on_event_sent(move |notification| sent.lock().unwrap().push(notification));
        }

        let record = OutgoingEventInfo::encode(
            "0f1e2d3c4b5a00000000000000000001",
            &InvoicePaid {
                invoice_id: "inv-9".to_string(),
            },
        )
        .unwrap()
        .with_correlation_id("corr-9");

        bus.publish_from_outbox(&record).unwrap();

        let batch = broker.pull(&tap, 1).unwrap();
        assert_eq!(
            batch[0].attribute("MessageId"),
            Some("0f1e2d3c4b5a00000000000000000001")
        );
        assert_eq!(batch[0].attribute("X-Correlation-Id"), Some("corr-9"));

        // Emitter callbacks run on their own threads.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sent.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source, EventSource::Outbox);
        assert_eq!(sent[0].event_name, "InvoicePaid");
        bus.stop();
    }

    /// Publisher that rejects messages for one event name; everything else
    /// passes through to the in-memory broker.
    struct SelectiveFailFactory {
        inner: MemoryClientFactory,
        poison_event: &'static str,
    }

    struct SelectiveFailPublisher {
        inner: Arc<dyn PublisherClient>,
        poison_event: &'static str,
    }

    impl PublisherClient for SelectiveFailPublisher {
        fn get_topic(&self, topic: &TopicName) -> Result<(), TransportError> {
            self.inner.get_topic(topic)
        }

        fn create_topic(&self, topic: &TopicName) -> Result<(), TransportError> {
            self.inner.create_topic(topic)
        }

        fn publish(
            &self,
            topic: &TopicName,
            message: WireMessage,
        ) -> Result<String, TransportError> {
            if message.attributes.get("EventName").map(String::as_str) == Some(self.poison_event) {
                return Err(TransportError::Rejected("simulated outage".to_string()));
            }
            self.inner.publish(topic, message)
        }
    }

    impl ClientFactory for SelectiveFailFactory {
        fn publisher(
            &self,
            settings: &crate::connection::ClientSettings,
        ) -> Result<Arc<dyn PublisherClient>, TransportError> {
            Ok(Arc::new(SelectiveFailPublisher {
                inner: self.inner.publisher(settings)?,
                poison_event: self.poison_event,
            }))
        }

        fn subscriber(
            &self,
            settings: &crate::connection::ClientSettings,
        ) -> Result<Arc<dyn SubscriberClient>, TransportError> {
            self.inner.subscriber(settings)
        }
    }

    #[test]
    fn batch_replay_reports_failures_individually() {
        let broker = InMemoryPubSub::new();
        let bus = PubSubEventBus::builder(EventBusOptions::new("orders", "orders-sub"))
            .connections(PubSubConfig::new().with_default(ConnectionConfig::new("proj")))
            .client_factory(Arc::new(SelectiveFailFactory {
                inner: MemoryClientFactory::new(broker.clone()),
                poison_event: "FailsToSend",
            }))
            .build()
            .unwrap();
        bus.initialize().unwrap();

        let records = vec![
            OutgoingEventInfo::new("id-1", "InvoicePaid", b"{}".to_vec()),
            OutgoingEventInfo::new("id-2", "FailsToSend", b"{}".to_vec()),
            OutgoingEventInfo::new("id-3", "InvoicePaid", b"{}".to_vec()),
        ];
        let report = bus.publish_many_from_outbox(&records);

        // The failing record does not stop the one behind it.
        assert_eq!(report.published, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, "id-2");
        assert!(!report.is_complete());
        bus.stop();
    }

    #[test]
    fn process_from_inbox_dispatches_to_handlers() {
        let (bus, _broker) = bus_with_broker(EventBusOptions::new("orders", "orders-sub"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            bus.subscribe_fn(move |event: &InvoicePaid, ctx: &DispatchContext| {
                seen.lock()
                    .unwrap()
                    .push((event.invoice_id.clone(), ctx.correlation_id.clone()));
                Ok(())
            });
        }

        let incoming = IncomingEventInfo::new(
            "m-7",
            "InvoicePaid",
            br#"{"invoice_id":"inv-3"}"#.to_vec(),
        )
        .with_correlation_id("corr-3");
        bus.process_from_inbox(&incoming).unwrap();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [("inv-3".to_string(), Some("corr-3".to_string()))]
        );
    }

    #[test]
    fn process_from_inbox_skips_unknown_and_malformed_events() {
        let (bus, _broker) = bus_with_broker(EventBusOptions::new("orders", "orders-sub"));

        bus.process_from_inbox(&IncomingEventInfo::new("m-1", "Unknown", b"{}".to_vec()))
            .unwrap();

        bus.registry().ensure_entry::<InvoicePaid>();
        bus.process_from_inbox(&IncomingEventInfo::new(
            "m-2",
            "InvoicePaid",
            b"not json".to_vec(),
        ))
        .unwrap();
    }

    struct NullHandler;

    impl EventHandler<InvoicePaid> for NullHandler {
        fn handle(&self, _event: &InvoicePaid, _ctx: &DispatchContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn builder_handlers_come_up_with_initialize() {
        let broker = InMemoryPubSub::new();
        let handler = Arc::new(NullHandler);
        let bus = PubSubEventBus::builder(EventBusOptions::new("orders", "orders-sub"))
            .connections(PubSubConfig::new().with_default(ConnectionConfig::new("proj")))
            .client_factory(Arc::new(MemoryClientFactory::new(broker)))
            .handler::<InvoicePaid, _>(handler)
            .build()
            .unwrap();

        // Configured handlers only come up once the bus is consuming.
        assert_eq!(bus.registry().handler_count::<InvoicePaid>(), 0);
        bus.initialize().unwrap();
        assert_eq!(bus.registry().handler_count::<InvoicePaid>(), 1);
        bus.stop();
    }

    #[test]
    fn stop_is_safe_to_call_repeatedly() {
        let (bus, _broker) = bus_with_broker(EventBusOptions::new("orders", "orders-sub"));
        bus.initialize().unwrap();
        bus.stop();
        let stats = bus.stop();
        assert_eq!(stats, DispatchStats::default());
    }
}
