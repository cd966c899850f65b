//! Subscribe/dispatch pipeline.
//!
//! One intake thread pulls batches from the transport subscriber and hands
//! each message to a bounded pool of dispatch workers over rendezvous
//! channels:
//!
//! ```text
//! transport ──pull──▶ intake ──route──▶ worker 0 ──▶ ack / nack
//!                        │                worker 1 ──▶ ack / nack
//!                        └───────────────▶  ...
//! ```
//!
//! The handoff channels are unbuffered, so a fully busy pool blocks the
//! intake thread, which stops pulling - that is the flow-control bound on
//! outstanding deliveries. With ordering enabled, messages are routed to
//! workers by ordering-key hash so same-key messages run to completion in
//! order; everything else round-robins.
//!
//! Each worker runs the per-message state machine, terminal states Ack and
//! Nack:
//!
//! 1. missing `EventName` attribute  -> ack (not retryable)
//! 2. unknown logical name           -> ack (no interested party can exist)
//! 3. body decode failure            -> ack (poison message, never retries)
//! 4. inbox already has the id       -> ack (duplicate delivery)
//! 5. handlers run; any failure      -> nack (transport redelivers)
//!    all succeed                    -> inbox record written, ack
//! 6. anything unexpected            -> nack (favor redelivery over loss)

use std::any::{Any, TypeId};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::event::{DispatchContext, HandlerError, CORRELATION_ID_ATTRIBUTE, EVENT_NAME_ATTRIBUTE};
use crate::inbox::InboxStore;
use crate::registry::{HandlerRegistry, TypeEntry};
use crate::transport::{DeliveredMessage, SubscriberClient, SubscriptionName};

/// Sleep between empty pulls.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Terminal outcome for one delivered message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    Ack,
    Nack,
}

/// One handler's failure while dispatching a message.
#[derive(Debug)]
pub struct HandlerFailure {
    /// Wire name of the registered type whose handler failed.
    pub registered_as: &'static str,
    pub error: HandlerError,
}

/// All handler failures collected for one message.
#[derive(Debug)]
pub struct DispatchError {
    pub failures: Vec<HandlerFailure>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} handler(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; [{}] {}", failure.registered_as, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for DispatchError {}

/// Statistics from a dispatch pool run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub polls: usize,
    pub received: usize,
    pub acked: usize,
    pub nacked: usize,
}

/// Runs the per-message state machine. Shared by the worker pool and the
/// inbox processing entry point.
pub(crate) struct DispatchEngine {
    registry: HandlerRegistry,
    inbox: Option<Arc<dyn InboxStore>>,
}

impl DispatchEngine {
    pub(crate) fn new(registry: HandlerRegistry, inbox: Option<Arc<dyn InboxStore>>) -> Self {
        DispatchEngine { registry, inbox }
    }

    /// Decide Ack or Nack for one delivery.
    pub(crate) fn process(&self, message: &DeliveredMessage) -> Reply {
        let Some(event_name) = message.attribute(EVENT_NAME_ATTRIBUTE) else {
            warn!(
                message_id = %message.message_id,
                "message without EventName attribute, acking"
            );
            return Reply::Ack;
        };

        let Some(entry) = self.registry.entry_for_name(event_name) else {
            debug!(event = event_name, "no event type registered, acking");
            return Reply::Ack;
        };

        let event = match (entry.decode)(&message.data) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    event = event_name,
                    message_id = %message.message_id,
                    error = %err,
                    "undecodable body, acking poison message"
                );
                return Reply::Ack;
            }
        };

        if let Some(inbox) = &self.inbox {
            match inbox.contains(&message.message_id) {
                Ok(true) => {
                    debug!(
                        event = event_name,
                        message_id = %message.message_id,
                        "duplicate delivery of a processed message, acking"
                    );
                    return Reply::Ack;
                }
                Ok(false) => {}
                Err(err) => {
                    error!(
                        message_id = %message.message_id,
                        error = %err,
                        "inbox probe failed, nacking for redelivery"
                    );
                    return Reply::Nack;
                }
            }
        }

        let ctx = DispatchContext {
            message_id: message.message_id.clone(),
            event_name: event_name.to_string(),
            correlation_id: message
                .attribute(CORRELATION_ID_ATTRIBUTE)
                .map(str::to_string),
        };

        match self.dispatch_tree(&entry, event.as_ref(), &ctx) {
            Ok(()) => {
                if let Some(inbox) = &self.inbox {
                    // false = a concurrent delivery recorded it first, which
                    // is the same outcome.
                    if let Err(err) = inbox.try_add(&message.message_id) {
                        error!(
                            message_id = %message.message_id,
                            error = %err,
                            "failed to record inbox entry, nacking"
                        );
                        return Reply::Nack;
                    }
                }
                Reply::Ack
            }
            Err(err) => {
                warn!(
                    event = event_name,
                    message_id = %message.message_id,
                    error = %err,
                    "handler failures, nacking for redelivery"
                );
                Reply::Nack
            }
        }
    }

    /// Invoke every handler registered for the entry's type and its declared
    /// parents, sequentially in registration order. Failures are collected,
    /// not short-circuited.
    pub(crate) fn dispatch_tree(
        &self,
        entry: &Arc<TypeEntry>,
        value: &(dyn Any + Send + Sync),
        ctx: &DispatchContext,
    ) -> Result<(), DispatchError> {
        let mut failures = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(entry.type_id);
        self.invoke_entry(entry, value, ctx, &mut visited, &mut failures);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError { failures })
        }
    }

    fn invoke_entry(
        &self,
        entry: &Arc<TypeEntry>,
        value: &(dyn Any + Send + Sync),
        ctx: &DispatchContext,
        visited: &mut HashSet<TypeId>,
        failures: &mut Vec<HandlerFailure>,
    ) {
        for registration in entry.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| (registration.invoke)(value, ctx)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => failures.push(HandlerFailure {
                    registered_as: entry.event_name,
                    error,
                }),
                Err(_) => failures.push(HandlerFailure {
                    registered_as: entry.event_name,
                    error: HandlerError::new("handler panicked"),
                }),
            }
        }

        for link in &entry.parents {
            if !visited.insert(link.type_id) {
                continue;
            }
            let Some(parent) = self.registry.entry_for_type(link.type_id) else {
                continue;
            };
            match (link.convert)(value) {
                Some(parent_value) => {
                    self.invoke_entry(&parent, parent_value.as_ref(), ctx, visited, failures);
                }
                None => debug!(
                    parent = link.event_name,
                    "upcast did not apply to the dispatched value"
                ),
            }
        }
    }
}

#[derive(Default)]
struct IntakeStats {
    polls: usize,
    received: usize,
}

#[derive(Default)]
struct WorkerStats {
    acked: usize,
    nacked: usize,
}

pub(crate) struct PoolConfig {
    pub(crate) subscription: SubscriptionName,
    pub(crate) max_messages: usize,
    pub(crate) workers: usize,
    pub(crate) ordered: bool,
}

/// Background consume machinery. Signalling stop ends intake; workers drain
/// what they already hold and exit when the channels disconnect.
pub(crate) struct DispatchPool {
    stop: Arc<AtomicBool>,
    intake: Option<JoinHandle<IntakeStats>>,
    workers: Vec<JoinHandle<WorkerStats>>,
}

impl DispatchPool {
    pub(crate) fn start(
        subscriber: Arc<dyn SubscriberClient>,
        engine: Arc<DispatchEngine>,
        config: PoolConfig,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_count = config.workers.max(1);

        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = sync_channel::<DeliveredMessage>(0);
            senders.push(tx);
            let subscriber = subscriber.clone();
            let subscription = config.subscription.clone();
            let engine = engine.clone();
            workers.push(thread::spawn(move || {
                worker_loop(rx, subscriber, subscription, engine)
            }));
        }

        let intake = {
            let stop = stop.clone();
            thread::spawn(move || intake_loop(subscriber, config, senders, stop))
        };

        DispatchPool {
            stop,
            intake: Some(intake),
            workers,
        }
    }

    pub(crate) fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop intake, wait for workers to drain, and return the run's
    /// statistics.
    pub(crate) fn stop(mut self) -> DispatchStats {
        self.signal_stop();
        let mut stats = DispatchStats::default();
        if let Some(handle) = self.intake.take() {
            if let Ok(intake) = handle.join() {
                stats.polls = intake.polls;
                stats.received = intake.received;
            }
        }
        for handle in self.workers.drain(..) {
            if let Ok(worker) = handle.join() {
                stats.acked += worker.acked;
                stats.nacked += worker.nacked;
            }
        }
        stats
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        // Signal without joining; threads finish on their own.
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn route(message: &DeliveredMessage, ordered: bool, round_robin: &mut usize, workers: usize) -> usize {
    if ordered {
        if let Some(key) = message.ordering_key.as_deref().filter(|key| !key.is_empty()) {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            return (hasher.finish() as usize) % workers;
        }
    }
    let index = *round_robin % workers;
    *round_robin = round_robin.wrapping_add(1);
    index
}

fn intake_loop(
    subscriber: Arc<dyn SubscriberClient>,
    config: PoolConfig,
    senders: Vec<SyncSender<DeliveredMessage>>,
    stop: Arc<AtomicBool>,
) -> IntakeStats {
    let mut stats = IntakeStats::default();
    let mut round_robin = 0usize;

    while !stop.load(Ordering::SeqCst) {
        stats.polls += 1;
        match subscriber.pull(&config.subscription, config.max_messages.max(1)) {
            Ok(batch) if batch.is_empty() => thread::sleep(IDLE_POLL_INTERVAL),
            Ok(batch) => {
                for message in batch {
                    stats.received += 1;
                    let index = route(&message, config.ordered, &mut round_robin, senders.len());
                    // Rendezvous handoff: blocks while the worker is busy,
                    // which keeps outstanding deliveries within the
                    // flow-control bound.
                    if senders[index].send(message).is_err() {
                        return stats;
                    }
                }
            }
            Err(err) => {
                debug!(
                    subscription = %config.subscription,
                    error = %err,
                    "pull failed, retrying"
                );
                thread::sleep(IDLE_POLL_INTERVAL);
            }
        }
    }

    stats
}

fn worker_loop(
    receiver: Receiver<DeliveredMessage>,
    subscriber: Arc<dyn SubscriberClient>,
    subscription: SubscriptionName,
    engine: Arc<DispatchEngine>,
) -> WorkerStats {
    let mut stats = WorkerStats::default();

    while let Ok(message) = receiver.recv() {
        match engine.process(&message) {
            Reply::Ack => {
                if let Err(err) = subscriber.ack(&subscription, &message.message_id) {
                    warn!(message_id = %message.message_id, error = %err, "ack failed");
                }
                stats.acked += 1;
            }
            Reply::Nack => {
                if let Err(err) = subscriber.nack(&subscription, &message.message_id) {
                    warn!(message_id = %message.message_id, error = %err, "nack failed");
                }
                stats.nacked += 1;
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{BusEvent, UpcastSet, MESSAGE_ID_ATTRIBUTE};
    use crate::inbox::MemoryInbox;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone, Serialize, Deserialize)]
    struct OrderEvent {
        order_id: String,
    }

    impl BusEvent for OrderEvent {
        fn event_name() -> &'static str {
            "OrderEvent"
        }
    }

    #[derive(Clone, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: String,
        amount: f64,
    }

    impl BusEvent for OrderCreated {
        fn event_name() -> &'static str {
            "OrderCreated"
        }

        fn declare_parents(parents: &mut UpcastSet<Self>) {
            parents.parent(|event: &OrderCreated| OrderEvent {
                order_id: event.order_id.clone(),
            });
        }
    }

    fn delivery(message_id: &str, event_name: Option<&str>, body: &str) -> DeliveredMessage {
        let mut attributes = HashMap::new();
        if let Some(name) = event_name {
            attributes.insert(EVENT_NAME_ATTRIBUTE.to_string(), name.to_string());
        }
        attributes.insert(MESSAGE_ID_ATTRIBUTE.to_string(), message_id.to_string());
        DeliveredMessage {
            message_id: message_id.to_string(),
            data: body.as_bytes().to_vec(),
            attributes,
            ordering_key: None,
            delivery_attempt: 1,
        }
    }

    #[test]
    fn missing_event_name_is_acked() {
        let engine = DispatchEngine::new(HandlerRegistry::new(), None);
        assert_eq!(engine.process(&delivery("m-1", None, "{}")), Reply::Ack);
    }

    #[test]
    fn unknown_event_name_is_acked() {
        let engine = DispatchEngine::new(HandlerRegistry::new(), None);
        assert_eq!(
            engine.process(&delivery("m-1", Some("NeverHeardOfIt"), "{}")),
            Reply::Ack
        );
    }

    #[test]
    fn undecodable_body_is_acked_without_handlers() {
        let registry = HandlerRegistry::new();
        let invoked = Arc::new(Mutex::new(0));
        {
            let invoked = invoked.clone();
            registry.subscribe_fn(move |_: &OrderCreated, _| {
                *invoked.lock().unwrap() += 1;
                Ok(())
            });
        }
        let engine = DispatchEngine::new(registry, None);

        let reply = engine.process(&delivery("m-1", Some("OrderCreated"), "not json"));
        assert_eq!(reply, Reply::Ack);
        assert_eq!(*invoked.lock().unwrap(), 0);
    }

    #[test]
    fn successful_dispatch_acks_and_records_inbox() {
        let registry = HandlerRegistry::new();
        let invoked = Arc::new(Mutex::new(0));
        {
            let invoked = invoked.clone();
            registry.subscribe_fn(move |event: &OrderCreated, ctx: &DispatchContext| {
                assert_eq!(event.order_id, "ord-1");
                assert_eq!(ctx.event_name, "OrderCreated");
                *invoked.lock().unwrap() += 1;
                Ok(())
            });
        }
        let inbox = Arc::new(MemoryInbox::new());
        let engine = DispatchEngine::new(registry, Some(inbox.clone()));

        let message = delivery(
            "m-1",
            Some("OrderCreated"),
            r#"{"order_id":"ord-1","amount":99.99}"#,
        );
        assert_eq!(engine.process(&message), Reply::Ack);
        assert_eq!(*invoked.lock().unwrap(), 1);
        assert!(inbox.contains("m-1").unwrap());
    }

    #[test]
    fn duplicate_delivery_is_acked_without_handlers() {
        let registry = HandlerRegistry::new();
        let invoked = Arc::new(Mutex::new(0));
        {
            let invoked = invoked.clone();
            registry.subscribe_fn(move |_: &OrderCreated, _| {
                *invoked.lock().unwrap() += 1;
                Ok(())
            });
        }
        let inbox = Arc::new(MemoryInbox::new());
        let engine = DispatchEngine::new(registry, Some(inbox));

        let message = delivery(
            "m-1",
            Some("OrderCreated"),
            r#"{"order_id":"ord-1","amount":1.0}"#,
        );
        assert_eq!(engine.process(&message), Reply::Ack);
        // Redelivery of the same transport message id.
        assert_eq!(engine.process(&message), Reply::Ack);
        assert_eq!(*invoked.lock().unwrap(), 1);
    }

    #[test]
    fn handler_failure_nacks_and_skips_inbox_record() {
        let registry = HandlerRegistry::new();
        registry.subscribe_fn(|_: &OrderCreated, _| Err(HandlerError::new("db down")));
        let inbox = Arc::new(MemoryInbox::new());
        let engine = DispatchEngine::new(registry, Some(inbox.clone()));

        let message = delivery(
            "m-1",
            Some("OrderCreated"),
            r#"{"order_id":"ord-1","amount":1.0}"#,
        );
        assert_eq!(engine.process(&message), Reply::Nack);
        // No record: the redelivery must run handlers again.
        assert!(!inbox.contains("m-1").unwrap());
    }

    #[test]
    fn all_handlers_run_even_when_one_fails() {
        let registry = HandlerRegistry::new();
        let invoked = Arc::new(Mutex::new(Vec::new()));
        {
            let invoked = invoked.clone();
            registry.subscribe_fn(move |_: &OrderCreated, _| {
                invoked.lock().unwrap().push("first");
                Err(HandlerError::new("first failed"))
            });
        }
        {
            let invoked = invoked.clone();
            registry.subscribe_fn(move |_: &OrderCreated, _| {
                invoked.lock().unwrap().push("second");
                Ok(())
            });
        }
        let engine = DispatchEngine::new(registry, None);

        let message = delivery(
            "m-1",
            Some("OrderCreated"),
            r#"{"order_id":"ord-1","amount":1.0}"#,
        );
        assert_eq!(engine.process(&message), Reply::Nack);
        assert_eq!(invoked.lock().unwrap().as_slice(), ["first", "second"]);
    }

    #[test]
    fn covariant_dispatch_reaches_parent_handlers() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            registry.subscribe_fn(move |event: &OrderEvent, _| {
                seen.lock().unwrap().push(format!("parent:{}", event.order_id));
                Ok(())
            });
        }
        {
            let seen = seen.clone();
            registry.subscribe_fn(move |event: &OrderCreated, _| {
                seen.lock().unwrap().push(format!("child:{}", event.order_id));
                Ok(())
            });
        }
        let engine = DispatchEngine::new(registry, None);

        let message = delivery(
            "m-1",
            Some("OrderCreated"),
            r#"{"order_id":"ord-1","amount":2.5}"#,
        );
        assert_eq!(engine.process(&message), Reply::Ack);

        // Own type first, then registered parents.
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["child:ord-1", "parent:ord-1"]
        );
    }

    #[test]
    fn panicking_handler_is_contained_and_nacked() {
        let registry = HandlerRegistry::new();
        registry.subscribe_fn(|_: &OrderCreated, _| -> Result<(), HandlerError> {
            panic!("handler bug")
        });
        let engine = DispatchEngine::new(registry, None);

        let message = delivery(
            "m-1",
            Some("OrderCreated"),
            r#"{"order_id":"ord-1","amount":1.0}"#,
        );
        assert_eq!(engine.process(&message), Reply::Nack);
    }

    #[test]
    fn correlation_id_is_threaded_into_context() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            registry.subscribe_fn(move |_: &OrderCreated, ctx: &DispatchContext| {
                *seen.lock().unwrap() = ctx.correlation_id.clone();
                Ok(())
            });
        }
        let engine = DispatchEngine::new(registry, None);

        let mut message = delivery(
            "m-1",
            Some("OrderCreated"),
            r#"{"order_id":"ord-1","amount":1.0}"#,
        );
        message
            .attributes
            .insert(CORRELATION_ID_ATTRIBUTE.to_string(), "corr-42".to_string());

        engine.process(&message);
        assert_eq!(seen.lock().unwrap().as_deref(), Some("corr-42"));
    }

    #[test]
    fn ordering_key_routes_to_a_stable_worker() {
        let message = |key: Option<&str>| DeliveredMessage {
            message_id: "m".to_string(),
            data: Vec::new(),
            attributes: HashMap::new(),
            ordering_key: key.map(str::to_string),
            delivery_attempt: 1,
        };

        let mut round_robin = 0;
        let a = route(&message(Some("customer-1")), true, &mut round_robin, 4);
        let b = route(&message(Some("customer-1")), true, &mut round_robin, 4);
        assert_eq!(a, b);

        // Keyless messages round-robin.
        let first = route(&message(None), true, &mut round_robin, 4);
        let second = route(&message(None), true, &mut round_robin, 4);
        assert_ne!(first, second);
    }
}
