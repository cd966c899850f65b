//! Shared fixtures for the end-to-end tests.

use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cloudbus::transport::{InMemoryPubSub, MemoryClientFactory};
use cloudbus::{
    BusEvent, ConnectionConfig, DispatchContext, EventBusOptions, EventHandler, HandlerError,
    PubSubConfig, PubSubEventBus, UpcastSet,
};

pub const PROJECT: &str = "test-project";

/// Base event: handlers registered for this receive every order event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: String,
}

impl BusEvent for OrderEvent {
    fn event_name() -> &'static str {
        "OrderEvent"
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: String,
    pub amount: f64,
    pub created_at: Option<DateTime<Utc>>,
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

/// Unrelated to the order hierarchy; used to prove no cross-talk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditTrail {
    pub note: String,
}

impl BusEvent for AuditTrail {
    fn event_name() -> &'static str {
        "AuditTrail"
    }
}

/// Handler that records everything it sees.
pub struct RecordingHandler<E> {
    seen: Mutex<Vec<(E, DispatchContext)>>,
}

impl<E: BusEvent + Clone> RecordingHandler<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<E> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub fn contexts(&self) -> Vec<DispatchContext> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, ctx)| ctx.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl<E: BusEvent + Clone> EventHandler<E> for RecordingHandler<E> {
    fn handle(&self, event: &E, ctx: &DispatchContext) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push((event.clone(), ctx.clone()));
        Ok(())
    }
}

/// Build a bus wired to the given in-memory broker.
pub fn bus_over(broker: &InMemoryPubSub, options: EventBusOptions) -> PubSubEventBus {
    PubSubEventBus::builder(options)
        .connections(PubSubConfig::new().with_default(ConnectionConfig::new(PROJECT)))
        .client_factory(Arc::new(MemoryClientFactory::new(broker.clone())))
        .build()
        .expect("bus builds")
}

/// Poll until the predicate holds or the timeout passes.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return predicate();
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
