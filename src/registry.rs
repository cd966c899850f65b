//! Type-keyed handler registry.
//!
//! The registry owns two indexes that are always populated together: event
//! type -> entry (decoder, declared parents, handler list) and logical name
//! -> event type. Keeping them in lockstep is what lets an incoming message
//! be routed from its `EventName` attribute to a concrete Rust type before
//! any handler for it has fired.
//!
//! Registration is idempotent per handler instance, and every mutation is
//! safe against concurrent dispatch reads: readers take a snapshot of the
//! handler list and see either the pre- or post-mutation state, never a
//! partially updated list.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::warn;

use crate::event::{BusEvent, DispatchContext, DynEvent, EventHandler, FnHandler, HandlerError, ParentLink, UpcastSet};
use crate::serializer::{DecodeError, JsonSerializer};

type InvokeFn =
    Arc<dyn Fn(&(dyn Any + Send + Sync), &DispatchContext) -> Result<(), HandlerError> + Send + Sync>;
type DecodeFn = fn(&[u8]) -> Result<DynEvent, DecodeError>;

fn decode_event<E: BusEvent>(data: &[u8]) -> Result<DynEvent, DecodeError> {
    JsonSerializer::deserialize::<E>(data).map(|event| Box::new(event) as DynEvent)
}

/// One registered handler.
pub(crate) struct HandlerRegistration {
    id: u64,
    /// Pointer identity of the handler instance; the basis for idempotent
    /// registration and instance-based unsubscription.
    instance_key: usize,
    pub(crate) invoke: InvokeFn,
}

/// Registry entry for one event type.
pub(crate) struct TypeEntry {
    pub(crate) type_id: TypeId,
    pub(crate) event_name: &'static str,
    pub(crate) decode: DecodeFn,
    pub(crate) parents: Vec<ParentLink>,
    handlers: RwLock<Vec<Arc<HandlerRegistration>>>,
}

impl TypeEntry {
    /// Snapshot of the handler list in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<HandlerRegistration>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct RegistryState {
    entries: RwLock<HashMap<TypeId, Arc<TypeEntry>>>,
    names: RwLock<HashMap<&'static str, TypeId>>,
    next_registration_id: AtomicU64,
}

impl RegistryState {
    fn remove_registration(&self, type_id: TypeId, registration_id: u64) {
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .cloned();
        if let Some(entry) = entry {
            entry
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|registration| registration.id != registration_id);
        }
    }
}

/// Handle returned by `subscribe`. Cancelling removes the registration;
/// dropping the guard leaves it active.
pub struct SubscriptionGuard {
    registry: Weak<RegistryState>,
    type_id: TypeId,
    registration_id: u64,
    active: AtomicBool,
}

impl SubscriptionGuard {
    fn cancelled() -> Self {
        SubscriptionGuard {
            registry: Weak::new(),
            type_id: TypeId::of::<()>(),
            registration_id: 0,
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove the registration. No-op when already cancelled.
    pub fn cancel(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(state) = self.registry.upgrade() {
            state.remove_registration(self.type_id, self.registration_id);
        }
    }
}

/// Shared handler registry handle. Cloning shares the underlying state.
#[derive(Clone)]
pub struct HandlerRegistry {
    state: Arc<RegistryState>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        HandlerRegistry::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            state: Arc::new(RegistryState {
                entries: RwLock::new(HashMap::new()),
                names: RwLock::new(HashMap::new()),
                next_registration_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler instance for events of type `E`.
    ///
    /// Registering the same instance twice is a no-op that returns an
    /// already-cancelled guard.
    pub fn subscribe<E, H>(&self, handler: Arc<H>) -> SubscriptionGuard
    where
        E: BusEvent,
        H: EventHandler<E> + 'static,
    {
        let entry = self.ensure_entry::<E>();
        let instance_key = Arc::as_ptr(&handler) as *const () as usize;

        let mut handlers = entry
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers
            .iter()
            .any(|registration| registration.instance_key == instance_key)
        {
            return SubscriptionGuard::cancelled();
        }

        let registration_id = self
            .state
            .next_registration_id
            .fetch_add(1, Ordering::Relaxed);
        let invoke: InvokeFn = {
            let handler = handler.clone();
            Arc::new(move |value, ctx| match value.downcast_ref::<E>() {
                Some(event) => handler.handle(event, ctx),
                None => Err(HandlerError::new(
                    "event value did not match the registered type",
                )),
            })
        };
        handlers.push(Arc::new(HandlerRegistration {
            id: registration_id,
            instance_key,
            invoke,
        }));

        SubscriptionGuard {
            registry: Arc::downgrade(&self.state),
            type_id: entry.type_id,
            registration_id,
            active: AtomicBool::new(true),
        }
    }

    /// Register a closure for events of type `E`. Every call registers a
    /// fresh handler.
    pub fn subscribe_fn<E, F>(&self, callback: F) -> SubscriptionGuard
    where
        E: BusEvent,
        F: Fn(&E, &DispatchContext) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe::<E, _>(Arc::new(FnHandler::new(callback)))
    }

    /// Remove a previously registered handler instance.
    pub fn unsubscribe<E, H>(&self, handler: &Arc<H>)
    where
        E: BusEvent,
        H: EventHandler<E> + 'static,
    {
        let instance_key = Arc::as_ptr(handler) as *const () as usize;
        if let Some(entry) = self.entry_for_type(TypeId::of::<E>()) {
            entry
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|registration| registration.instance_key != instance_key);
        }
    }

    /// Remove every handler registered for `E`.
    pub fn unsubscribe_all<E: BusEvent>(&self) {
        if let Some(entry) = self.entry_for_type(TypeId::of::<E>()) {
            entry
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    /// Number of handlers currently registered for `E`.
    pub fn handler_count<E: BusEvent>(&self) -> usize {
        self.entry_for_type(TypeId::of::<E>())
            .map(|entry| entry.snapshot().len())
            .unwrap_or(0)
    }

    /// Whether the logical name maps to a known event type.
    pub fn knows_event_name(&self, event_name: &str) -> bool {
        self.state
            .names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(event_name)
    }

    pub(crate) fn entry_for_type(&self, type_id: TypeId) -> Option<Arc<TypeEntry>> {
        self.state
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .cloned()
    }

    pub(crate) fn entry_for_name(&self, event_name: &str) -> Option<Arc<TypeEntry>> {
        let type_id = *self
            .state
            .names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)?;
        self.entry_for_type(type_id)
    }

    /// Get or create the entry for `E`, indexing its name and the entries of
    /// every declared parent.
    pub(crate) fn ensure_entry<E: BusEvent>(&self) -> Arc<TypeEntry> {
        let type_id = TypeId::of::<E>();
        if let Some(entry) = self.entry_for_type(type_id) {
            return entry;
        }

        let mut upcasts = UpcastSet::<E>::new();
        E::declare_parents(&mut upcasts);
        let built = Arc::new(TypeEntry {
            type_id,
            event_name: E::event_name(),
            decode: decode_event::<E>,
            parents: upcasts.links,
            handlers: RwLock::new(Vec::new()),
        });

        let entry = {
            let mut entries = self
                .state
                .entries
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            entries.entry(type_id).or_insert(built).clone()
        };

        {
            let mut names = self
                .state
                .names
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let previous = names.entry(E::event_name()).or_insert(type_id);
            if *previous != type_id {
                warn!(
                    event = E::event_name(),
                    "event name already registered with a different type; keeping the first registration"
                );
            }
        }

        for link in &entry.parents {
            (link.ensure)(self);
        }

        entry
    }

    /// Monomorphized helper used by parent links to register the parent's
    /// entry through a type-erased function pointer.
    pub(crate) fn ensure_entry_erased<E: BusEvent>(registry: &HandlerRegistry) {
        registry.ensure_entry::<E>();
    }
}
