//! Typed events, handlers, and the dispatch context.
//!
//! Every event type carries exactly one logical wire name and may declare
//! parent event types. The declared parents form an explicit "is-a" table:
//! a handler registered for a parent type receives events published as any
//! of its (transitive) children, converted through the declared upcasts.
//! There is no reflection - if a type does not declare a parent, handlers
//! for that parent never see it.

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::registry::HandlerRegistry;

/// Attribute key carrying the logical event name on every published message.
pub const EVENT_NAME_ATTRIBUTE: &str = "EventName";
/// Attribute key carrying the producer-assigned message id (32-char hex).
pub const MESSAGE_ID_ATTRIBUTE: &str = "MessageId";
/// Attribute key carrying the correlation id, propagated in both directions.
pub const CORRELATION_ID_ATTRIBUTE: &str = "X-Correlation-Id";

/// Type-erased event value.
pub(crate) type DynEvent = Box<dyn Any + Send + Sync>;

/// A typed event that can cross the bus.
///
/// ```
/// use cloudbus::{BusEvent, UpcastSet};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct OrderEvent {
///     order_id: String,
/// }
///
/// impl BusEvent for OrderEvent {
///     fn event_name() -> &'static str {
///         "OrderEvent"
///     }
/// }
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct OrderCreated {
///     order_id: String,
///     amount: f64,
/// }
///
/// impl BusEvent for OrderCreated {
///     fn event_name() -> &'static str {
///         "OrderCreated"
///     }
///
///     // Handlers registered for OrderEvent receive OrderCreated too.
///     fn declare_parents(parents: &mut UpcastSet<Self>) {
///         parents.parent(|event: &OrderCreated| OrderEvent {
///             order_id: event.order_id.clone(),
///         });
///     }
/// }
/// ```
pub trait BusEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical wire name, e.g. `"OrderCreated"`. Exactly one per type.
    fn event_name() -> &'static str;

    /// Declare parent event types this event may be handled as.
    fn declare_parents(_parents: &mut UpcastSet<Self>) {}
}

/// Context passed explicitly through every handler invocation.
///
/// Carried as a parameter rather than ambient state so concurrent dispatches
/// stay isolated.
#[derive(Clone, Debug, Default)]
pub struct DispatchContext {
    /// Transport message id of the delivery being processed.
    pub message_id: String,
    /// Logical name the message was published under.
    pub event_name: String,
    /// Correlation id propagated from the producer, if any.
    pub correlation_id: Option<String>,
}

/// Error raised by application handler code.
///
/// Handler failures are assumed transient: the delivery is nacked and the
/// transport redelivers.
#[derive(Debug)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler failed: {}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for HandlerError {
    fn from(error: Box<dyn std::error::Error + Send + Sync>) -> Self {
        HandlerError::new(error.to_string())
    }
}

/// A handler for events of type `E`.
///
/// One handler chain runs sequentially per delivery; handlers for different
/// deliveries run concurrently, so implementations must be `Send + Sync`.
pub trait EventHandler<E: BusEvent>: Send + Sync {
    fn handle(&self, event: &E, ctx: &DispatchContext) -> Result<(), HandlerError>;
}

/// Adapter turning a closure into an [`EventHandler`].
pub(crate) struct FnHandler<E, F> {
    callback: F,
    _event: PhantomData<fn(&E)>,
}

impl<E, F> FnHandler<E, F> {
    pub(crate) fn new(callback: F) -> Self {
        FnHandler {
            callback,
            _event: PhantomData,
        }
    }
}

impl<E, F> EventHandler<E> for FnHandler<E, F>
where
    E: BusEvent,
    F: Fn(&E, &DispatchContext) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &E, ctx: &DispatchContext) -> Result<(), HandlerError> {
        (self.callback)(event, ctx)
    }
}

/// One edge of the declared event-type hierarchy: the parent's identity plus
/// the conversion applied when delivering a child event to the parent's
/// handlers.
pub(crate) struct ParentLink {
    pub(crate) type_id: TypeId,
    pub(crate) event_name: &'static str,
    /// Registers the parent's type entry so its name and decoder are known
    /// even before any handler subscribes to it.
    pub(crate) ensure: fn(&HandlerRegistry),
    pub(crate) convert: Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Option<DynEvent> + Send + Sync>,
}

/// Collects the parent declarations of one event type.
pub struct UpcastSet<E: BusEvent> {
    pub(crate) links: Vec<ParentLink>,
    _event: PhantomData<fn(&E)>,
}

impl<E: BusEvent> UpcastSet<E> {
    pub(crate) fn new() -> Self {
        UpcastSet {
            links: Vec::new(),
            _event: PhantomData,
        }
    }

    /// Declare `P` as a parent of `E`. `convert` produces the value handed to
    /// handlers registered for `P` when an `E` is dispatched.
    pub fn parent<P: BusEvent>(&mut self, convert: fn(&E) -> P) {
        self.links.push(ParentLink {
            type_id: TypeId::of::<P>(),
            event_name: P::event_name(),
            ensure: HandlerRegistry::ensure_entry_erased::<P>,
            convert: Arc::new(move |value: &(dyn Any + Send + Sync)| {
                value
                    .downcast_ref::<E>()
                    .map(|event| Box::new(convert(event)) as DynEvent)
            }),
        });
    }
}
