mod bus;
mod config;
mod connection;
mod dispatch;
mod event;
mod inbox;
mod outbox;
mod registry;
mod serializer;
mod topology;
pub mod transport;

pub use bus::{
    EventBusBuilder, InitError, LifecycleState, PubSubEventBus, PublishError, PublishOptions,
};
pub use config::{
    ConfigError, ConnectionConfig, Credential, EventBusOptions, PubSubConfig,
    DEFAULT_CONNECTION_NAME,
};
pub use connection::{
    ClientFactory, ClientSettings, ConnectionError, ConnectionRegistry, ResolvedCredentials,
};
pub use dispatch::{DispatchError, DispatchStats, HandlerFailure};
pub use event::{
    BusEvent, DispatchContext, EventHandler, HandlerError, UpcastSet, CORRELATION_ID_ATTRIBUTE,
    EVENT_NAME_ATTRIBUTE, MESSAGE_ID_ATTRIBUTE,
};
pub use inbox::{InboxError, InboxStore, IncomingEventInfo, MemoryInbox};
pub use outbox::{
    DistributedEventSent, EventSource, OutboxBatchReport, OutboxFailure, OutgoingEventInfo,
};
pub use registry::{HandlerRegistry, SubscriptionGuard};
pub use serializer::{DecodeError, EncodeError, JsonSerializer};
pub use topology::{ProvisionError, Provisioner};

// Re-export the EventEmitter from the event_emitter_rs crate
pub use event_emitter_rs::EventEmitter;
