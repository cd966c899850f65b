//! Connection and bus configuration.
//!
//! All configuration here is load-time: a named table of transport
//! connections plus one options block for the bus itself. Both are immutable
//! for the lifetime of the process; loading them (files, environment, secret
//! managers) is the application's concern.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Name used when no explicit connection name is given.
pub const DEFAULT_CONNECTION_NAME: &str = "Default";

/// An opaque, prebuilt credential supplied by the application.
///
/// The bus never inspects this; it is handed through to the
/// [`ClientFactory`](crate::connection::ClientFactory) building the transport
/// clients, which downcasts it to whatever its client library expects.
#[derive(Clone)]
pub struct Credential(Arc<dyn Any + Send + Sync>);

impl Credential {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Credential(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// Configuration for one named pub/sub connection.
///
/// Credential material can come from four places; when more than one is set,
/// the connection registry picks one in this priority order:
///
/// 1. `emulator_host` — local emulator, insecure channel, no credentials
/// 2. `credential` — a prebuilt [`Credential`] instance
/// 3. `credentials_json` — inline credentials (e.g. from a secret manager)
/// 4. `credentials_path` — a credentials file on disk
/// 5. none of the above — ambient/default credential discovery
#[derive(Clone, Debug, Default)]
pub struct ConnectionConfig {
    /// Project / namespace identity. Required.
    pub project_id: String,
    /// Path to a service-account credentials file.
    pub credentials_path: Option<String>,
    /// Inline credentials JSON.
    pub credentials_json: Option<String>,
    /// A prebuilt credential resolved by the application.
    pub credential: Option<Credential>,
    /// Emulator endpoint override (e.g. `"localhost:8085"`).
    pub emulator_host: Option<String>,
}

impl ConnectionConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        ConnectionConfig {
            project_id: project_id.into(),
            ..ConnectionConfig::default()
        }
    }

    pub fn with_credentials_path(mut self, path: impl Into<String>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }

    pub fn with_credentials_json(mut self, json: impl Into<String>) -> Self {
        self.credentials_json = Some(json.into());
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_emulator_host(mut self, host: impl Into<String>) -> Self {
        self.emulator_host = Some(host.into());
        self
    }
}

/// Named connection table. Looked up by the connection registry; the
/// `"Default"` entry is used when no name is given.
#[derive(Clone, Debug, Default)]
pub struct PubSubConfig {
    connections: HashMap<String, ConnectionConfig>,
}

impl PubSubConfig {
    pub fn new() -> Self {
        PubSubConfig::default()
    }

    /// Register the `"Default"` connection.
    pub fn with_default(self, config: ConnectionConfig) -> Self {
        self.with_connection(DEFAULT_CONNECTION_NAME, config)
    }

    /// Register a named connection.
    pub fn with_connection(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), config);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }
}

/// Options for the event bus itself. Read once at startup.
///
/// Defaults match a conservative single-consumer deployment: batches of 10,
/// a 60 second ack deadline, provisioning enabled, one concurrent handler,
/// ordering off, 7 days of retention.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventBusOptions {
    /// Which named connection to use. `None` means `"Default"`.
    pub connection_name: Option<String>,
    /// Topic events are published to.
    pub topic_id: String,
    /// Subscription events are received from.
    pub subscription_id: String,
    /// Messages pulled from the transport in a single batch.
    pub max_messages: usize,
    /// Seconds the transport waits for an ack before redelivering.
    pub ack_deadline_seconds: u32,
    /// Create the topic at startup if it does not exist.
    pub auto_create_topic: bool,
    /// Create the subscription at startup if it does not exist.
    pub auto_create_subscription: bool,
    /// Attributes stamped on every published message. Caller-supplied
    /// attributes override these; the reserved routing attributes do not.
    pub default_attributes: HashMap<String, String>,
    /// Transport-side filter expression applied to the subscription.
    pub subscription_filter: Option<String>,
    /// Upper bound on concurrently processed deliveries (flow control).
    pub max_concurrent_handlers: usize,
    /// Deliver messages sharing an ordering key in publish order.
    pub enable_message_ordering: bool,
    /// Topic that exhausted messages are routed to by the transport.
    pub dead_letter_topic_id: Option<String>,
    /// Delivery attempts before the transport dead-letters a message.
    /// Only meaningful together with `dead_letter_topic_id`.
    pub max_delivery_attempts: u32,
    /// Days the subscription retains unacknowledged messages.
    pub message_retention_days: u32,
}

impl Default for EventBusOptions {
    fn default() -> Self {
        EventBusOptions {
            connection_name: None,
            topic_id: String::new(),
            subscription_id: String::new(),
            max_messages: 10,
            ack_deadline_seconds: 60,
            auto_create_topic: true,
            auto_create_subscription: true,
            default_attributes: HashMap::new(),
            subscription_filter: None,
            max_concurrent_handlers: 1,
            enable_message_ordering: false,
            dead_letter_topic_id: None,
            max_delivery_attempts: 5,
            message_retention_days: 7,
        }
    }
}

impl EventBusOptions {
    pub fn new(topic_id: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        EventBusOptions {
            topic_id: topic_id.into(),
            subscription_id: subscription_id.into(),
            ..EventBusOptions::default()
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = max;
        self
    }

    pub fn with_ack_deadline_seconds(mut self, seconds: u32) -> Self {
        self.ack_deadline_seconds = seconds;
        self
    }

    pub fn with_auto_create_topic(mut self, auto: bool) -> Self {
        self.auto_create_topic = auto;
        self
    }

    pub fn with_auto_create_subscription(mut self, auto: bool) -> Self {
        self.auto_create_subscription = auto;
        self
    }

    pub fn with_default_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.default_attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_subscription_filter(mut self, filter: impl Into<String>) -> Self {
        self.subscription_filter = Some(filter.into());
        self
    }

    pub fn with_max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = max;
        self
    }

    pub fn with_message_ordering(mut self, enabled: bool) -> Self {
        self.enable_message_ordering = enabled;
        self
    }

    pub fn with_dead_letter(
        mut self,
        topic_id: impl Into<String>,
        max_delivery_attempts: u32,
    ) -> Self {
        self.dead_letter_topic_id = Some(topic_id.into());
        self.max_delivery_attempts = max_delivery_attempts;
        self
    }

    pub fn with_message_retention_days(mut self, days: u32) -> Self {
        self.message_retention_days = days;
        self
    }
}

/// Error type for configuration lookups and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No connection with the given name is configured.
    UnknownConnection(String),
    /// A required option was left unset.
    MissingOption(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownConnection(name) => {
                write!(f, "pub/sub connection '{}' not found", name)
            }
            ConfigError::MissingOption(option) => {
                write!(f, "required option '{}' is not set", option)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = EventBusOptions::default();
        assert_eq!(options.max_messages, 10);
        assert_eq!(options.ack_deadline_seconds, 60);
        assert!(options.auto_create_topic);
        assert!(options.auto_create_subscription);
        assert_eq!(options.max_concurrent_handlers, 1);
        assert!(!options.enable_message_ordering);
        assert_eq!(options.max_delivery_attempts, 5);
        assert_eq!(options.message_retention_days, 7);
    }

    #[test]
    fn builder_chain() {
        let options = EventBusOptions::new("orders", "orders-sub")
            .with_connection_name("Analytics")
            .with_default_attribute("service", "orders")
            .with_dead_letter("orders-dlq", 3)
            .with_max_concurrent_handlers(8)
            .with_message_ordering(true);

        assert_eq!(options.topic_id, "orders");
        assert_eq!(options.connection_name.as_deref(), Some("Analytics"));
        assert_eq!(
            options.default_attributes.get("service").map(String::as_str),
            Some("orders")
        );
        assert_eq!(options.dead_letter_topic_id.as_deref(), Some("orders-dlq"));
        assert_eq!(options.max_delivery_attempts, 3);
        assert!(options.enable_message_ordering);
    }

    #[test]
    fn connection_table_lookup() {
        let config = PubSubConfig::new()
            .with_default(ConnectionConfig::new("proj-main"))
            .with_connection("Emulator", ConnectionConfig::new("proj-local").with_emulator_host("localhost:8085"));

        assert_eq!(config.get("Default").map(|c| c.project_id.as_str()), Some("proj-main"));
        assert!(config.get("Emulator").is_some());
        assert!(config.get("Nope").is_none());
    }

    #[test]
    fn credential_downcast() {
        let credential = Credential::new(String::from("token"));
        assert_eq!(credential.downcast_ref::<String>().map(String::as_str), Some("token"));
        assert!(credential.downcast_ref::<u64>().is_none());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: EventBusOptions =
            serde_json::from_str(r#"{"topic_id":"orders","subscription_id":"orders-sub"}"#)
                .unwrap();
        assert_eq!(options.topic_id, "orders");
        assert_eq!(options.max_messages, 10);
        assert!(options.dead_letter_topic_id.is_none());
    }
}
