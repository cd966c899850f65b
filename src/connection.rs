//! Connection registry: named transport connections with cached clients.
//!
//! One publisher handle and one subscriber handle are built per named
//! connection, at most once, and cached for the life of the registry.
//! Construction is the single piece of shared mutable state in the crate and
//! uses double-checked insertion: concurrent first-callers may race to build,
//! but all of them converge on the one instance that lands in the cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::config::{ConfigError, ConnectionConfig, Credential, PubSubConfig, DEFAULT_CONNECTION_NAME};
use crate::transport::{PublisherClient, SubscriberClient, TransportError};

/// Credential material picked from a connection configuration, in priority
/// order: emulator (insecure), prebuilt, inline JSON, file path, ambient.
#[derive(Clone, Debug)]
pub enum ResolvedCredentials {
    /// Emulator endpoint; no credentials, insecure channel.
    Insecure,
    /// A prebuilt credential supplied by the application.
    Prebuilt(Credential),
    /// Inline credentials JSON.
    Json(String),
    /// Path to a credentials file.
    File(String),
    /// Ambient/default credential discovery.
    AmbientDefault,
}

/// Settings handed to a [`ClientFactory`] to build one client.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub project_id: String,
    /// Endpoint override; set only for emulator connections.
    pub endpoint: Option<String>,
    pub credentials: ResolvedCredentials,
}

impl ClientSettings {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        if let Some(host) = &config.emulator_host {
            return ClientSettings {
                project_id: config.project_id.clone(),
                endpoint: Some(host.clone()),
                credentials: ResolvedCredentials::Insecure,
            };
        }

        let credentials = if let Some(credential) = &config.credential {
            ResolvedCredentials::Prebuilt(credential.clone())
        } else if let Some(json) = &config.credentials_json {
            ResolvedCredentials::Json(json.clone())
        } else if let Some(path) = &config.credentials_path {
            ResolvedCredentials::File(path.clone())
        } else {
            ResolvedCredentials::AmbientDefault
        };

        ClientSettings {
            project_id: config.project_id.clone(),
            endpoint: None,
            credentials,
        }
    }
}

/// Builds transport clients from resolved settings.
///
/// This is the seam to the actual client library; the crate ships
/// [`MemoryClientFactory`](crate::transport::MemoryClientFactory) for tests
/// and single-process deployments.
pub trait ClientFactory: Send + Sync {
    fn publisher(&self, settings: &ClientSettings)
        -> Result<Arc<dyn PublisherClient>, TransportError>;

    fn subscriber(
        &self,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn SubscriberClient>, TransportError>;
}

/// Error resolving a connection or building its client.
#[derive(Debug)]
pub enum ConnectionError {
    Config(ConfigError),
    Transport(TransportError),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Config(err) => err.fmt(f),
            ConnectionError::Transport(err) => write!(f, "failed to build client: {}", err),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Config(err) => Some(err),
            ConnectionError::Transport(err) => Some(err),
        }
    }
}

impl From<ConfigError> for ConnectionError {
    fn from(err: ConfigError) -> Self {
        ConnectionError::Config(err)
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        ConnectionError::Transport(err)
    }
}

/// Owned registry of named connections and their cached clients.
pub struct ConnectionRegistry {
    config: PubSubConfig,
    factory: Arc<dyn ClientFactory>,
    publishers: RwLock<HashMap<String, Arc<dyn PublisherClient>>>,
    subscribers: RwLock<HashMap<String, Arc<dyn SubscriberClient>>>,
}

impl ConnectionRegistry {
    pub fn new(config: PubSubConfig, factory: Arc<dyn ClientFactory>) -> Self {
        ConnectionRegistry {
            config,
            factory,
            publishers: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a named connection configuration. `None` means `"Default"`.
    pub fn resolve(&self, name: Option<&str>) -> Result<&ConnectionConfig, ConfigError> {
        let name = name.unwrap_or(DEFAULT_CONNECTION_NAME);
        self.config
            .get(name)
            .ok_or_else(|| ConfigError::UnknownConnection(name.to_string()))
    }

    /// Cached publisher client for a named connection.
    pub fn publisher(&self, name: Option<&str>) -> Result<Arc<dyn PublisherClient>, ConnectionError> {
        let key = name.unwrap_or(DEFAULT_CONNECTION_NAME);
        if let Some(client) = self
            .publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Ok(client.clone());
        }

        let config = self.resolve(name)?;
        let settings = ClientSettings::from_config(config);
        let built = self.factory.publisher(&settings)?;
        debug!(connection = key, "built publisher client");

        let mut publishers = self
            .publishers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(publishers.entry(key.to_string()).or_insert(built).clone())
    }

    /// Cached subscriber client for a named connection.
    pub fn subscriber(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn SubscriberClient>, ConnectionError> {
        let key = name.unwrap_or(DEFAULT_CONNECTION_NAME);
        if let Some(client) = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Ok(client.clone());
        }

        let config = self.resolve(name)?;
        let settings = ClientSettings::from_config(config);
        let built = self.factory.subscriber(&settings)?;
        debug!(connection = key, "built subscriber client");

        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(subscribers.entry(key.to_string()).or_insert(built).clone())
    }

    /// Drop every cached client. Safe to call more than once; clients are
    /// rebuilt on the next access.
    pub fn dispose(&self) {
        if let Ok(mut publishers) = self.publishers.write() {
            publishers.clear();
        }
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.clear();
        }
    }
}
