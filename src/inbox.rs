//! Inbox - consumer-side dedup ledger.
//!
//! The transport delivers at-least-once; the inbox keeps exactly-once
//! *processing*. A record keyed by the transport message id is written only
//! after the message's handlers have all succeeded; the dispatch pipeline
//! probes for the record before running handlers and skips (acks) a message
//! that already has one.
//!
//! The backing store is an external collaborator; [`MemoryInbox`] is the
//! in-process implementation for tests and single-process deployments.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

/// Error raised by an inbox store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxError {
    /// The store could not be reached or its state is unusable.
    Unavailable(String),
}

impl fmt::Display for InboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboxError::Unavailable(detail) => write!(f, "inbox unavailable: {}", detail),
        }
    }
}

impl std::error::Error for InboxError {}

/// Dedup ledger contract.
pub trait InboxStore: Send + Sync {
    /// Whether `message_id` was already fully processed.
    fn contains(&self, message_id: &str) -> Result<bool, InboxError>;

    /// Record `message_id` as processed. Returns `false` when the id is
    /// already present - a concurrent delivery of the same message won the
    /// race, which callers treat as "already handled".
    fn try_add(&self, message_id: &str) -> Result<bool, InboxError>;
}

/// In-memory inbox.
#[derive(Debug, Default)]
pub struct MemoryInbox {
    seen: Mutex<HashSet<String>>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        MemoryInbox::default()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InboxStore for MemoryInbox {
    fn contains(&self, message_id: &str) -> Result<bool, InboxError> {
        let seen = self
            .seen
            .lock()
            .map_err(|_| InboxError::Unavailable("inbox lock poisoned".to_string()))?;
        Ok(seen.contains(message_id))
    }

    fn try_add(&self, message_id: &str) -> Result<bool, InboxError> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| InboxError::Unavailable("inbox lock poisoned".to_string()))?;
        Ok(seen.insert(message_id.to_string()))
    }
}

/// An event captured durably by an inbox store for deferred processing,
/// handed back to the bus by an inbox-draining worker.
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingEventInfo {
    /// Transport message id of the original delivery.
    pub message_id: String,
    /// Logical event name.
    pub event_name: String,
    /// Serialized event body.
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
}

impl IncomingEventInfo {
    pub fn new(
        message_id: impl Into<String>,
        event_name: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        IncomingEventInfo {
            message_id: message_id.into(),
            event_name: event_name.into(),
            body,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}
