//! Event Log Model
//!
//! Domain model for the integration event log used by the transactional
//! outbox. Every event the application intends to publish is recorded here
//! in the same database transaction as the state change that produced it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::ser::Error as _;
use thiserror::Error;
use uuid::Uuid;

use crate::events::DynIntegrationEvent;
use crate::serialization::JsonOptions;
use crate::subscriptions::short_type_name;

/// Publication state of an event log entry.
///
/// The integer encoding is stored on disk and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    NotPublished = 0,
    InProgress = 1,
    Published = 2,
    PublishedFailed = 3,
}

impl EventState {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(EventState::NotPublished),
            1 => Some(EventState::InProgress),
            2 => Some(EventState::Published),
            3 => Some(EventState::PublishedFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event log entry not found: {0}")]
    NotFound(Uuid),

    #[error("corrupt event log row {event_id}: {message}")]
    CorruptRow { event_id: String, message: String },
}

/// One row of the `IntegrationEventLog` table.
///
/// `event` is populated on retrieval by resolving the short form of
/// `event_type_name` against the subscription registry; rows whose type is
/// not registered locally come back with `event = None` so the republisher
/// can log and skip them.
pub struct EventLogEntry {
    pub event_id: Uuid,
    pub event_type_name: String,
    pub state: EventState,
    pub times_sent: i32,
    pub creation_time: DateTime<Utc>,
    pub content: String,
    pub transaction_id: Uuid,
    pub event: Option<Arc<dyn DynIntegrationEvent>>,
}

impl EventLogEntry {
    /// Capture an event for the log. `transaction_id` is the nil UUID when
    /// the save happens outside a host transaction. Content is stored as
    /// indented JSON of the runtime type.
    pub fn new(
        event: &dyn DynIntegrationEvent,
        transaction_id: Uuid,
    ) -> Result<Self, serde_json::Error> {
        let bytes = event.to_json(&JsonOptions::indented())?;
        let content = String::from_utf8(bytes).map_err(serde_json::Error::custom)?;
        Ok(Self {
            event_id: event.id(),
            event_type_name: event.type_path().to_string(),
            state: EventState::NotPublished,
            times_sent: 0,
            creation_time: event.created_at(),
            content,
            transaction_id,
            event: None,
        })
    }

    /// Short form of the stored type name, the registry lookup key.
    pub fn short_type_name(&self) -> &str {
        short_type_name(&self.event_type_name)
    }

    pub fn with_event(mut self, event: Arc<dyn DynIntegrationEvent>) -> Self {
        self.event = Some(event);
        self
    }
}

impl fmt::Debug for EventLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLogEntry")
            .field("event_id", &self.event_id)
            .field("event_type_name", &self.event_type_name)
            .field("state", &self.state)
            .field("times_sent", &self.times_sent)
            .field("creation_time", &self.creation_time)
            .field("transaction_id", &self.transaction_id)
            .field("event", &self.event.as_ref().map(|event| event.name()))
            .finish()
    }
}
