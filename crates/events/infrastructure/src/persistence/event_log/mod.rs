//! Relational Event Log Stores
//!
//! Two interchangeable backings of the `EventLogStore` port over the
//! canonical `IntegrationEventLog` table: PostgreSQL for service
//! deployments and SQLite for embedded ones. Both store string UUIDs and
//! the stable integer state encoding, so the on-disk shape is identical.

pub mod postgres;
pub mod sqlite;

pub use postgres::PgEventLogStore;
pub use sqlite::SqliteEventLogStore;

use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use itintern_events_domain::outbox::{EventLogEntry, EventState, OutboxError};
use itintern_events_domain::SubscriptionRegistry;

/// Column list shared by both backings. Aliases pin the result names so row
/// mapping does not depend on each engine's identifier folding.
pub(crate) const SELECT_ENTRY: &str = r#"SELECT EventId AS "event_id", EventTypeName AS "event_type_name", State AS "state", TimesSent AS "times_sent", CreationTime AS "creation_time", Content AS "content", TransactionId AS "transaction_id" FROM IntegrationEventLog"#;

#[derive(sqlx::FromRow)]
pub(crate) struct EventLogRow {
    event_id: String,
    event_type_name: String,
    state: i32,
    times_sent: i32,
    creation_time: NaiveDateTime,
    content: String,
    transaction_id: String,
}

impl EventLogRow {
    /// Rebuild the domain entry, resolving the stored type name's short form
    /// against the registry. Unregistered types come back with `event = None`.
    pub(crate) fn into_entry(
        self,
        registry: &SubscriptionRegistry,
    ) -> Result<EventLogEntry, OutboxError> {
        let event_id = Uuid::parse_str(&self.event_id).map_err(|error| OutboxError::CorruptRow {
            event_id: self.event_id.clone(),
            message: format!("invalid event id: {error}"),
        })?;
        let state = EventState::from_i32(self.state).ok_or_else(|| OutboxError::CorruptRow {
            event_id: self.event_id.clone(),
            message: format!("invalid state {}", self.state),
        })?;
        let transaction_id =
            Uuid::parse_str(&self.transaction_id).map_err(|error| OutboxError::CorruptRow {
                event_id: self.event_id.clone(),
                message: format!("invalid transaction id: {error}"),
            })?;

        let event = match registry.resolve(&self.event_type_name) {
            Some(subscription) => Some(
                subscription
                    .decode(self.content.as_bytes(), registry.json_options())
                    .map_err(|error| OutboxError::CorruptRow {
                        event_id: self.event_id.clone(),
                        message: format!("content does not decode: {error}"),
                    })?,
            ),
            None => None,
        };

        Ok(EventLogEntry {
            event_id,
            event_type_name: self.event_type_name,
            state,
            times_sent: self.times_sent,
            creation_time: DateTime::<Utc>::from_naive_utc_and_offset(self.creation_time, Utc),
            content: self.content,
            transaction_id,
            event,
        })
    }
}
