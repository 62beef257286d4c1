//! PostgreSQL Event Log Store
//!
//! SQLx-based implementation of the `EventLogStore` port. State updates are
//! a single statement so concurrent publishers are serialized by the row
//! lock; the store itself never opens a transaction on behalf of a save
//! that joins a host transaction.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use itintern_events_domain::outbox::{EventLogEntry, EventState, OutboxError};
use itintern_events_domain::{DynIntegrationEvent, EventLogStore, SubscriptionRegistry};

use super::{EventLogRow, SELECT_ENTRY};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS IntegrationEventLog (
  EventId         VARCHAR(36) PRIMARY KEY,
  EventTypeName   VARCHAR(255) NOT NULL,
  State           INT          NOT NULL,
  TimesSent       INT          NOT NULL,
  CreationTime    TIMESTAMP    NOT NULL,
  Content         TEXT         NOT NULL,
  TransactionId   VARCHAR(36)  NOT NULL
)
"#;

const INSERT_ENTRY: &str = "INSERT INTO IntegrationEventLog \
     (EventId, EventTypeName, State, TimesSent, CreationTime, Content, TransactionId) \
     VALUES ($1, $2, $3, $4, $5, $6, $7)";

// State 1 is InProgress; that transition is the only one that counts a send.
const UPDATE_STATE: &str = "UPDATE IntegrationEventLog \
     SET State = $1, TimesSent = TimesSent + CASE WHEN $1 = 1 THEN 1 ELSE 0 END \
     WHERE EventId = $2";

pub struct PgEventLogStore {
    pool: PgPool,
    registry: Arc<SubscriptionRegistry>,
}

impl PgEventLogStore {
    pub fn new(pool: PgPool, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Best-effort table creation. Deployments that manage the schema
    /// elsewhere can fail this without taking the host down.
    pub async fn ensure_created(&self) {
        if let Err(error) = sqlx::query(CREATE_TABLE).execute(&self.pool).await {
            warn!(error = %error, "could not create IntegrationEventLog table, continuing");
        }
    }

    /// Insert the event on the caller's transaction. The row commits or
    /// rolls back with the host's business data.
    pub async fn save_event_in_tx(
        &self,
        event: &dyn DynIntegrationEvent,
        tx: &mut Transaction<'_, Postgres>,
        transaction_id: Uuid,
    ) -> Result<(), OutboxError> {
        let entry = EventLogEntry::new(event, transaction_id)?;
        bind_insert(&entry).execute(&mut **tx).await?;
        Ok(())
    }

    async fn update_state(&self, event_id: Uuid, state: EventState) -> Result<(), OutboxError> {
        let result = sqlx::query(UPDATE_STATE)
            .bind(state.as_i32())
            .bind(event_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(event_id));
        }
        Ok(())
    }

    async fn retrieve(
        &self,
        state: EventState,
        transaction_id: Option<Uuid>,
    ) -> Result<Vec<EventLogEntry>, OutboxError> {
        let rows: Vec<EventLogRow> = match transaction_id {
            Some(transaction_id) => {
                let sql = format!(
                    "{SELECT_ENTRY} WHERE State = $1 AND TransactionId = $2 ORDER BY CreationTime ASC"
                );
                sqlx::query_as(&sql)
                    .bind(state.as_i32())
                    .bind(transaction_id.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("{SELECT_ENTRY} WHERE State = $1 ORDER BY CreationTime ASC");
                sqlx::query_as(&sql)
                    .bind(state.as_i32())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter()
            .map(|row| row.into_entry(&self.registry))
            .collect()
    }
}

fn bind_insert(
    entry: &EventLogEntry,
) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(INSERT_ENTRY)
        .bind(entry.event_id.to_string())
        .bind(&entry.event_type_name)
        .bind(entry.state.as_i32())
        .bind(entry.times_sent)
        .bind(entry.creation_time.naive_utc())
        .bind(&entry.content)
        .bind(entry.transaction_id.to_string())
}

#[async_trait]
impl EventLogStore for PgEventLogStore {
    async fn save_event(&self, event: &dyn DynIntegrationEvent) -> Result<(), OutboxError> {
        let entry = EventLogEntry::new(event, Uuid::nil())?;
        bind_insert(&entry).execute(&self.pool).await?;
        Ok(())
    }

    async fn mark_in_progress(&self, event_id: Uuid) -> Result<(), OutboxError> {
        self.update_state(event_id, EventState::InProgress).await
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<(), OutboxError> {
        self.update_state(event_id, EventState::Published).await
    }

    async fn mark_failed(&self, event_id: Uuid) -> Result<(), OutboxError> {
        self.update_state(event_id, EventState::PublishedFailed)
            .await
    }

    async fn retrieve_pending(&self) -> Result<Vec<EventLogEntry>, OutboxError> {
        self.retrieve(EventState::NotPublished, None).await
    }

    async fn retrieve_pending_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<EventLogEntry>, OutboxError> {
        self.retrieve(EventState::NotPublished, Some(transaction_id))
            .await
    }

    async fn retrieve_failed(&self) -> Result<Vec<EventLogEntry>, OutboxError> {
        self.retrieve(EventState::PublishedFailed, None).await
    }

    async fn retrieve_failed_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<EventLogEntry>, OutboxError> {
        self.retrieve(EventState::PublishedFailed, Some(transaction_id))
            .await
    }

    async fn reset_in_progress(&self) -> Result<u64, OutboxError> {
        let swept = sqlx::query("UPDATE IntegrationEventLog SET State = $1 WHERE State = $2")
            .bind(EventState::PublishedFailed.as_i32())
            .bind(EventState::InProgress.as_i32())
            .execute(&self.pool)
            .await?;
        Ok(swept.rows_affected())
    }
}
