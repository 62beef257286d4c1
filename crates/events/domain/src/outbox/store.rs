//! Event Log Store Port

use async_trait::async_trait;
use uuid::Uuid;

use crate::events::DynIntegrationEvent;
use crate::outbox::model::{EventLogEntry, OutboxError};

/// Durable log of outbound integration events.
///
/// State machine: `NotPublished → InProgress → Published` on success,
/// `InProgress → PublishedFailed` on error, `PublishedFailed → InProgress`
/// on retry. `times_sent` is incremented exactly on the `→ InProgress`
/// transition. Concurrency control is the database's row lock; the store
/// takes no in-process locks.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Insert a `NotPublished` row for the event, outside any host
    /// transaction (`transaction_id` is the nil UUID).
    async fn save_event(&self, event: &dyn DynIntegrationEvent) -> Result<(), OutboxError>;

    /// Transition to `InProgress` and atomically increment `times_sent`.
    async fn mark_in_progress(&self, event_id: Uuid) -> Result<(), OutboxError>;

    /// Transition to `Published`. `times_sent` is unchanged.
    async fn mark_published(&self, event_id: Uuid) -> Result<(), OutboxError>;

    /// Transition to `PublishedFailed`. `times_sent` is unchanged.
    async fn mark_failed(&self, event_id: Uuid) -> Result<(), OutboxError>;

    /// `NotPublished` rows ordered by creation time ascending, with their
    /// content decoded through the subscription registry.
    async fn retrieve_pending(&self) -> Result<Vec<EventLogEntry>, OutboxError>;

    /// As [`retrieve_pending`](Self::retrieve_pending), filtered by the host
    /// transaction that saved the rows.
    async fn retrieve_pending_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<EventLogEntry>, OutboxError>;

    /// `PublishedFailed` rows ordered by creation time ascending.
    async fn retrieve_failed(&self) -> Result<Vec<EventLogEntry>, OutboxError>;

    async fn retrieve_failed_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<EventLogEntry>, OutboxError>;

    /// Startup sweep: move rows a dead publisher left `InProgress` back to
    /// `PublishedFailed` so the republisher picks them up again. Returns the
    /// number of recovered rows.
    async fn reset_in_progress(&self) -> Result<u64, OutboxError>;
}
