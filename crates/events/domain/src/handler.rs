//! Event Handler Port

use async_trait::async_trait;

use crate::events::IntegrationEvent;

/// Error type handlers are allowed to fail with. The dispatcher logs it and
/// aborts the remaining handlers for the delivery.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handles one integration event type.
///
/// A fresh handler instance is created per delivery from the factory given
/// at registration time, so implementations may hold per-delivery state.
#[async_trait]
pub trait IntegrationEventHandler<E>: Send + Sync
where
    E: IntegrationEvent,
{
    async fn handle(&self, event: &E) -> Result<(), HandlerError>;
}
