//! Event Bus Port

use async_trait::async_trait;
use thiserror::Error;

use crate::events::DynIntegrationEvent;

#[derive(Debug, Error)]
pub enum EventBusError {
    /// Publish attempted while no open broker connection exists. Surfaced
    /// immediately, never retried.
    #[error("no open broker connection available")]
    NotConnected,

    /// Transient connectivity failure (connection, channel or socket). The
    /// retry pipeline re-attempts these.
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// Non-transient broker failure.
    #[error("broker operation failed: {0}")]
    Broker(String),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventBusError {
    /// Whether the retry pipeline should re-attempt after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, EventBusError::BrokerUnreachable(_))
    }
}

/// Publishes integration events to the broker.
///
/// Accepting the erased event keeps one publish path for every registered
/// type; a concrete `&MyEvent` coerces to the trait object at the call site.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &dyn DynIntegrationEvent) -> Result<(), EventBusError>;
}
