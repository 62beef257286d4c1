//! Messaging Infrastructure
//!
//! - RabbitMQ event bus (publish + consume over one direct exchange)
//! - Publish retry pipeline with exponential backoff
//! - W3C trace context propagation over AMQP headers
//! - Event log republisher

pub mod propagation;
pub mod rabbitmq;
pub mod republisher;
pub mod retry;

pub use rabbitmq::{connect, RabbitMqEventBus, EXCHANGE_NAME};
pub use republisher::{EventLogRepublisher, RepublisherConfig};
pub use retry::RetryPolicy;
