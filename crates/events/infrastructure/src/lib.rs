// IT-Intern Platform - Integration Events, Infrastructure Layer
// Concrete adapters for the domain ports, organized by technology.

pub mod config;
pub mod messaging;
pub mod persistence;

pub use config::{ConfigError, EventBusSettings};
pub use messaging::{
    connect, EventLogRepublisher, RabbitMqEventBus, RepublisherConfig, RetryPolicy, EXCHANGE_NAME,
};
pub use persistence::{
    PgEventLogStore, ResilientTransaction, ResilientTransactionError, SqliteEventLogStore,
};
