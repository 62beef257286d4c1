// IT-Intern Platform - Integration Events, Domain Layer
// Ports and pure logic:
// - events: base event shape and identity
// - subscriptions: event name -> type + handler factories
// - serialization: JSON codec over the registry options
// - event_bus: publish port and error taxonomy
// - handler: per-event handler port
// - outbox: durable event log model and store port

pub mod event_bus;
pub mod events;
pub mod handler;
pub mod outbox;
pub mod serialization;
pub mod subscriptions;

pub use event_bus::{EventBus, EventBusError};
pub use events::{DynIntegrationEvent, IntegrationEvent};
pub use handler::{HandlerError, IntegrationEventHandler};
pub use outbox::{EventLogEntry, EventLogStore, EventState, OutboxError};
pub use serialization::JsonOptions;
pub use subscriptions::{
    DispatchError, Subscription, SubscriptionRegistry, SubscriptionRegistryBuilder,
};
