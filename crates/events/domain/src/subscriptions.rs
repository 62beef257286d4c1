//! Subscription Registry
//!
//! Process-scoped mapping from logical event names to their decoder and the
//! ordered list of handler factories. The registry is built once at startup
//! through [`SubscriptionRegistryBuilder`], then frozen: readers share it
//! behind an `Arc` and take no locks.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::events::{DynIntegrationEvent, IntegrationEvent};
use crate::handler::{HandlerError, IntegrationEventHandler};
use crate::serialization::{self, JsonOptions};

type DecodeFn = Box<
    dyn Fn(&[u8], &JsonOptions) -> Result<Arc<dyn DynIntegrationEvent>, serde_json::Error>
        + Send
        + Sync,
>;

type InvokeFn = Box<
    dyn Fn(Arc<dyn DynIntegrationEvent>) -> BoxFuture<'static, Result<(), HandlerError>>
        + Send
        + Sync,
>;

struct RegisteredHandler {
    handler_type: TypeId,
    invoke: InvokeFn,
}

/// Error returned when a handler in the chain fails. The remaining handlers
/// for that delivery are not run.
#[derive(Debug, Error)]
#[error("handler #{handler_index} for {event_name} failed: {source}")]
pub struct DispatchError {
    pub event_name: &'static str,
    pub handler_index: usize,
    #[source]
    pub source: HandlerError,
}

/// One registered event type: its decoder plus the ordered handler chain.
pub struct Subscription {
    event_name: &'static str,
    decode: DecodeFn,
    handlers: Vec<RegisteredHandler>,
}

impl Subscription {
    pub fn event_name(&self) -> &'static str {
        self.event_name
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Decode a payload into the registered event type.
    pub fn decode(
        &self,
        bytes: &[u8],
        options: &JsonOptions,
    ) -> Result<Arc<dyn DynIntegrationEvent>, serde_json::Error> {
        (self.decode)(bytes, options)
    }

    /// Run the handler chain in registration order, creating a fresh handler
    /// per delivery. The chain aborts on the first handler error.
    pub async fn dispatch(&self, event: Arc<dyn DynIntegrationEvent>) -> Result<(), DispatchError> {
        for (handler_index, registered) in self.handlers.iter().enumerate() {
            if let Err(source) = (registered.invoke)(Arc::clone(&event)).await {
                return Err(DispatchError {
                    event_name: self.event_name,
                    handler_index,
                    source,
                });
            }
        }
        Ok(())
    }
}

/// Immutable registry of subscriptions, shared by the bus and the event log.
pub struct SubscriptionRegistry {
    subscriptions: HashMap<String, Subscription>,
    json_options: JsonOptions,
}

impl SubscriptionRegistry {
    pub fn builder() -> SubscriptionRegistryBuilder {
        SubscriptionRegistryBuilder::new()
    }

    pub fn json_options(&self) -> &JsonOptions {
        &self.json_options
    }

    /// Look up a subscription by its logical event name.
    pub fn subscription(&self, event_name: &str) -> Option<&Subscription> {
        self.subscriptions.get(event_name)
    }

    pub fn is_registered(&self, event_name: &str) -> bool {
        self.subscriptions.contains_key(event_name)
    }

    /// Resolve a subscription from a fully qualified type path by matching
    /// its short form, the way the event log records type names.
    pub fn resolve(&self, type_path: &str) -> Option<&Subscription> {
        self.subscription(short_type_name(type_path))
    }

    /// Registered event names, used to bind the consumer queue.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }
}

/// Short form of a type path: the last `::` (or `.`) separated segment.
pub fn short_type_name(type_path: &str) -> &str {
    let tail = type_path.rsplit("::").next().unwrap_or(type_path);
    tail.rsplit('.').next().unwrap_or(tail)
}

/// Startup-time builder for the [`SubscriptionRegistry`].
#[derive(Default)]
pub struct SubscriptionRegistryBuilder {
    subscriptions: HashMap<String, Subscription>,
    json_options: JsonOptions,
}

impl SubscriptionRegistryBuilder {
    pub fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
            json_options: JsonOptions::default(),
        }
    }

    /// Register `H` for event type `E`. Handlers for the same event stack in
    /// registration order; registering the same handler type twice for the
    /// same event is a no-op.
    pub fn add_subscription<E, H, F>(mut self, factory: F) -> Self
    where
        E: IntegrationEvent + DeserializeOwned,
        H: IntegrationEventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let subscription = self
            .subscriptions
            .entry(E::NAME.to_string())
            .or_insert_with(|| Subscription {
                event_name: E::NAME,
                decode: Box::new(|bytes, options| {
                    let event: E = serialization::deserialize(bytes, options)?;
                    Ok(Arc::new(event) as Arc<dyn DynIntegrationEvent>)
                }),
                handlers: Vec::new(),
            });

        let handler_type = TypeId::of::<H>();
        if subscription
            .handlers
            .iter()
            .any(|registered| registered.handler_type == handler_type)
        {
            return self;
        }

        let factory = Arc::new(factory);
        subscription.handlers.push(RegisteredHandler {
            handler_type,
            invoke: Box::new(move |event| {
                let factory = Arc::clone(&factory);
                Box::pin(async move {
                    let handler = factory();
                    let typed = event.as_any().downcast_ref::<E>().ok_or_else(|| {
                        HandlerError::from(format!(
                            "delivered event is not a {}",
                            std::any::type_name::<E>()
                        ))
                    })?;
                    handler.handle(typed).await
                })
            }),
        });
        self
    }

    /// Mutate the process-wide serializer options. Startup only.
    pub fn configure_json_options(mut self, mutator: impl FnOnce(&mut JsonOptions)) -> Self {
        mutator(&mut self.json_options);
        self
    }

    pub fn build(self) -> SubscriptionRegistry {
        SubscriptionRegistry {
            subscriptions: self.subscriptions,
            json_options: self.json_options,
        }
    }
}
