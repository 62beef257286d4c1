//! RabbitMQ Event Bus
//!
//! Publishes and consumes integration events over a single direct exchange.
//! The broker connection is shared and owned by the host; this client owns
//! one long-lived consumer channel and opens a short-lived channel per
//! publish. Deliveries are acked exactly once regardless of handler
//! outcome; durability across crashes is supplied by the event log, not by
//! broker redelivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use opentelemetry::trace::{FutureExt, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{global, Context, KeyValue};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use itintern_events_domain::{DynIntegrationEvent, EventBus, EventBusError, SubscriptionRegistry};

use crate::config::EventBusSettings;
use crate::messaging::propagation;
use crate::messaging::retry::RetryPolicy;

/// The one direct exchange every integration event goes through.
pub const EXCHANGE_NAME: &str = "it-intern_event_bus";

const TRACER_NAME: &str = "itintern-events";

/// Payloads containing this marker simulate a consumer crash. Chaos-testing
/// hook: the handler chain is skipped and the delivery is still acked.
const FAULT_INJECTION_MARKER: &str = "throw-fake-exception";

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Open the shared broker connection, retrying transient failures with the
/// configured backoff. The host owns the returned connection.
pub async fn connect(settings: &EventBusSettings) -> Result<Connection, EventBusError> {
    let uri = settings.amqp_uri();
    let retry = RetryPolicy::new(settings.retry_count);
    let connection = retry
        .run(EventBusError::is_transient, || async {
            Connection::connect(&uri, ConnectionProperties::default())
                .await
                .map_err(map_broker_error)
        })
        .await?;
    connection.on_error(|error| error!(error = %error, "broker connection error"));
    Ok(connection)
}

pub struct RabbitMqEventBus {
    connection: Arc<Connection>,
    registry: Arc<SubscriptionRegistry>,
    settings: EventBusSettings,
    retry: RetryPolicy,
    shutdown: watch::Sender<bool>,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
}

impl RabbitMqEventBus {
    pub fn new(
        connection: Arc<Connection>,
        registry: Arc<SubscriptionRegistry>,
        settings: EventBusSettings,
    ) -> Self {
        let retry = RetryPolicy::new(settings.retry_count);
        let (shutdown, _) = watch::channel(false);
        Self {
            connection,
            registry,
            settings,
            retry,
            shutdown,
            consumer_task: Mutex::new(None),
        }
    }

    /// Spawn the consumer worker and return promptly. Setup failures are
    /// logged and leave the consumer stopped; the host keeps running and
    /// publishing stays possible on the shared connection.
    pub async fn start(&self) {
        let worker = ConsumerWorker {
            connection: Arc::clone(&self.connection),
            registry: Arc::clone(&self.registry),
            queue_name: self.settings.subscription_client_name.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        let handle = tokio::spawn(worker.run());
        *self.consumer_task.lock().await = Some(handle);
    }

    /// Signal the consumer worker and wait for a short drain window.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(mut handle) = self.consumer_task.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_DRAIN, &mut handle).await.is_err() {
                warn!("consumer did not drain in time, aborting");
                handle.abort();
            }
        }
    }

    async fn publish_on_channel(
        &self,
        channel: &Channel,
        routing_key: &str,
        event: &dyn DynIntegrationEvent,
    ) -> Result<(), EventBusError> {
        // Idempotent safety net; the consumer normally declared it already.
        channel
            .exchange_declare(
                EXCHANGE_NAME,
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_broker_error)?;

        let body = event.to_json(self.registry.json_options())?;
        let event_id = event.id();

        self.retry
            .run(EventBusError::is_transient, || {
                self.publish_attempt(channel, routing_key, event_id, &body)
            })
            .await
    }

    async fn publish_attempt(
        &self,
        channel: &Channel,
        routing_key: &str,
        event_id: Uuid,
        body: &[u8],
    ) -> Result<(), EventBusError> {
        let tracer = global::tracer(TRACER_NAME);
        let span = tracer
            .span_builder(format!("{routing_key} publish"))
            .with_kind(SpanKind::Client)
            .with_attributes(message_span_attributes("publish", routing_key))
            .start(&tracer);
        let span_cx = Context::current_with_span(span);
        // Without an installed tracer the fresh span is invalid; propagate
        // the ambient context instead so an upstream trace still flows.
        let inject_cx = if span_cx.span().span_context().is_valid() {
            span_cx.clone()
        } else {
            Context::current()
        };

        let mut headers = FieldTable::default();
        propagation::inject(&inject_cx, &mut headers);

        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_message_id(event_id.to_string().into())
            .with_headers(headers);

        let result: Result<(), EventBusError> = async {
            let confirm = channel
                .basic_publish(
                    EXCHANGE_NAME,
                    routing_key,
                    BasicPublishOptions {
                        mandatory: true,
                        ..BasicPublishOptions::default()
                    },
                    body,
                    properties,
                )
                .await
                .map_err(map_broker_error)?;
            confirm.await.map_err(map_broker_error)?;
            Ok(())
        }
        .await;

        {
            let span = span_cx.span();
            if let Err(error) = &result {
                span.record_error(error);
                span.set_status(Status::error(error.to_string()));
            }
            span.end();
        }
        result
    }
}

#[async_trait]
impl EventBus for RabbitMqEventBus {
    async fn publish(&self, event: &dyn DynIntegrationEvent) -> Result<(), EventBusError> {
        let routing_key = event.name();
        if !self.connection.status().connected() {
            return Err(EventBusError::NotConnected);
        }
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(map_broker_error)?;

        let result = self.publish_on_channel(&channel, routing_key, event).await;

        // The publish channel is scoped to this call, released on all paths.
        if let Err(error) = channel.close(200, "publish complete").await {
            debug!(error = %error, "failed to close publish channel");
        }
        result
    }
}

struct ConsumerWorker {
    connection: Arc<Connection>,
    registry: Arc<SubscriptionRegistry>,
    queue_name: String,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerWorker {
    async fn run(self) {
        let mut shutdown = self.shutdown.clone();

        if !self.connection.status().connected() {
            warn!("broker connection is not open, consumer not started");
            return;
        }
        let channel = match self.connection.create_channel().await {
            Ok(channel) => channel,
            Err(error) => {
                error!(error = %error, "failed to open consumer channel, consumer not started");
                return;
            }
        };
        channel.on_error(|error| error!(error = %error, "consumer channel error"));
        if let Err(error) = channel
            .exchange_declare(
                EXCHANGE_NAME,
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            error!(error = %error, "failed to declare exchange, consumer not started");
            return;
        }
        if let Err(error) = channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            error!(error = %error, queue = %self.queue_name, "failed to declare queue, consumer not started");
            return;
        }
        let mut consumer = match channel
            .basic_consume(
                &self.queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(error) => {
                error!(error = %error, "failed to start consumer");
                return;
            }
        };
        for event_name in self.registry.event_names() {
            if let Err(error) = channel
                .queue_bind(
                    &self.queue_name,
                    EXCHANGE_NAME,
                    event_name,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                error!(error = %error, routing_key = event_name, "failed to bind queue");
                return;
            }
        }
        info!(queue = %self.queue_name, "event bus consumer started");

        // Deliveries are processed strictly one at a time: the next message
        // is not taken until the previous handler chain completed and the
        // delivery was acked.
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("event bus consumer shutting down");
                    break;
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => self.handle_delivery(delivery).await,
                        Some(Err(error)) => {
                            error!(error = %error, "consumer channel error");
                        }
                        None => {
                            warn!("consumer stream ended");
                            break;
                        }
                    }
                }
            }
        }
        let _ = channel.close(200, "consumer stopped").await;
    }

    /// Process one delivery. Nothing in here may take the worker down: every
    /// failure is caught, tagged on the span, logged, and the delivery is
    /// still acked exactly once.
    async fn handle_delivery(&self, delivery: Delivery) {
        let routing_key = delivery.routing_key.as_str().to_string();
        let headers = delivery.properties.headers().clone().unwrap_or_default();
        let parent = propagation::extract(&headers);

        let tracer = global::tracer(TRACER_NAME);
        let span = tracer
            .span_builder(format!("{routing_key} receive"))
            .with_kind(SpanKind::Client)
            .with_attributes(message_span_attributes("receive", &routing_key))
            .start_with_context(&tracer, &parent);
        let cx = parent.with_span(span);

        // Ambient baggage for everything the handler chain does. Attached
        // per-poll via `with_context` (rather than held across the await as
        // a guard) so this future stays `Send`.
        if let Err(error) = self
            .process_delivery(&cx, &routing_key, &delivery.data)
            .with_context(parent.clone())
            .await
        {
            let span = cx.span();
            span.record_error(error.as_ref());
            span.set_status(Status::error(error.to_string()));
            warn!(routing_key = %routing_key, error = %error, "error processing event delivery");
        }

        if let Err(error) = delivery
            .acker
            .ack(BasicAckOptions::default())
            .with_context(parent.clone())
            .await
        {
            error!(routing_key = %routing_key, error = %error, "failed to ack delivery");
        }
        cx.span().end();
    }

    async fn process_delivery(
        &self,
        cx: &Context,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let message = std::str::from_utf8(body)?;
        cx.span()
            .set_attribute(KeyValue::new("message", message.to_string()));

        if contains_fault_marker(message) {
            return Err(format!("fake exception requested: \"{message}\"").into());
        }

        let Some(subscription) = self.registry.subscription(routing_key) else {
            warn!(routing_key, "no subscription registered for event, delivery dropped");
            return Ok(());
        };

        let event = subscription.decode(body, self.registry.json_options())?;
        debug!(
            routing_key,
            event_id = %event.id(),
            handlers = subscription.handler_count(),
            "dispatching event"
        );
        subscription.dispatch(event).await?;
        Ok(())
    }
}

fn contains_fault_marker(message: &str) -> bool {
    message.to_ascii_lowercase().contains(FAULT_INJECTION_MARKER)
}

fn message_span_attributes(operation: &'static str, routing_key: &str) -> Vec<KeyValue> {
    vec![
        KeyValue::new("messaging.system", "rabbitmq"),
        KeyValue::new("messaging.destination_kind", "queue"),
        KeyValue::new("messaging.operation", operation),
        KeyValue::new("messaging.destination.name", routing_key.to_string()),
        KeyValue::new("messaging.rabbitmq.routing_key", routing_key.to_string()),
    ]
}

fn map_broker_error(error: lapin::Error) -> EventBusError {
    match &error {
        lapin::Error::IOError(_)
        | lapin::Error::ProtocolError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_) => {
            EventBusError::BrokerUnreachable(error.to_string())
        }
        _ => EventBusError::Broker(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_marker_is_matched_case_insensitively() {
        assert!(contains_fault_marker(r#"{"note":"throw-fake-exception"}"#));
        assert!(contains_fault_marker(r#"{"note":"THROW-FAKE-Exception"}"#));
        assert!(!contains_fault_marker(r#"{"note":"throw fake exception"}"#));
    }

    #[test]
    fn connection_state_errors_map_to_unreachable() {
        let error = map_broker_error(lapin::Error::InvalidConnectionState(
            lapin::ConnectionState::Closed,
        ));
        assert!(error.is_transient());
    }

    #[test]
    fn span_attributes_carry_the_routing_key() {
        let attributes = message_span_attributes("publish", "OrderCreatedEvent");
        assert!(attributes
            .iter()
            .any(|kv| kv.key.as_str() == "messaging.rabbitmq.routing_key"
                && kv.value.as_str() == "OrderCreatedEvent"));
    }
}
