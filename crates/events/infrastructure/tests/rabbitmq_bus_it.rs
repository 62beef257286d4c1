//! End-to-end event bus tests against a live broker.
//!
//! These need a RabbitMQ instance on localhost (or `EVENTBUS_HOST_NAME`)
//! and are ignored by default.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use itintern_events_domain::integration_event;
use itintern_events_domain::{
    EventBus, HandlerError, IntegrationEventHandler, SubscriptionRegistry,
};
use itintern_events_infrastructure::config::EventBusSettings;
use itintern_events_infrastructure::messaging::rabbitmq::{connect, RabbitMqEventBus};

integration_event! {
    pub struct OrderCreatedEvent {
        pub order_id: u64,
    }
}

integration_event! {
    pub struct ChaosEvent {
        pub note: String,
    }
}

struct ForwardingHandler {
    seen: mpsc::UnboundedSender<OrderCreatedEvent>,
}

#[async_trait::async_trait]
impl IntegrationEventHandler<OrderCreatedEvent> for ForwardingHandler {
    async fn handle(&self, event: &OrderCreatedEvent) -> Result<(), HandlerError> {
        self.seen.send(event.clone())?;
        Ok(())
    }
}

struct ChaosWitness {
    seen: mpsc::UnboundedSender<ChaosEvent>,
}

#[async_trait::async_trait]
impl IntegrationEventHandler<ChaosEvent> for ChaosWitness {
    async fn handle(&self, event: &ChaosEvent) -> Result<(), HandlerError> {
        self.seen.send(event.clone())?;
        Ok(())
    }
}

fn settings() -> EventBusSettings {
    let queue = format!("itintern-it-{}", Uuid::new_v4().simple());
    let mut settings = EventBusSettings::for_local(queue).expect("valid settings");
    if let Ok(host) = std::env::var("EVENTBUS_HOST_NAME") {
        settings.host_name = host;
    }
    settings.retry_count = 3;
    settings
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn published_events_reach_the_registered_handler() {
    let settings = settings();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(
        SubscriptionRegistry::builder()
            .add_subscription::<OrderCreatedEvent, _, _>(move || ForwardingHandler {
                seen: seen_tx.clone(),
            })
            .build(),
    );

    let connection = Arc::new(connect(&settings).await.expect("broker reachable"));
    let bus = RabbitMqEventBus::new(connection, registry, settings);
    bus.start().await;
    // Give the consumer a moment to declare topology and bind.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let event = OrderCreatedEvent::new(42);
    bus.publish(&event).await.expect("publish succeeds");

    let received = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("handler invoked in time")
        .expect("channel open");
    assert_eq!(received.id, event.id);
    assert_eq!(received.order_id, 42);

    bus.stop().await;
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn fault_injected_payloads_skip_the_handler_chain() {
    let settings = settings();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(
        SubscriptionRegistry::builder()
            .add_subscription::<ChaosEvent, _, _>(move || ChaosWitness {
                seen: seen_tx.clone(),
            })
            .build(),
    );

    let connection = Arc::new(connect(&settings).await.expect("broker reachable"));
    let bus = RabbitMqEventBus::new(connection, registry, settings);
    bus.start().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let poisoned = ChaosEvent::new("please throw-fake-exception now".to_string());
    bus.publish(&poisoned).await.expect("publish succeeds");
    let follow_up = ChaosEvent::new("all clear".to_string());
    bus.publish(&follow_up).await.expect("publish succeeds");

    // The poisoned delivery is acked without dispatch; the follow-up proves
    // the consumer survived and kept its place in the queue.
    let received = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("handler invoked in time")
        .expect("channel open");
    assert_eq!(received.id, follow_up.id);
    assert_eq!(received.note, "all clear");

    bus.stop().await;
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn publishing_an_unbound_event_is_fire_and_forget() {
    let settings = settings();
    let registry = Arc::new(SubscriptionRegistry::builder().build());

    let connection = Arc::new(connect(&settings).await.expect("broker reachable"));
    let bus = RabbitMqEventBus::new(connection, registry, settings);

    // No subscriber ever bound this routing key; with mandatory publishing
    // and no return listener the broker drops it silently.
    let event = OrderCreatedEvent::new(7);
    bus.publish(&event).await.expect("publish succeeds");
}
