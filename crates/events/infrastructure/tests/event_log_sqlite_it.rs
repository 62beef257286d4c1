//! Event log integration tests over the embedded SQLite backing.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use itintern_events_domain::integration_event;
use itintern_events_domain::outbox::EventState;
use itintern_events_domain::{
    EventLogStore, HandlerError, IntegrationEventHandler, OutboxError, SubscriptionRegistry,
};
use itintern_events_infrastructure::persistence::event_log::SqliteEventLogStore;
use itintern_events_infrastructure::persistence::resilient_tx::ResilientTransaction;

integration_event! {
    pub struct ParcelShippedEvent {
        pub parcel_id: u64,
    }
}

struct NoopHandler;

#[async_trait::async_trait]
impl IntegrationEventHandler<ParcelShippedEvent> for NoopHandler {
    async fn handle(&self, _event: &ParcelShippedEvent) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn registry() -> Arc<SubscriptionRegistry> {
    Arc::new(
        SubscriptionRegistry::builder()
            .add_subscription::<ParcelShippedEvent, _, _>(|| NoopHandler)
            .build(),
    )
}

async fn setup_store() -> (SqlitePool, SqliteEventLogStore) {
    // A single connection keeps the in-memory database alive for the whole
    // test.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory database");
    let store = SqliteEventLogStore::new(pool.clone(), registry());
    store.ensure_created().await;
    (pool, store)
}

async fn stored_state(pool: &SqlitePool, event_id: Uuid) -> (i32, i32) {
    sqlx::query_as::<_, (i32, i32)>(
        r#"SELECT State AS "state", TimesSent AS "times_sent" FROM IntegrationEventLog WHERE EventId = ?1"#,
    )
    .bind(event_id.to_string())
    .fetch_one(pool)
    .await
    .expect("row should exist")
}

#[tokio::test]
async fn publish_lifecycle_counts_one_send() {
    let (pool, store) = setup_store().await;
    let event = ParcelShippedEvent::new(4001);

    store.save_event(&event).await.unwrap();
    store.mark_in_progress(event.id).await.unwrap();
    store.mark_published(event.id).await.unwrap();

    let (state, times_sent) = stored_state(&pool, event.id).await;
    assert_eq!(state, EventState::Published.as_i32());
    assert_eq!(times_sent, 1);
}

#[tokio::test]
async fn failed_retry_lifecycle_counts_two_sends() {
    let (pool, store) = setup_store().await;
    let event = ParcelShippedEvent::new(4002);

    store.save_event(&event).await.unwrap();
    store.mark_in_progress(event.id).await.unwrap();
    store.mark_failed(event.id).await.unwrap();
    store.mark_in_progress(event.id).await.unwrap();
    store.mark_published(event.id).await.unwrap();

    let (state, times_sent) = stored_state(&pool, event.id).await;
    assert_eq!(state, EventState::Published.as_i32());
    assert_eq!(times_sent, 2);
}

#[tokio::test]
async fn marking_an_unknown_event_reports_not_found() {
    let (_pool, store) = setup_store().await;

    let error = store.mark_in_progress(Uuid::new_v4()).await.unwrap_err();

    assert!(matches!(error, OutboxError::NotFound(_)));
}

#[tokio::test]
async fn pending_entries_come_back_oldest_first_with_decoded_events() {
    let (_pool, store) = setup_store().await;
    let base = Utc::now();

    let mut newest = ParcelShippedEvent::new(3);
    newest.creation_date = base + ChronoDuration::seconds(2);
    let mut oldest = ParcelShippedEvent::new(1);
    oldest.creation_date = base;
    let mut middle = ParcelShippedEvent::new(2);
    middle.creation_date = base + ChronoDuration::seconds(1);

    for event in [&newest, &oldest, &middle] {
        store.save_event(event).await.unwrap();
    }

    let pending = store.retrieve_pending().await.unwrap();

    assert_eq!(pending.len(), 3);
    assert_eq!(pending[0].event_id, oldest.id);
    assert_eq!(pending[1].event_id, middle.id);
    assert_eq!(pending[2].event_id, newest.id);

    let decoded = pending[0].event.as_ref().expect("type is registered");
    let parcel = decoded
        .as_any()
        .downcast_ref::<ParcelShippedEvent>()
        .unwrap();
    assert_eq!(parcel.parcel_id, 1);
    assert_eq!(parcel.id, oldest.id);
}

#[tokio::test]
async fn failed_entries_are_retrievable_but_pending_excludes_them() {
    let (_pool, store) = setup_store().await;
    let event = ParcelShippedEvent::new(9);

    store.save_event(&event).await.unwrap();
    store.mark_in_progress(event.id).await.unwrap();
    store.mark_failed(event.id).await.unwrap();

    assert!(store.retrieve_pending().await.unwrap().is_empty());
    let failed = store.retrieve_failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].event_id, event.id);
    assert_eq!(failed[0].times_sent, 1);

    // Saved outside a transaction, so it carries the nil transaction id.
    let for_nil = store
        .retrieve_failed_for_transaction(Uuid::nil())
        .await
        .unwrap();
    assert_eq!(for_nil.len(), 1);
}

#[tokio::test]
async fn in_progress_entries_are_invisible_until_reset() {
    let (_pool, store) = setup_store().await;
    let event = ParcelShippedEvent::new(12);

    store.save_event(&event).await.unwrap();
    store.mark_in_progress(event.id).await.unwrap();

    // A crashed publisher leaves the row in progress: neither queue sees it.
    assert!(store.retrieve_pending().await.unwrap().is_empty());
    assert!(store.retrieve_failed().await.unwrap().is_empty());

    let swept = store.reset_in_progress().await.unwrap();
    assert_eq!(swept, 1);
    let failed = store.retrieve_failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].event_id, event.id);
}

#[tokio::test]
async fn unregistered_event_types_come_back_without_an_event() {
    let (pool, store) = setup_store().await;

    sqlx::query(
        "INSERT INTO IntegrationEventLog \
         (EventId, EventTypeName, State, TimesSent, CreationTime, Content, TransactionId) \
         VALUES (?1, ?2, 0, 0, ?3, ?4, ?5)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind("legacy::events::TenantMigratedEvent")
    .bind(Utc::now().naive_utc())
    .bind("{}")
    .bind(Uuid::nil().to_string())
    .execute(&pool)
    .await
    .unwrap();

    let pending = store.retrieve_pending().await.unwrap();

    assert_eq!(pending.len(), 1);
    assert!(pending[0].event.is_none());
    assert_eq!(pending[0].short_type_name(), "TenantMigratedEvent");
}

#[tokio::test]
async fn rolled_back_transactions_leave_no_rows() {
    let (pool, store) = setup_store().await;
    let event = ParcelShippedEvent::new(77);

    let mut tx = pool.begin().await.unwrap();
    store
        .save_event_in_tx(&event, &mut tx, Uuid::new_v4())
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert!(store.retrieve_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn committed_transactions_stamp_the_transaction_id() {
    let (pool, store) = setup_store().await;
    let event = ParcelShippedEvent::new(78);
    let transaction_id = Uuid::new_v4();

    let mut tx = pool.begin().await.unwrap();
    store
        .save_event_in_tx(&event, &mut tx, transaction_id)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let for_transaction = store
        .retrieve_pending_for_transaction(transaction_id)
        .await
        .unwrap();
    assert_eq!(for_transaction.len(), 1);
    assert_eq!(for_transaction[0].transaction_id, transaction_id);

    let other = store
        .retrieve_pending_for_transaction(Uuid::new_v4())
        .await
        .unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn resilient_transaction_commits_saves_with_its_id() {
    let (pool, store) = setup_store().await;
    let store = Arc::new(store);
    let event = ParcelShippedEvent::new(500);

    let resilient = ResilientTransaction::new(pool.clone());
    let transaction_id = resilient
        .execute(|tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>, transaction_id| {
            let store = Arc::clone(&store);
            let event = event.clone();
            Box::pin(async move {
                store.save_event_in_tx(&event, tx, transaction_id).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

    let saved = store
        .retrieve_pending_for_transaction(transaction_id)
        .await
        .unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].event_id, event.id);
}

#[tokio::test]
async fn resilient_transaction_rolls_back_on_action_error() {
    let (pool, store) = setup_store().await;
    let store = Arc::new(store);
    let event = ParcelShippedEvent::new(501);

    let resilient = ResilientTransaction::new(pool.clone());
    let result = resilient
        .execute(|tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>, transaction_id| {
            let store = Arc::clone(&store);
            let event = event.clone();
            Box::pin(async move {
                store.save_event_in_tx(&event, tx, transaction_id).await?;
                Err("business rule violated".into())
            })
        })
        .await;

    assert!(result.is_err());
    assert!(store.retrieve_pending().await.unwrap().is_empty());
}
