//! Event Log Republisher
//!
//! Background worker that drains the event log: pending and previously
//! failed entries are marked in progress, published on the bus, then marked
//! published or failed. Runs until its shutdown signal fires. The poll
//! cadence is a default, not a contract; hosts with other scheduling needs
//! can drive the store and the bus themselves.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use itintern_events_domain::outbox::EventLogEntry;
use itintern_events_domain::{EventBus, EventLogStore};

#[derive(Debug, Clone)]
pub struct RepublisherConfig {
    /// How often to look for publishable entries.
    pub poll_interval: Duration,
}

impl Default for RepublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct EventLogRepublisher {
    store: Arc<dyn EventLogStore>,
    event_bus: Arc<dyn EventBus>,
    config: RepublisherConfig,
    shutdown: watch::Receiver<bool>,
}

impl EventLogRepublisher {
    pub fn new(
        store: Arc<dyn EventLogStore>,
        event_bus: Arc<dyn EventBus>,
        config: Option<RepublisherConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            event_bus,
            config: config.unwrap_or_default(),
            shutdown,
        }
    }

    /// Run until shutdown. Intended for `tokio::spawn`.
    pub async fn run(self) {
        info!("🚀 event log republisher starting");

        // Rows a dead publisher left in progress become failed so this run
        // picks them up again.
        match self.store.reset_in_progress().await {
            Ok(0) => {}
            Ok(recovered) => warn!(recovered, "recovered in-progress events from a previous run"),
            Err(error) => error!(error = %error, "failed to recover in-progress events"),
        }

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("event log republisher shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One pass over publishable entries: everything still unpublished plus
    /// everything that failed before.
    async fn sweep(&self) {
        let pending = match self.store.retrieve_pending().await {
            Ok(entries) => entries,
            Err(error) => {
                error!(error = %error, "failed to retrieve pending events");
                return;
            }
        };
        let failed = match self.store.retrieve_failed().await {
            Ok(entries) => entries,
            Err(error) => {
                error!(error = %error, "failed to retrieve failed events");
                return;
            }
        };

        let total = pending.len() + failed.len();
        if total > 0 {
            debug!(total, "republishing event log entries");
        }
        for entry in pending.into_iter().chain(failed) {
            self.republish(entry).await;
        }
    }

    async fn republish(&self, entry: EventLogEntry) {
        let Some(event) = entry.event.clone() else {
            warn!(
                event_id = %entry.event_id,
                event_type = %entry.event_type_name,
                "no local type registered for event, skipping"
            );
            return;
        };

        if let Err(error) = self.store.mark_in_progress(entry.event_id).await {
            error!(event_id = %entry.event_id, error = %error, "failed to mark event in progress");
            return;
        }

        match self.event_bus.publish(event.as_ref()).await {
            Ok(()) => {
                if let Err(error) = self.store.mark_published(entry.event_id).await {
                    error!(event_id = %entry.event_id, error = %error, "published but failed to record it");
                } else {
                    debug!(event_id = %entry.event_id, event_type = %entry.event_type_name, "event republished");
                }
            }
            Err(publish_error) => {
                warn!(
                    event_id = %entry.event_id,
                    times_sent = entry.times_sent,
                    error = %publish_error,
                    "publish failed, event stays in the log"
                );
                if let Err(error) = self.store.mark_failed(entry.event_id).await {
                    error!(event_id = %entry.event_id, error = %error, "failed to mark event failed");
                }
            }
        }
    }
}
