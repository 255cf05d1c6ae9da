//! Event intake and fan-out.
//!
//! `submit` validates and durably records an event, then wakes the resolver.
//! Resolution is a separate step so that an event recorded just before a
//! crash is still fanned out on restart: unresolved events stay flagged in
//! the event store until every matching subscription has a queued task.
//! Each batch is resolved against a registry snapshot loaded after the
//! newest event in it was recorded.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};

use carehook_core::{DeliveryTask, Event, EventId, HookError, NewEvent, Result};
use carehook_storage::{DeliveryQueue, EventStore, StorageError};

use crate::registry::SubscriptionRegistry;

/// Intake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Largest accepted payload, measured as serialized JSON.
    pub max_payload_bytes: usize,

    /// Fallback interval for the resolver when no wakeup arrives.
    pub resolve_poll_interval_ms: u64,

    /// Events resolved per store round trip.
    pub resolve_batch_size: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024,
            resolve_poll_interval_ms: 1_000,
            resolve_batch_size: 100,
        }
    }
}

/// Accepts events from producers and fans them out into the delivery queue.
pub struct EventBus {
    events: Arc<dyn EventStore>,
    queue: Arc<dyn DeliveryQueue>,
    registry: Arc<SubscriptionRegistry>,
    config: IntakeConfig,
    resolve_signal: Arc<Notify>,
    dispatch_signal: Option<Arc<Notify>>,
}

impl EventBus {
    pub fn new(
        events: Arc<dyn EventStore>,
        queue: Arc<dyn DeliveryQueue>,
        registry: Arc<SubscriptionRegistry>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            events,
            queue,
            registry,
            config,
            resolve_signal: Arc::new(Notify::new()),
            dispatch_signal: None,
        }
    }

    /// Notify `signal` whenever new tasks are enqueued.
    pub fn with_dispatch_signal(mut self, signal: Arc<Notify>) -> Self {
        self.dispatch_signal = Some(signal);
        self
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    /// Validate, record and acknowledge an event.
    ///
    /// The event is durable when this returns `Ok`. Storage failures surface
    /// as [`HookError::QueueUnavailable`]; nothing is dropped silently.
    pub async fn submit(&self, new: NewEvent) -> Result<EventId> {
        let size = new.validate(self.config.max_payload_bytes)?;
        let event = new.into_event();

        self.events.record(&event).await.map_err(|e| {
            tracing::error!(
                event_type = %event.event_type,
                error = %e,
                "Failed to record event"
            );
            HookError::QueueUnavailable(e.to_string())
        })?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            payload_bytes = size,
            "Event accepted"
        );
        self.resolve_signal.notify_one();
        Ok(event.id)
    }

    pub async fn get(&self, id: EventId) -> Result<Event> {
        self.events
            .get(id)
            .await?
            .ok_or_else(|| HookError::not_found("Event", id))
    }

    /// Fan out up to `limit` unresolved events. Returns the number of tasks
    /// enqueued.
    pub async fn resolve_pending(&self, limit: usize) -> Result<usize> {
        let (_, enqueued) = self.resolve_batch(limit).await?;
        Ok(enqueued)
    }

    /// Returns `(events resolved, tasks enqueued)`.
    async fn resolve_batch(&self, limit: usize) -> Result<(usize, usize)> {
        let events = self.events.unresolved(limit).await?;
        // Another instance may have committed a subscription after our last
        // refresh; resolve against a snapshot newer than every event here.
        if let Some(latest) = events.iter().map(|e| e.recorded_at).max()
            && self.registry.ensure_fresh(latest).await?
        {
            tracing::debug!(events = events.len(), "Registry reloaded before fan-out");
        }
        let mut enqueued = 0;
        for event in &events {
            enqueued += self.resolve_event(event).await?;
        }
        if enqueued > 0
            && let Some(signal) = &self.dispatch_signal
        {
            signal.notify_one();
        }
        Ok((events.len(), enqueued))
    }

    async fn resolve_event(&self, event: &Event) -> std::result::Result<usize, StorageError> {
        let subscriptions = self.registry.resolve(&event.event_type);
        let mut enqueued = 0;
        for subscription in &subscriptions {
            if self
                .queue
                .enqueue(&DeliveryTask::new(event, subscription))
                .await?
            {
                enqueued += 1;
            }
        }
        self.events.mark_resolved(event.id).await?;

        if subscriptions.is_empty() {
            tracing::debug!(event_id = %event.id, event_type = %event.event_type, "No subscriptions matched");
        } else {
            tracing::debug!(
                event_id = %event.id,
                matched = subscriptions.len(),
                enqueued,
                "Event fanned out"
            );
        }
        Ok(enqueued)
    }

    /// Resolve until no unresolved events remain.
    async fn drain(&self) -> Result<usize> {
        let batch = self.config.resolve_batch_size.max(1);
        let mut total = 0;
        loop {
            let (resolved, enqueued) = self.resolve_batch(batch).await?;
            total += enqueued;
            if resolved < batch {
                return Ok(total);
            }
        }
    }

    /// Resolve events as they arrive until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Starting event resolver");
        let poll_interval = Duration::from_millis(self.config.resolve_poll_interval_ms);

        loop {
            if let Err(e) = self.drain().await {
                tracing::error!(error = %e, "Failed to resolve pending events");
            }

            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("Event resolver shutting down");
                        break;
                    }
                }
                _ = self.resolve_signal.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use carehook_core::NewSubscription;
    use carehook_db_memory::InMemoryStorage;
    use serde_json::json;
    use time::OffsetDateTime;
    use tokio_test::block_on;

    fn bus(storage: &InMemoryStorage, config: IntakeConfig) -> (EventBus, Arc<SubscriptionRegistry>) {
        let registry = Arc::new(SubscriptionRegistry::new(
            storage.subscriptions.clone(),
            RegistryConfig::default(),
        ));
        let bus = EventBus::new(
            storage.events.clone(),
            storage.queue.clone(),
            registry.clone(),
            config,
        );
        (bus, registry)
    }

    fn event(event_type: &str) -> NewEvent {
        NewEvent::new(event_type, json!({"id": 1}), OffsetDateTime::now_utc())
    }

    #[test]
    fn test_submit_records_and_fans_out() {
        let storage = InMemoryStorage::new();
        let (bus, registry) = bus(&storage, IntakeConfig::default());
        block_on(async {
            registry
                .create(NewSubscription::new("billing.*", "https://a.example.com", "k"))
                .await
                .unwrap();
            registry
                .create(NewSubscription::new("*", "https://b.example.com", "k"))
                .await
                .unwrap();

            let id = bus.submit(event("billing.refund_issued")).await.unwrap();
            assert_eq!(bus.get(id).await.unwrap().event_type, "billing.refund_issued");
            assert_eq!(bus.resolve_pending(10).await.unwrap(), 2);
            assert_eq!(bus.resolve_pending(10).await.unwrap(), 0);

            bus.submit(event("lab.result_ready")).await.unwrap();
            assert_eq!(bus.resolve_pending(10).await.unwrap(), 1);
        });
        assert_eq!(storage.queue.len(), 3);
    }

    #[test]
    fn test_unmatched_event_is_still_resolved() {
        let storage = InMemoryStorage::new();
        let (bus, _) = bus(&storage, IntakeConfig::default());
        block_on(async {
            bus.submit(event("shift.changed")).await.unwrap();
            assert_eq!(bus.resolve_pending(10).await.unwrap(), 0);
            assert!(storage.events.unresolved(10).await.unwrap().is_empty());
        });
        assert!(storage.queue.is_empty());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let storage = InMemoryStorage::new();
        let (bus, _) = bus(
            &storage,
            IntakeConfig {
                max_payload_bytes: 16,
                ..Default::default()
            },
        );
        let big = NewEvent::new(
            "lab.result_ready",
            json!({"notes": "x".repeat(64)}),
            OffsetDateTime::now_utc(),
        );
        assert!(matches!(
            block_on(bus.submit(big)),
            Err(HookError::Validation(_))
        ));
        assert!(storage.events.is_empty());
    }

    #[test]
    fn test_get_unknown_event() {
        let storage = InMemoryStorage::new();
        let (bus, _) = bus(&storage, IntakeConfig::default());
        assert!(matches!(
            block_on(bus.get(EventId::new())),
            Err(HookError::NotFound { .. })
        ));
    }
}
