use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use carehook_core::{Event, EventId};
use carehook_storage::{EventStore, StorageError};

#[derive(Debug, Clone)]
struct StoredEvent {
    event: Event,
    resolved: bool,
}

/// In-memory event store. Event ids are UUID v7, so the map iterates in
/// intake order.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<BTreeMap<EventId, StoredEvent>>,
    offline: AtomicBool,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable backend: every call fails with a connection
    /// error until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::connection("in-memory event store is offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn record(&self, event: &Event) -> Result<(), StorageError> {
        self.check_online()?;
        let mut events = self.events.write();
        if events.contains_key(&event.id) {
            return Err(StorageError::already_exists("Event", event.id));
        }
        events.insert(
            event.id,
            StoredEvent {
                event: event.clone(),
                resolved: false,
            },
        );
        Ok(())
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>, StorageError> {
        self.check_online()?;
        Ok(self.events.read().get(&id).map(|s| s.event.clone()))
    }

    async fn unresolved(&self, limit: usize) -> Result<Vec<Event>, StorageError> {
        self.check_online()?;
        Ok(self
            .events
            .read()
            .values()
            .filter(|s| !s.resolved)
            .take(limit)
            .map(|s| s.event.clone())
            .collect())
    }

    async fn mark_resolved(&self, id: EventId) -> Result<(), StorageError> {
        self.check_online()?;
        match self.events.write().get_mut(&id) {
            Some(stored) => {
                stored.resolved = true;
                Ok(())
            }
            None => Err(StorageError::not_found("Event", id)),
        }
    }
}
