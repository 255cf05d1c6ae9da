//! In-memory storage backend for carehook.
//!
//! Nothing here survives a restart. Use it for explicitly non-durable
//! deployments and for tests; production deployments use
//! `carehook-db-postgres`.
//!
//! # Example
//!
//! ```ignore
//! use carehook_db_memory::InMemoryStorage;
//!
//! let storage = InMemoryStorage::new();
//! let stores = storage.stores();
//! stores.events.record(&event).await?;
//! ```

pub mod events;
pub mod ledger;
pub mod queue;
pub mod subscriptions;

use std::sync::Arc;

use carehook_storage::Stores;

pub use events::InMemoryEventStore;
pub use ledger::InMemoryLedger;
pub use queue::InMemoryQueue;
pub use subscriptions::InMemorySubscriptionStore;

/// All four in-memory stores.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    pub events: Arc<InMemoryEventStore>,
    pub subscriptions: Arc<InMemorySubscriptionStore>,
    pub queue: Arc<InMemoryQueue>,
    pub ledger: Arc<InMemoryLedger>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trait-object handles for wiring into the dispatcher.
    pub fn stores(&self) -> Stores {
        Stores {
            events: self.events.clone(),
            subscriptions: self.subscriptions.clone(),
            queue: self.queue.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

/// Creates a new in-memory backend and returns its store handles.
pub fn create_stores() -> Stores {
    InMemoryStorage::new().stores()
}
