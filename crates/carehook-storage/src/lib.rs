//! Storage abstraction layer for carehook.
//!
//! Backends (`carehook-db-memory`, `carehook-db-postgres`) implement the four
//! traits defined here. [`Stores`] bundles one instance of each for wiring.

pub mod error;
pub mod traits;

use std::sync::Arc;

pub use error::StorageError;
pub use traits::{ClaimPolicy, DeliveryLedger, DeliveryQueue, EventStore, SubscriptionStore};

/// Shared handles to every store of one backend.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub queue: Arc<dyn DeliveryQueue>,
    pub ledger: Arc<dyn DeliveryLedger>,
}

impl Stores {
    /// Use a single backend value for all four stores.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: EventStore + SubscriptionStore + DeliveryQueue + DeliveryLedger + 'static,
    {
        Self {
            events: backend.clone(),
            subscriptions: backend.clone(),
            queue: backend.clone(),
            ledger: backend,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
