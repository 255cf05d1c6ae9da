use async_trait::async_trait;
use dashmap::DashMap;

use carehook_core::{Subscription, SubscriptionId};
use carehook_storage::{StorageError, SubscriptionStore};

/// In-memory subscription store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: DashMap<SubscriptionId, Subscription>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn insert(&self, subscription: &Subscription) -> Result<(), StorageError> {
        match self.subscriptions.entry(subscription.id) {
            dashmap::Entry::Occupied(_) => {
                Err(StorageError::already_exists("Subscription", subscription.id))
            }
            dashmap::Entry::Vacant(slot) => {
                slot.insert(subscription.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, subscription: &Subscription) -> Result<(), StorageError> {
        match self.subscriptions.get_mut(&subscription.id) {
            Some(mut current) => {
                *current = subscription.clone();
                Ok(())
            }
            None => Err(StorageError::not_found("Subscription", subscription.id)),
        }
    }

    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>, StorageError> {
        Ok(self.subscriptions.get(&id).map(|s| s.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Subscription>, StorageError> {
        let mut all: Vec<Subscription> = self
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }
}
