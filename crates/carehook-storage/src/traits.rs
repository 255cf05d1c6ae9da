//! Storage traits that every carehook backend implements.
//!
//! Implementations must be thread-safe (`Send + Sync`). The delivery queue is
//! the single point of mutable state shared by dispatch workers, so its claim
//! operation must be atomic: no two callers may obtain the same task.

use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use carehook_core::{
    DeliveryAttempt, DeliveryTask, Event, EventId, QueueStats, Subscription, SubscriptionHealth,
    SubscriptionId, TaskId, TaskState,
};

use crate::error::StorageError;

/// Durable record of accepted events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Record an accepted event. Must be durable before returning.
    async fn record(&self, event: &Event) -> Result<(), StorageError>;

    async fn get(&self, id: EventId) -> Result<Option<Event>, StorageError>;

    /// Events whose subscription fan-out has not completed, oldest first.
    async fn unresolved(&self, limit: usize) -> Result<Vec<Event>, StorageError>;

    /// Mark fan-out complete for an event.
    async fn mark_resolved(&self, id: EventId) -> Result<(), StorageError>;
}

/// Administrative subscription records.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the id is taken.
    async fn insert(&self, subscription: &Subscription) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the subscription does not exist.
    async fn update(&self, subscription: &Subscription) -> Result<(), StorageError>;

    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>, StorageError>;

    /// All subscriptions, ordered by `created_at` then id.
    async fn list(&self) -> Result<Vec<Subscription>, StorageError>;
}

/// Rules applied when claiming a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    /// How long a claim is held before the task becomes claimable again.
    pub lease_timeout: Duration,

    /// Upper bound on leased tasks per subscription.
    pub max_in_flight_per_subscription: Option<u32>,

    /// Key claims by subscription: one leased task per subscription, and only
    /// the earliest unfinished task of that subscription is claimable.
    pub strict_ordering: bool,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(60),
            max_in_flight_per_subscription: None,
            strict_ordering: false,
        }
    }
}

impl ClaimPolicy {
    pub fn lease_expiry(&self, now: OffsetDateTime) -> OffsetDateTime {
        now + self.lease_timeout
    }

    /// Effective per-subscription in-flight limit.
    pub fn in_flight_limit(&self) -> Option<u32> {
        if self.strict_ordering {
            Some(1)
        } else {
            self.max_in_flight_per_subscription
        }
    }
}

/// Durable queue of pending deliveries.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Add a task. Returns `false` without changes if a task for the same
    /// event and subscription already exists.
    async fn enqueue(&self, task: &DeliveryTask) -> Result<bool, StorageError>;

    /// Atomically claim the next ready task, ordered by `occurred_at`.
    ///
    /// The returned task is `in_flight` with a fresh lease token.
    async fn claim_ready(
        &self,
        now: OffsetDateTime,
        policy: &ClaimPolicy,
    ) -> Result<Option<DeliveryTask>, StorageError>;

    /// Return a claimed task to `pending` until `next_attempt_at`. Persists
    /// the task's `attempt_count` and `last_error`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LeaseLost` if `task.lease_token` no longer
    /// matches the stored claim.
    async fn requeue(
        &self,
        task: &DeliveryTask,
        next_attempt_at: OffsetDateTime,
    ) -> Result<(), StorageError>;

    /// Move a claimed task into a terminal state.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LeaseLost` on a stale lease token and
    /// `StorageError::InvalidTransition` if `state` is not terminal.
    async fn retire(&self, task: &DeliveryTask, state: TaskState) -> Result<(), StorageError>;

    /// Return tasks whose lease expired before `now` to `pending`.
    async fn release_expired(&self, now: OffsetDateTime) -> Result<u64, StorageError>;

    async fn get(&self, id: TaskId) -> Result<Option<DeliveryTask>, StorageError>;

    async fn stats(&self) -> Result<QueueStats, StorageError>;
}

/// Append-only record of delivery attempts.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError::DuplicateSuccess` if `attempt` is a success and
    /// one is already recorded for the same event and subscription.
    async fn append(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError>;

    /// Attempts for one event and subscription, in append order.
    async fn history(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<DeliveryAttempt>, StorageError>;

    /// Attempts for one event across all subscriptions, in append order.
    async fn attempts_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>, StorageError>;

    async fn has_success(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
    ) -> Result<bool, StorageError>;

    async fn health(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<SubscriptionHealth, StorageError>;
}
