//! Subscription registry with a lock-free snapshot for event resolution.
//!
//! Administrative writes go straight to the [`SubscriptionStore`]; the
//! resolution path reads an immutable snapshot held behind an `ArcSwap`,
//! refreshed on an interval and after every local write. Fan-out asks for a
//! snapshot at least as new as the events it resolves via [`ensure_fresh`],
//! so writes committed by other instances are never missed.
//!
//! [`ensure_fresh`]: SubscriptionRegistry::ensure_fresh

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;

use carehook_core::{
    HookError, NewSubscription, Result, RetryPolicy, Subscription, SubscriptionId,
    SubscriptionPatch,
};
use carehook_storage::SubscriptionStore;

/// Registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Upper bound on snapshot staleness.
    pub refresh_interval_ms: u64,

    /// Applied to new subscriptions that do not carry their own policy.
    pub default_retry_policy: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 5_000,
            default_retry_policy: RetryPolicy::default(),
        }
    }
}

impl RegistryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// Immutable view of every subscription at one point in time.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    /// Ordered by `created_at`, then id.
    subscriptions: Vec<Subscription>,
    /// Taken before the store read began; every write committed earlier is
    /// included.
    pub loaded_at: OffsetDateTime,
}

impl RegistrySnapshot {
    fn new(mut subscriptions: Vec<Subscription>, loaded_at: OffsetDateTime) -> Self {
        subscriptions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Self {
            subscriptions,
            loaded_at,
        }
    }

    fn empty() -> Self {
        Self::new(Vec::new(), OffsetDateTime::UNIX_EPOCH)
    }

    /// Active subscriptions whose filter matches `event_type`, in registry order.
    pub fn resolve(&self, event_type: &str) -> Vec<&Subscription> {
        self.subscriptions
            .iter()
            .filter(|s| s.active && s.matches(event_type))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// Maps event types to the subscriptions that should receive them.
pub struct SubscriptionRegistry {
    store: Arc<dyn SubscriptionStore>,
    snapshot: ArcSwap<RegistrySnapshot>,
    config: RegistryConfig,
}

impl SubscriptionRegistry {
    /// Create a registry with an empty snapshot. Call [`refresh`] before use.
    ///
    /// [`refresh`]: Self::refresh
    pub fn new(store: Arc<dyn SubscriptionStore>, config: RegistryConfig) -> Self {
        Self {
            store,
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::empty()),
            config,
        }
    }

    /// Create a registry and load its first snapshot.
    pub async fn load(store: Arc<dyn SubscriptionStore>, config: RegistryConfig) -> Result<Self> {
        let registry = Self::new(store, config);
        registry.refresh().await?;
        Ok(registry)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Current snapshot. A single atomic load; never blocks.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Active subscriptions matching `event_type`, from the snapshot.
    pub fn resolve(&self, event_type: &str) -> Vec<Subscription> {
        self.snapshot
            .load()
            .resolve(event_type)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Reload the snapshot from the store. Returns the subscription count.
    pub async fn refresh(&self) -> Result<usize> {
        let started = OffsetDateTime::now_utc();
        let subscriptions = self.store.list().await?;
        let count = subscriptions.len();
        let fresh = Arc::new(RegistrySnapshot::new(subscriptions, started));
        // Concurrent refreshes may finish out of order; keep the newest.
        self.snapshot.rcu(|current| {
            if current.loaded_at > fresh.loaded_at {
                Arc::clone(current)
            } else {
                Arc::clone(&fresh)
            }
        });
        tracing::debug!(count, "Registry snapshot refreshed");
        Ok(count)
    }

    /// Reload unless the snapshot already covers every write committed
    /// before `since`. Returns whether a reload happened.
    pub async fn ensure_fresh(&self, since: OffsetDateTime) -> Result<bool> {
        if self.snapshot.load().loaded_at > since {
            return Ok(false);
        }
        self.refresh().await?;
        Ok(true)
    }

    /// Refresh after a local write. The write itself already succeeded, so a
    /// failed refresh only delays visibility until the next interval.
    async fn refresh_after_write(&self) {
        if let Err(e) = self.refresh().await {
            tracing::warn!(error = %e, "Failed to refresh registry after write");
        }
    }

    pub async fn create(&self, new: NewSubscription) -> Result<Subscription> {
        let subscription = new.into_subscription(self.config.default_retry_policy)?;
        self.store.insert(&subscription).await?;
        tracing::info!(
            subscription_id = %subscription.id,
            filter = %subscription.event_type_filter,
            target = %subscription.target_url,
            "Subscription created"
        );
        self.refresh_after_write().await;
        Ok(subscription)
    }

    pub async fn update(&self, id: SubscriptionId, patch: SubscriptionPatch) -> Result<Subscription> {
        let current = self.get(id).await?;
        let updated = patch.apply(&current)?;
        self.store.update(&updated).await?;
        tracing::info!(subscription_id = %id, active = updated.active, "Subscription updated");
        self.refresh_after_write().await;
        Ok(updated)
    }

    /// Stop routing new events to the subscription. Queued tasks are retired
    /// when next claimed.
    pub async fn deactivate(&self, id: SubscriptionId) -> Result<Subscription> {
        self.update(id, SubscriptionPatch::deactivate()).await
    }

    pub async fn activate(&self, id: SubscriptionId) -> Result<Subscription> {
        self.update(id, SubscriptionPatch::activate()).await
    }

    /// Administrative read from the store.
    pub async fn get(&self, id: SubscriptionId) -> Result<Subscription> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| HookError::not_found("Subscription", id))
    }

    pub async fn list(&self) -> Result<Vec<Subscription>> {
        Ok(self.store.list().await?)
    }

    /// Read-through lookup that bypasses the snapshot.
    pub async fn current(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.store.get(id).await?)
    }

    /// Refresh the snapshot every `refresh_interval` until shutdown.
    pub async fn run_refresher(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.refresh_interval_ms,
            "Starting subscription registry refresher"
        );
        let mut ticker = tokio::time::interval(self.config.refresh_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("Subscription registry refresher shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        tracing::error!(error = %e, "Failed to refresh subscription registry");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.snapshot.load().len())
            .field("config", &self.config)
            .finish()
    }
}
