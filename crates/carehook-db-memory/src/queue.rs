use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

use carehook_core::{DeliveryTask, EventId, QueueStats, SubscriptionId, TaskId, TaskState};
use carehook_storage::{ClaimPolicy, DeliveryQueue, StorageError};

/// Claim order key: `(occurred_at, enqueue sequence, task id)`.
type OrderKey = (OffsetDateTime, u64, TaskId);

#[derive(Debug, Default)]
struct QueueInner {
    tasks: HashMap<TaskId, DeliveryTask>,
    by_key: HashMap<(EventId, SubscriptionId), TaskId>,
    /// Enqueue sequence of unfinished tasks.
    seq: HashMap<TaskId, u64>,
    /// Unfinished tasks in claim order. Terminal tasks are dropped from here.
    open: BTreeSet<OrderKey>,
    /// Lease expiry of every in-flight task, per subscription.
    leases: HashMap<SubscriptionId, HashMap<TaskId, OffsetDateTime>>,
    next_seq: u64,
}

impl QueueInner {
    /// In-flight tasks of `subscription` whose lease is still live at `now`.
    fn leased_count(&self, subscription: SubscriptionId, now: OffsetDateTime) -> u32 {
        self.leases.get(&subscription).map_or(0, |leases| {
            leases.values().filter(|expires| **expires > now).count() as u32
        })
    }

    fn take_lease(&mut self, task: &DeliveryTask) {
        if let Some(expires) = task.lease_expires_at {
            self.leases
                .entry(task.subscription_id)
                .or_default()
                .insert(task.id, expires);
        }
    }

    fn drop_lease(&mut self, subscription: SubscriptionId, id: TaskId) {
        if let Some(leases) = self.leases.get_mut(&subscription) {
            leases.remove(&id);
            if leases.is_empty() {
                self.leases.remove(&subscription);
            }
        }
    }

    fn next_claimable(&self, now: OffsetDateTime, policy: &ClaimPolicy) -> Option<TaskId> {
        let limit = policy.in_flight_limit();
        let mut heads: HashSet<SubscriptionId> = HashSet::new();

        for (_, _, id) in &self.open {
            let Some(task) = self.tasks.get(id) else {
                continue;
            };
            // Only the earliest unfinished task of a subscription is eligible.
            if policy.strict_ordering && !heads.insert(task.subscription_id) {
                continue;
            }
            if !task.is_ready(now) {
                continue;
            }
            if let Some(limit) = limit
                && self.leased_count(task.subscription_id, now) >= limit
            {
                continue;
            }
            return Some(*id);
        }
        None
    }

    /// Look up a task and check the caller still holds its lease.
    fn leased_task_mut(&mut self, task: &DeliveryTask) -> Result<&mut DeliveryTask, StorageError> {
        let stored = self
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StorageError::not_found("DeliveryTask", task.id))?;
        if stored.state != TaskState::InFlight
            || stored.lease_token.is_none()
            || stored.lease_token != task.lease_token
        {
            return Err(StorageError::lease_lost(task.id));
        }
        Ok(stored)
    }
}

/// In-memory delivery queue.
///
/// One mutex guards all state, which makes `claim_ready` atomic with respect
/// to concurrent workers.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    inner: Mutex<QueueInner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().tasks.is_empty()
    }

    /// Snapshot of every task, in claim order for unfinished ones first.
    pub fn snapshot(&self) -> Vec<DeliveryTask> {
        let inner = self.inner.lock();
        let mut out: Vec<DeliveryTask> = inner
            .open
            .iter()
            .filter_map(|(_, _, id)| inner.tasks.get(id).cloned())
            .collect();
        out.extend(
            inner
                .tasks
                .values()
                .filter(|t| t.state.is_terminal())
                .cloned(),
        );
        out
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryQueue {
    async fn enqueue(&self, task: &DeliveryTask) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        if inner.by_key.contains_key(&task.key()) {
            return Ok(false);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.by_key.insert(task.key(), task.id);
        inner.seq.insert(task.id, seq);
        if !task.state.is_terminal() {
            inner.open.insert((task.occurred_at, seq, task.id));
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(true)
    }

    async fn claim_ready(
        &self,
        now: OffsetDateTime,
        policy: &ClaimPolicy,
    ) -> Result<Option<DeliveryTask>, StorageError> {
        let mut inner = self.inner.lock();
        let Some(id) = inner.next_claimable(now, policy) else {
            return Ok(None);
        };
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(None);
        };
        if task.state == TaskState::InFlight {
            tracing::debug!(task_id = %task.id, "reclaiming task with expired lease");
        }
        task.state = TaskState::InFlight;
        task.lease_token = Some(Uuid::new_v4());
        task.lease_expires_at = Some(policy.lease_expiry(now));
        let claimed = task.clone();
        inner.take_lease(&claimed);
        Ok(Some(claimed))
    }

    async fn requeue(
        &self,
        task: &DeliveryTask,
        next_attempt_at: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let stored = inner.leased_task_mut(task)?;
        stored.state = TaskState::Pending;
        stored.attempt_count = task.attempt_count;
        stored.last_error = task.last_error.clone();
        stored.next_attempt_at = next_attempt_at;
        stored.lease_token = None;
        stored.lease_expires_at = None;
        inner.drop_lease(task.subscription_id, task.id);
        Ok(())
    }

    async fn retire(&self, task: &DeliveryTask, state: TaskState) -> Result<(), StorageError> {
        if !state.is_terminal() {
            return Err(StorageError::invalid_transition(format!(
                "cannot retire task {} into {state}",
                task.id
            )));
        }
        let mut inner = self.inner.lock();
        let stored = inner.leased_task_mut(task)?;
        stored.state = state;
        stored.attempt_count = task.attempt_count;
        stored.last_error = task.last_error.clone();
        stored.lease_token = None;
        stored.lease_expires_at = None;
        let occurred_at = stored.occurred_at;
        if let Some(seq) = inner.seq.remove(&task.id) {
            inner.open.remove(&(occurred_at, seq, task.id));
        }
        inner.drop_lease(task.subscription_id, task.id);
        Ok(())
    }

    async fn release_expired(&self, now: OffsetDateTime) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();
        let expired: Vec<(SubscriptionId, TaskId)> = inner
            .leases
            .iter()
            .flat_map(|(subscription, leases)| {
                leases
                    .iter()
                    .filter(|(_, expires)| **expires <= now)
                    .map(|(id, _)| (*subscription, *id))
            })
            .collect();

        for (subscription, id) in &expired {
            if let Some(task) = inner.tasks.get_mut(id) {
                task.state = TaskState::Pending;
                task.lease_token = None;
                task.lease_expires_at = None;
            }
            inner.drop_lease(*subscription, *id);
        }
        Ok(expired.len() as u64)
    }

    async fn get(&self, id: TaskId) -> Result<Option<DeliveryTask>, StorageError> {
        Ok(self.inner.lock().tasks.get(&id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats, StorageError> {
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();
        for task in inner.tasks.values() {
            stats.record(task.state);
        }
        Ok(stats)
    }
}
