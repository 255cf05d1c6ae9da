use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;

use carehook_core::{
    DeliveryAttempt, DeliveryOutcome, EventId, SubscriptionHealth, SubscriptionId,
};
use carehook_storage::{DeliveryLedger, StorageError};

#[derive(Debug, Default)]
struct LedgerInner {
    rows: Vec<DeliveryAttempt>,
    successes: HashSet<(EventId, SubscriptionId)>,
}

/// Append-only in-memory delivery ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    inner: RwLock<LedgerInner>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().rows.is_empty()
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryLedger {
    async fn append(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if attempt.outcome == DeliveryOutcome::Success
            && !inner
                .successes
                .insert((attempt.event_id, attempt.subscription_id))
        {
            return Err(StorageError::DuplicateSuccess {
                event_id: attempt.event_id.to_string(),
                subscription_id: attempt.subscription_id.to_string(),
            });
        }
        inner.rows.push(attempt.clone());
        Ok(())
    }

    async fn history(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<DeliveryAttempt>, StorageError> {
        Ok(self
            .inner
            .read()
            .rows
            .iter()
            .filter(|a| a.event_id == event_id && a.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn attempts_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>, StorageError> {
        Ok(self
            .inner
            .read()
            .rows
            .iter()
            .filter(|a| a.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn has_success(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
    ) -> Result<bool, StorageError> {
        Ok(self
            .inner
            .read()
            .successes
            .contains(&(event_id, subscription_id)))
    }

    async fn health(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<SubscriptionHealth, StorageError> {
        let inner = self.inner.read();
        Ok(SubscriptionHealth::from_attempts(
            inner
                .rows
                .iter()
                .filter(|a| a.subscription_id == subscription_id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carehook_core::{DeliveryTask, NewEvent, NewSubscription, RetryPolicy};
    use serde_json::json;
    use time::OffsetDateTime;

    fn task() -> DeliveryTask {
        let event = NewEvent::new("billing.payment_succeeded", json!({}), OffsetDateTime::now_utc())
            .into_event();
        let sub = NewSubscription::new("billing.*", "https://pay.example.com/hook", "k")
            .into_subscription(RetryPolicy::default())
            .unwrap();
        DeliveryTask::new(&event, &sub)
    }

    #[tokio::test]
    async fn test_history_in_append_order() {
        let ledger = InMemoryLedger::new();
        let t = task();
        let now = OffsetDateTime::now_utc();
        ledger
            .append(
                &DeliveryAttempt::new(&t, 1, now, DeliveryOutcome::FailedRetryable)
                    .with_status(Some(503)),
            )
            .await
            .unwrap();
        ledger
            .append(&DeliveryAttempt::new(&t, 2, now, DeliveryOutcome::Success).with_status(Some(200)))
            .await
            .unwrap();

        let rows = ledger.history(t.event_id, t.subscription_id).await.unwrap();
        assert_eq!(
            rows.iter().map(|r| r.attempt_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(ledger.has_success(t.event_id, t.subscription_id).await.unwrap());
        assert_eq!(ledger.attempts_for_event(t.event_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_success_rejected() {
        let ledger = InMemoryLedger::new();
        let t = task();
        let now = OffsetDateTime::now_utc();
        ledger
            .append(&DeliveryAttempt::new(&t, 1, now, DeliveryOutcome::Success))
            .await
            .unwrap();
        let err = ledger
            .append(&DeliveryAttempt::new(&t, 2, now, DeliveryOutcome::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateSuccess { .. }));
        assert_eq!(ledger.len(), 1);

        ledger
            .append(&DeliveryAttempt::new(&t, 2, now, DeliveryOutcome::Duplicate))
            .await
            .unwrap();
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_health_per_subscription() {
        let ledger = InMemoryLedger::new();
        let t = task();
        let other = task();
        let now = OffsetDateTime::now_utc();
        ledger
            .append(&DeliveryAttempt::new(&t, 1, now, DeliveryOutcome::FailedTerminal))
            .await
            .unwrap();
        ledger
            .append(&DeliveryAttempt::new(&other, 1, now, DeliveryOutcome::Success))
            .await
            .unwrap();
        let health = ledger.health(t.subscription_id).await.unwrap();
        assert_eq!(health.attempts, 1);
        assert_eq!(health.failures, 1);
        assert_eq!(health.success_rate, 0.0);
    }
}
