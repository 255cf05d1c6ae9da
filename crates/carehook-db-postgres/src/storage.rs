//! PostgreSQL implementation of the carehook stores.
//!
//! One [`PostgresStorage`] value backs all four traits. Claims use
//! `SELECT ... FOR UPDATE SKIP LOCKED`, so any number of dispatcher
//! processes can share the queue.

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_postgres::{PgPool, PgRow};
use time::OffsetDateTime;
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use carehook_core::{
    DeliveryAttempt, DeliveryOutcome, DeliveryTask, Event, EventId, EventTypeFilter, QueueStats,
    RetryPolicy, Subscription, SubscriptionHealth, SubscriptionId, TaskId, TaskState,
};
use carehook_storage::{
    ClaimPolicy, DeliveryLedger, DeliveryQueue, EventStore, StorageError, SubscriptionStore,
};

use crate::config::PostgresConfig;
use crate::error::{is_unique_violation, query_error};
use crate::pool::{create_pool, ping};
use crate::schema::ensure_schema;

const TASK_COLUMNS: &str = "id, event_id, subscription_id, event_type, occurred_at, \
     next_attempt_at, attempt_count, state, lease_token, lease_expires_at, last_error, created_at";

const ATTEMPT_COLUMNS: &str = "id, event_id, subscription_id, attempt_number, sent_at, \
     response_status, latency_ms, outcome, reason";

const CLAIM_SQL: &str = r#"
    WITH leased AS (
        SELECT subscription_id, COUNT(*) AS n
        FROM hook_delivery_tasks
        WHERE state = 'in_flight' AND lease_expires_at > $1
        GROUP BY subscription_id
    ),
    heads AS (
        SELECT DISTINCT ON (subscription_id) id
        FROM hook_delivery_tasks
        WHERE state IN ('pending', 'in_flight')
        ORDER BY subscription_id, occurred_at, seq
    ),
    candidate AS (
        SELECT t.id
        FROM hook_delivery_tasks t
        LEFT JOIN leased l ON l.subscription_id = t.subscription_id
        WHERE ((t.state = 'pending' AND t.next_attempt_at <= $1)
               OR (t.state = 'in_flight' AND t.lease_expires_at <= $1))
          AND ($2::INT IS NULL OR COALESCE(l.n, 0) < $2::INT)
          AND (NOT $3 OR t.id IN (SELECT id FROM heads))
        ORDER BY t.occurred_at, t.seq
        LIMIT 1
        FOR UPDATE OF t SKIP LOCKED
    )
    UPDATE hook_delivery_tasks
    SET state = 'in_flight', lease_token = $4, lease_expires_at = $5
    FROM candidate
    WHERE hook_delivery_tasks.id = candidate.id
    RETURNING hook_delivery_tasks.id, hook_delivery_tasks.event_id,
        hook_delivery_tasks.subscription_id, hook_delivery_tasks.event_type,
        hook_delivery_tasks.occurred_at, hook_delivery_tasks.next_attempt_at,
        hook_delivery_tasks.attempt_count, hook_delivery_tasks.state,
        hook_delivery_tasks.lease_token, hook_delivery_tasks.lease_expires_at,
        hook_delivery_tasks.last_error, hook_delivery_tasks.created_at
"#;

/// PostgreSQL-backed event store, subscription store, delivery queue and
/// delivery ledger.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Wrap an existing pool. Tables must already exist.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pool from `config` and, if enabled, the carehook tables.
    pub async fn connect(config: &PostgresConfig) -> crate::error::Result<Self> {
        let pool = create_pool(config).await?;
        if config.run_migrations {
            ensure_schema(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip time of a trivial query.
    pub async fn ping(&self) -> crate::error::Result<std::time::Duration> {
        ping(&self.pool).await
    }

    fn row_to_event(row: &PgRow) -> Result<Event, StorageError> {
        let id: Uuid = row.try_get("id").map_err(query_error)?;
        Ok(Event {
            id: EventId::from_uuid(id),
            event_type: row.try_get("event_type").map_err(query_error)?,
            payload: row.try_get("payload").map_err(query_error)?,
            occurred_at: row.try_get("occurred_at").map_err(query_error)?,
            recorded_at: row.try_get("recorded_at").map_err(query_error)?,
        })
    }

    fn row_to_subscription(row: &PgRow) -> Result<Subscription, StorageError> {
        let id: Uuid = row.try_get("id").map_err(query_error)?;
        let filter: String = row.try_get("event_type_filter").map_err(query_error)?;
        let target_url: String = row.try_get("target_url").map_err(query_error)?;
        let retry_policy: serde_json::Value = row.try_get("retry_policy").map_err(query_error)?;

        Ok(Subscription {
            id: SubscriptionId::from_uuid(id),
            event_type_filter: EventTypeFilter::parse(&filter)
                .map_err(|e| StorageError::serialization(e.to_string()))?,
            target_url: Url::parse(&target_url)
                .map_err(|e| StorageError::serialization(e.to_string()))?,
            signing_secret: row.try_get("signing_secret").map_err(query_error)?,
            retry_policy: serde_json::from_value::<RetryPolicy>(retry_policy)
                .map_err(|e| StorageError::serialization(e.to_string()))?,
            active: row.try_get("active").map_err(query_error)?,
            description: row.try_get("description").map_err(query_error)?,
            created_at: row.try_get("created_at").map_err(query_error)?,
            updated_at: row.try_get("updated_at").map_err(query_error)?,
        })
    }

    fn row_to_task(row: &PgRow) -> Result<DeliveryTask, StorageError> {
        let id: Uuid = row.try_get("id").map_err(query_error)?;
        let event_id: Uuid = row.try_get("event_id").map_err(query_error)?;
        let subscription_id: Uuid = row.try_get("subscription_id").map_err(query_error)?;
        let attempt_count: i32 = row.try_get("attempt_count").map_err(query_error)?;
        let state: String = row.try_get("state").map_err(query_error)?;

        Ok(DeliveryTask {
            id: TaskId::from_uuid(id),
            event_id: EventId::from_uuid(event_id),
            subscription_id: SubscriptionId::from_uuid(subscription_id),
            event_type: row.try_get("event_type").map_err(query_error)?,
            occurred_at: row.try_get("occurred_at").map_err(query_error)?,
            next_attempt_at: row.try_get("next_attempt_at").map_err(query_error)?,
            attempt_count: attempt_count.max(0) as u32,
            state: state.parse().map_err(StorageError::serialization)?,
            lease_token: row.try_get("lease_token").map_err(query_error)?,
            lease_expires_at: row.try_get("lease_expires_at").map_err(query_error)?,
            last_error: row.try_get("last_error").map_err(query_error)?,
            created_at: row.try_get("created_at").map_err(query_error)?,
        })
    }

    fn row_to_attempt(row: &PgRow) -> Result<DeliveryAttempt, StorageError> {
        let event_id: Uuid = row.try_get("event_id").map_err(query_error)?;
        let subscription_id: Uuid = row.try_get("subscription_id").map_err(query_error)?;
        let attempt_number: i32 = row.try_get("attempt_number").map_err(query_error)?;
        let response_status: Option<i32> = row.try_get("response_status").map_err(query_error)?;
        let latency_ms: i64 = row.try_get("latency_ms").map_err(query_error)?;
        let outcome: String = row.try_get("outcome").map_err(query_error)?;

        Ok(DeliveryAttempt {
            id: row.try_get("id").map_err(query_error)?,
            event_id: EventId::from_uuid(event_id),
            subscription_id: SubscriptionId::from_uuid(subscription_id),
            attempt_number: attempt_number.max(0) as u32,
            sent_at: row.try_get("sent_at").map_err(query_error)?,
            response_status: response_status.and_then(|s| u16::try_from(s).ok()),
            latency_ms: latency_ms.max(0) as u64,
            outcome: outcome
                .parse::<DeliveryOutcome>()
                .map_err(StorageError::serialization)?,
            reason: row.try_get("reason").map_err(query_error)?,
        })
    }

    fn retry_policy_json(subscription: &Subscription) -> Result<serde_json::Value, StorageError> {
        serde_json::to_value(&subscription.retry_policy)
            .map_err(|e| StorageError::serialization(e.to_string()))
    }
}

impl std::fmt::Debug for PostgresStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStorage")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

#[async_trait]
impl EventStore for PostgresStorage {
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    async fn record(&self, event: &Event) -> Result<(), StorageError> {
        query(
            r#"
            INSERT INTO hook_events (id, event_type, payload, occurred_at, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(&event.event_type)
        .bind(event.payload.clone())
        .bind(event.occurred_at)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::already_exists("Event", event.id)
            } else {
                query_error(e)
            }
        })?;
        Ok(())
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>, StorageError> {
        let row: Option<PgRow> = query(
            "SELECT id, event_type, payload, occurred_at, recorded_at FROM hook_events WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;
        row.as_ref().map(Self::row_to_event).transpose()
    }

    async fn unresolved(&self, limit: usize) -> Result<Vec<Event>, StorageError> {
        let rows: Vec<PgRow> = query(
            r#"
            SELECT id, event_type, payload, occurred_at, recorded_at
            FROM hook_events
            WHERE NOT fanned_out
            ORDER BY recorded_at, id
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn mark_resolved(&self, id: EventId) -> Result<(), StorageError> {
        let result = query("UPDATE hook_events SET fanned_out = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("Event", id));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for PostgresStorage {
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.id))]
    async fn insert(&self, subscription: &Subscription) -> Result<(), StorageError> {
        query(
            r#"
            INSERT INTO hook_subscriptions (
                id, event_type_filter, target_url, signing_secret, retry_policy,
                active, description, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(subscription.id.as_uuid())
        .bind(subscription.event_type_filter.to_string())
        .bind(subscription.target_url.as_str())
        .bind(&subscription.signing_secret)
        .bind(Self::retry_policy_json(subscription)?)
        .bind(subscription.active)
        .bind(&subscription.description)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::already_exists("Subscription", subscription.id)
            } else {
                query_error(e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.id))]
    async fn update(&self, subscription: &Subscription) -> Result<(), StorageError> {
        let result = query(
            r#"
            UPDATE hook_subscriptions
            SET event_type_filter = $2, target_url = $3, signing_secret = $4,
                retry_policy = $5, active = $6, description = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(subscription.id.as_uuid())
        .bind(subscription.event_type_filter.to_string())
        .bind(subscription.target_url.as_str())
        .bind(&subscription.signing_secret)
        .bind(Self::retry_policy_json(subscription)?)
        .bind(subscription.active)
        .bind(&subscription.description)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("Subscription", subscription.id));
        }
        Ok(())
    }

    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>, StorageError> {
        let row: Option<PgRow> = query("SELECT * FROM hook_subscriptions WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        row.as_ref().map(Self::row_to_subscription).transpose()
    }

    async fn list(&self) -> Result<Vec<Subscription>, StorageError> {
        let rows: Vec<PgRow> = query("SELECT * FROM hook_subscriptions ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        rows.iter().map(Self::row_to_subscription).collect()
    }
}

#[async_trait]
impl DeliveryQueue for PostgresStorage {
    async fn enqueue(&self, task: &DeliveryTask) -> Result<bool, StorageError> {
        let result = query(
            r#"
            INSERT INTO hook_delivery_tasks (
                id, event_id, subscription_id, event_type, occurred_at, next_attempt_at,
                attempt_count, state, last_error, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (event_id, subscription_id) DO NOTHING
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.event_id.as_uuid())
        .bind(task.subscription_id.as_uuid())
        .bind(&task.event_type)
        .bind(task.occurred_at)
        .bind(task.next_attempt_at)
        .bind(task.attempt_count as i32)
        .bind(task.state.as_str())
        .bind(&task.last_error)
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, policy))]
    async fn claim_ready(
        &self,
        now: OffsetDateTime,
        policy: &ClaimPolicy,
    ) -> Result<Option<DeliveryTask>, StorageError> {
        let limit = policy
            .in_flight_limit()
            .map(|n| i32::try_from(n).unwrap_or(i32::MAX));
        let row: Option<PgRow> = query(CLAIM_SQL)
            .bind(now)
            .bind(limit)
            .bind(policy.strict_ordering)
            .bind(Uuid::new_v4())
            .bind(policy.lease_expiry(now))
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        let task = row.as_ref().map(Self::row_to_task).transpose()?;
        if let Some(task) = &task {
            debug!(task_id = %task.id, subscription_id = %task.subscription_id, "claimed task");
        }
        Ok(task)
    }

    async fn requeue(
        &self,
        task: &DeliveryTask,
        next_attempt_at: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let result = query(
            r#"
            UPDATE hook_delivery_tasks
            SET state = 'pending', attempt_count = $3, last_error = $4, next_attempt_at = $5,
                lease_token = NULL, lease_expires_at = NULL
            WHERE id = $1 AND state = 'in_flight' AND lease_token = $2
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.lease_token)
        .bind(task.attempt_count as i32)
        .bind(&task.last_error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::lease_lost(task.id));
        }
        Ok(())
    }

    async fn retire(&self, task: &DeliveryTask, state: TaskState) -> Result<(), StorageError> {
        if !state.is_terminal() {
            return Err(StorageError::invalid_transition(format!(
                "cannot retire task {} into {state}",
                task.id
            )));
        }
        let result = query(
            r#"
            UPDATE hook_delivery_tasks
            SET state = $3, attempt_count = $4, last_error = $5,
                lease_token = NULL, lease_expires_at = NULL
            WHERE id = $1 AND state = 'in_flight' AND lease_token = $2
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.lease_token)
        .bind(state.as_str())
        .bind(task.attempt_count as i32)
        .bind(&task.last_error)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::lease_lost(task.id));
        }
        Ok(())
    }

    async fn release_expired(&self, now: OffsetDateTime) -> Result<u64, StorageError> {
        let result = query(
            r#"
            UPDATE hook_delivery_tasks
            SET state = 'pending', lease_token = NULL, lease_expires_at = NULL
            WHERE state = 'in_flight' AND lease_expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: TaskId) -> Result<Option<DeliveryTask>, StorageError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM hook_delivery_tasks WHERE id = $1");
        let row: Option<PgRow> = query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn stats(&self) -> Result<QueueStats, StorageError> {
        let rows: Vec<PgRow> =
            query("SELECT state, COUNT(*) AS n FROM hook_delivery_tasks GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(query_error)?;
        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(query_error)?;
            let n: i64 = row.try_get("n").map_err(query_error)?;
            let n = n.max(0) as u64;
            match state.parse::<TaskState>().map_err(StorageError::serialization)? {
                TaskState::Pending => stats.pending = n,
                TaskState::InFlight => stats.in_flight = n,
                TaskState::Succeeded => stats.succeeded = n,
                TaskState::FailedTerminal => stats.failed_terminal = n,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl DeliveryLedger for PostgresStorage {
    #[instrument(skip(self, attempt), fields(event_id = %attempt.event_id, subscription_id = %attempt.subscription_id))]
    async fn append(&self, attempt: &DeliveryAttempt) -> Result<(), StorageError> {
        query(
            r#"
            INSERT INTO hook_delivery_attempts (
                id, event_id, subscription_id, attempt_number, sent_at,
                response_status, latency_ms, outcome, reason
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.event_id.as_uuid())
        .bind(attempt.subscription_id.as_uuid())
        .bind(attempt.attempt_number as i32)
        .bind(attempt.sent_at)
        .bind(attempt.response_status.map(i32::from))
        .bind(i64::try_from(attempt.latency_ms).unwrap_or(i64::MAX))
        .bind(attempt.outcome.as_str())
        .bind(&attempt.reason)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if attempt.outcome == DeliveryOutcome::Success && is_unique_violation(&e) {
                StorageError::DuplicateSuccess {
                    event_id: attempt.event_id.to_string(),
                    subscription_id: attempt.subscription_id.to_string(),
                }
            } else {
                query_error(e)
            }
        })?;
        Ok(())
    }

    async fn history(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<DeliveryAttempt>, StorageError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM hook_delivery_attempts \
             WHERE event_id = $1 AND subscription_id = $2 ORDER BY seq"
        );
        let rows: Vec<PgRow> = query(&sql)
            .bind(event_id.as_uuid())
            .bind(subscription_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn attempts_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>, StorageError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM hook_delivery_attempts WHERE event_id = $1 ORDER BY seq"
        );
        let rows: Vec<PgRow> = query(&sql)
            .bind(event_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn has_success(
        &self,
        event_id: EventId,
        subscription_id: SubscriptionId,
    ) -> Result<bool, StorageError> {
        let row: Option<PgRow> = query(
            r#"
            SELECT 1 AS found FROM hook_delivery_attempts
            WHERE event_id = $1 AND subscription_id = $2 AND outcome = 'success'
            LIMIT 1
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(subscription_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(row.is_some())
    }

    async fn health(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<SubscriptionHealth, StorageError> {
        let row: PgRow = query(
            r#"
            SELECT
                COUNT(*) AS attempts,
                COUNT(*) FILTER (WHERE outcome = 'success') AS successes,
                COUNT(*) FILTER (WHERE outcome IN ('failed_retryable', 'failed_terminal')) AS failures,
                COALESCE(AVG(latency_ms), 0)::FLOAT8 AS average_latency_ms
            FROM hook_delivery_attempts
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(query_error)?;

        let attempts: i64 = row.try_get("attempts").map_err(query_error)?;
        let successes: i64 = row.try_get("successes").map_err(query_error)?;
        let failures: i64 = row.try_get("failures").map_err(query_error)?;
        let average_latency_ms: f64 = row.try_get("average_latency_ms").map_err(query_error)?;

        let attempts = attempts.max(0) as u64;
        let successes = successes.max(0) as u64;
        Ok(SubscriptionHealth {
            attempts,
            successes,
            failures: failures.max(0) as u64,
            success_rate: if attempts > 0 {
                successes as f64 / attempts as f64
            } else {
                0.0
            },
            average_latency_ms,
        })
    }
}
