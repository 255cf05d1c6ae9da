//! Table creation for the carehook schema.

use sqlx_postgres::PgPool;
use tracing::{info, instrument};

use crate::error::{PostgresError, Result};

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS hook_events (
        id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL,
        fanned_out BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_hook_events_unresolved
        ON hook_events(recorded_at, id) WHERE NOT fanned_out
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hook_subscriptions (
        id UUID PRIMARY KEY,
        event_type_filter TEXT NOT NULL,
        target_url TEXT NOT NULL,
        signing_secret TEXT NOT NULL,
        retry_policy JSONB NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        description TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hook_delivery_tasks (
        id UUID PRIMARY KEY,
        seq BIGSERIAL NOT NULL,
        event_id UUID NOT NULL REFERENCES hook_events(id),
        subscription_id UUID NOT NULL REFERENCES hook_subscriptions(id),
        event_type TEXT NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        next_attempt_at TIMESTAMPTZ NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        state TEXT NOT NULL DEFAULT 'pending',
        lease_token UUID,
        lease_expires_at TIMESTAMPTZ,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (event_id, subscription_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_hook_tasks_open
        ON hook_delivery_tasks(occurred_at, seq) WHERE state IN ('pending', 'in_flight')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_hook_tasks_subscription
        ON hook_delivery_tasks(subscription_id, occurred_at, seq)
        WHERE state IN ('pending', 'in_flight')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hook_delivery_attempts (
        id UUID PRIMARY KEY,
        seq BIGSERIAL NOT NULL,
        event_id UUID NOT NULL,
        subscription_id UUID NOT NULL,
        attempt_number INTEGER NOT NULL,
        sent_at TIMESTAMPTZ NOT NULL,
        response_status INTEGER,
        latency_ms BIGINT NOT NULL,
        outcome TEXT NOT NULL,
        reason TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_hook_attempts_pair
        ON hook_delivery_attempts(event_id, subscription_id, seq)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_hook_attempts_subscription
        ON hook_delivery_attempts(subscription_id)
    "#,
    // At most one success per event and subscription.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_hook_attempts_success
        ON hook_delivery_attempts(event_id, subscription_id) WHERE outcome = 'success'
    "#,
];

/// Create every carehook table and index that does not exist yet.
#[instrument(skip(pool))]
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx_core::query::query(*statement)
            .execute(pool)
            .await
            .map_err(|e| PostgresError::Migration(e.to_string()))?;
    }
    info!("carehook tables ready");
    Ok(())
}
