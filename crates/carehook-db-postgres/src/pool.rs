//! Connection pool management for the PostgreSQL storage backend.

use std::time::{Duration, Instant};

use sqlx_core::pool::PoolOptions;
use sqlx_postgres::{PgPool, Postgres};
use tracing::{debug, info, instrument};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, Result};

/// Type alias for PostgreSQL pool options.
pub type PgPoolOptions = PoolOptions<Postgres>;

/// Default connection lifetime when the config leaves it unset.
const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Pool options derived from `config`, without connecting.
pub fn pool_options(config: &PostgresConfig) -> Result<PgPoolOptions> {
    if config.pool_size == 0 {
        return Err(PostgresError::config("pool_size must be at least 1"));
    }

    // Keep a quarter of the pool warm unless told otherwise.
    let min_connections = config
        .min_connections
        .unwrap_or(config.pool_size / 4)
        .clamp(1, config.pool_size);

    let max_lifetime = config
        .max_lifetime_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_MAX_LIFETIME);

    Ok(PgPoolOptions::new()
        .max_connections(config.pool_size)
        .min_connections(min_connections)
        .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
        .max_lifetime(max_lifetime)
        .idle_timeout(config.idle_timeout_ms.map(Duration::from_millis))
        .test_before_acquire(false))
}

/// Connect a pool and verify the server answers before handing it out.
#[instrument(skip(config), fields(url = %mask_password(&config.url)))]
pub async fn create_pool(config: &PostgresConfig) -> Result<PgPool> {
    let options = pool_options(config)?;
    info!(
        pool_size = config.pool_size,
        connect_timeout_ms = config.connect_timeout_ms,
        "Connecting to PostgreSQL"
    );

    let pool = options.connect(&config.url).await?;
    let latency = ping(&pool).await?;
    info!(
        latency_ms = latency.as_millis() as u64,
        "PostgreSQL connection pool ready"
    );
    Ok(pool)
}

/// Round trip a trivial query. Returns how long it took.
pub async fn ping(pool: &PgPool) -> Result<Duration> {
    let start = Instant::now();
    sqlx_core::query::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(PostgresError::from)?;
    let elapsed = start.elapsed();
    debug!(elapsed_ms = elapsed.as_millis() as u64, "PostgreSQL ping");
    Ok(elapsed)
}

/// Hide the password of a connection URL for logging.
pub fn mask_password(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable database url>".to_string(),
    }
}
