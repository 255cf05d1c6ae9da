use carehook_core::RetryPolicy;
use carehook_db_postgres::PostgresConfig;
use carehook_dispatch::{DispatcherConfig, IntakeConfig, PipelineConfig, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Retry policy for subscriptions created without one
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        // Storage validation
        if self.storage.backend == StorageBackend::Postgres {
            let Some(pg) = &self.storage.postgres else {
                return Err("storage.backend=postgres requires [storage.postgres]".into());
            };
            if pg.url.trim().is_empty() {
                return Err("storage.postgres.url must not be empty".into());
            }
            if pg.pool_size == 0 {
                return Err("storage.postgres.pool_size must be > 0".into());
            }
        }
        // Intake validations
        if self.intake.max_payload_bytes == 0 {
            return Err("intake.max_payload_bytes must be > 0".into());
        }
        if self.intake.max_payload_bytes > self.server.body_limit_bytes {
            return Err("intake.max_payload_bytes must be <= server.body_limit_bytes".into());
        }
        if self.intake.resolve_batch_size == 0 {
            return Err("intake.resolve_batch_size must be > 0".into());
        }
        if self.registry.refresh_interval_ms == 0 {
            return Err("registry.refresh_interval_ms must be > 0".into());
        }
        // Dispatcher validations
        let d = &self.dispatcher;
        if d.concurrency == 0 {
            return Err("dispatcher.concurrency must be > 0".into());
        }
        if d.poll_interval_ms == 0 || d.lease_sweep_interval_ms == 0 {
            return Err("dispatcher intervals must be > 0".into());
        }
        if d.request_timeout_ms == 0 || d.connect_timeout_ms == 0 {
            return Err("dispatcher timeouts must be > 0".into());
        }
        if d.lease_timeout_ms <= d.request_timeout_ms {
            return Err("dispatcher.lease_timeout_ms must be > dispatcher.request_timeout_ms".into());
        }
        if d.max_in_flight_per_subscription == Some(0) {
            return Err("dispatcher.max_in_flight_per_subscription must be > 0 when set".into());
        }
        // Retry defaults
        self.retry
            .validate()
            .map_err(|e| format!("retry config error: {e}"))?;
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    /// Settings for the delivery pipeline.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            intake: self.intake.clone(),
            registry: RegistryConfig {
                refresh_interval_ms: self.registry.refresh_interval_ms,
                default_retry_policy: self.retry,
            },
            dispatcher: self.dispatcher.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// Grace period for background workers after the listener stops
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_body_limit() -> usize {
    1024 * 1024
}
fn default_shutdown_grace_ms() -> u64 {
    15_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on restart. Development and tests only.
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

fn default_refresh_interval_ms() -> u64 {
    RegistryConfig::default().refresh_interval_ms
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit one JSON object per line instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::Path;

    /// Default configuration file name, looked up in the working directory.
    pub const DEFAULT_CONFIG_PATH: &str = "carehook.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = Path::new(p).to_path_buf();
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., CAREHOOK__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("CAREHOOK")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
