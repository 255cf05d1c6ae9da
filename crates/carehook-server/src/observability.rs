// Tracing initialization with a configurable and reloadable log level.
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

pub fn init_tracing(logging: &LoggingConfig) {
    // Prefer RUST_LOG from env, otherwise use the configured level.
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(&logging.level));

    let (reload_layer, handle) = reload::Layer::new(base_filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let (json_layer, text_layer) = if logging.json {
        (Some(fmt::layer().json().with_current_span(true)), None)
    } else {
        (None, Some(fmt::layer()))
    };

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init();
}

/// Apply a new logging level at runtime if tracing was initialized here.
/// Returns `false` when the level does not parse or no handle is installed.
pub fn apply_logging_level(level: &str) -> bool {
    let Ok(filter) = EnvFilter::try_new(level) else {
        return false;
    };
    match LOG_RELOAD_HANDLE.get() {
        Some(handle) => handle.modify(|f| *f = filter).is_ok(),
        None => false,
    }
}
