//! HTTP front end and process wiring for carehook.
//!
//! Exposes producer intake (`POST /events`), subscription administration and
//! ledger inspection over axum, and runs the delivery pipeline's background
//! workers next to the listener.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::AppConfig;
pub use error::{ApiError, ApiResult};
pub use handlers::AppState;
pub use server::{CarehookServer, build_app, open_stores};
