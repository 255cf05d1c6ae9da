//! Webhook dispatch pipeline for carehook.
//!
//! - [`bus`]: event intake and fan-out into the delivery queue
//! - [`registry`]: subscription administration and the resolution snapshot
//! - [`dispatcher`]: signed HTTP delivery with retry and backoff
//! - [`service`]: wiring of the three over one backend

pub mod bus;
pub mod dispatcher;
pub mod registry;
pub mod service;

pub use bus::{EventBus, IntakeConfig};
pub use dispatcher::{
    Classification, DispatchSummary, Dispatcher, DispatcherConfig, Disposition, classify_status,
};
pub use registry::{RegistryConfig, RegistrySnapshot, SubscriptionRegistry};
pub use service::{PipelineConfig, WebhookService};
