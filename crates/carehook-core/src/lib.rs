//! Core types for the carehook webhook dispatch subsystem.
//!
//! Producers in the hospital domain emit `(event_type, payload, occurred_at)`
//! tuples. This crate defines what those events look like once accepted, how
//! endpoints subscribe to them, how individual delivery attempts are recorded
//! and how outbound requests are signed.

pub mod delivery;
pub mod error;
pub mod event;
pub mod id;
pub mod retry;
pub mod signature;
pub mod subscription;

pub use delivery::{
    DeliveryAttempt, DeliveryOutcome, DeliveryTask, QueueStats, SubscriptionHealth, TaskState,
};
pub use error::{HookError, Result};
pub use event::{Event, NewEvent, validate_event_type};
pub use id::{EventId, SubscriptionId, TaskId};
pub use retry::RetryPolicy;
pub use signature::{SIGNATURE_HEADER, compute_signature, verify_signature};
pub use subscription::{
    EventTypeFilter, NewSubscription, Subscription, SubscriptionPatch, mask_secret,
};

/// Header carrying the event identifier on outbound deliveries.
pub const EVENT_ID_HEADER: &str = "X-Event-Id";

/// Header carrying the event type on outbound deliveries.
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";

/// Header carrying the 1-based attempt number on outbound deliveries.
pub const DELIVERY_ATTEMPT_HEADER: &str = "X-Delivery-Attempt";
