//! Delivery tasks, attempts and their states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::event::Event;
use crate::id::{EventId, SubscriptionId, TaskId};
use crate::subscription::Subscription;

/// Outcome recorded for a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Pending,
    Success,
    FailedRetryable,
    FailedTerminal,
    /// Receiver acknowledged again after a success was already recorded
    /// for the same event and subscription.
    Duplicate,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
            Self::Duplicate => "duplicate",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::FailedRetryable | Self::FailedTerminal)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed_retryable" => Ok(Self::FailedRetryable),
            "failed_terminal" => Ok(Self::FailedTerminal),
            "duplicate" => Ok(Self::Duplicate),
            other => Err(format!("unknown delivery outcome: {other}")),
        }
    }
}

/// One row of the delivery ledger. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub event_id: EventId,
    pub subscription_id: SubscriptionId,
    pub attempt_number: u32,

    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,

    /// `None` when no HTTP response was received.
    pub response_status: Option<u16>,

    pub latency_ms: u64,
    pub outcome: DeliveryOutcome,
    pub reason: Option<String>,
}

impl DeliveryAttempt {
    pub fn new(
        task: &DeliveryTask,
        attempt_number: u32,
        sent_at: OffsetDateTime,
        outcome: DeliveryOutcome,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_id: task.event_id,
            subscription_id: task.subscription_id,
            attempt_number,
            sent_at,
            response_status: None,
            latency_ms: 0,
            outcome,
            reason: None,
        }
    }

    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.response_status = status;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// State machine of a queued delivery.
///
/// ```text
/// pending --claim--> in_flight --requeue--> pending
///                        |  \--retire--> succeeded | failed_terminal
///                        \--lease expiry--> pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Succeeded,
    FailedTerminal,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::FailedTerminal => "failed_terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "succeeded" => Ok(Self::Succeeded),
            "failed_terminal" => Ok(Self::FailedTerminal),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Unit of work in the delivery queue: one event for one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub id: TaskId,
    pub event_id: EventId,
    pub subscription_id: SubscriptionId,
    pub event_type: String,

    /// Copied from the event so the queue can order without a join.
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,

    #[serde(with = "time::serde::rfc3339")]
    pub next_attempt_at: OffsetDateTime,

    /// Attempts already made.
    pub attempt_count: u32,

    pub state: TaskState,

    /// Token of the current claim; acknowledgements must present it.
    pub lease_token: Option<Uuid>,

    #[serde(with = "time::serde::rfc3339::option")]
    pub lease_expires_at: Option<OffsetDateTime>,

    pub last_error: Option<String>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl DeliveryTask {
    /// A fresh task, ready immediately.
    pub fn new(event: &Event, subscription: &Subscription) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: TaskId::new(),
            event_id: event.id,
            subscription_id: subscription.id,
            event_type: event.event_type.clone(),
            occurred_at: event.occurred_at,
            next_attempt_at: now,
            attempt_count: 0,
            state: TaskState::Pending,
            lease_token: None,
            lease_expires_at: None,
            last_error: None,
            created_at: now,
        }
    }

    /// Idempotency key of the delivery.
    pub fn key(&self) -> (EventId, SubscriptionId) {
        (self.event_id, self.subscription_id)
    }

    /// Whether the task may be claimed at `now`, including expired leases.
    pub fn is_ready(&self, now: OffsetDateTime) -> bool {
        match self.state {
            TaskState::Pending => self.next_attempt_at <= now,
            TaskState::InFlight => self.lease_expires_at.is_some_and(|at| at <= now),
            TaskState::Succeeded | TaskState::FailedTerminal => false,
        }
    }

    /// Whether the task holds an unexpired lease at `now`.
    pub fn is_leased(&self, now: OffsetDateTime) -> bool {
        self.state == TaskState::InFlight && self.lease_expires_at.is_some_and(|at| at > now)
    }
}

/// Task counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed_terminal: u64,
}

impl QueueStats {
    pub fn record(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::InFlight => self.in_flight += 1,
            TaskState::Succeeded => self.succeeded += 1,
            TaskState::FailedTerminal => self.failed_terminal += 1,
        }
    }
}

/// Aggregate delivery health of one subscription, derived from the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionHealth {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Successes over attempts, 0.0 when there were no attempts.
    pub success_rate: f64,
    pub average_latency_ms: f64,
}

impl SubscriptionHealth {
    /// Fold ledger rows into health figures.
    pub fn from_attempts<'a>(attempts: impl IntoIterator<Item = &'a DeliveryAttempt>) -> Self {
        let mut health = Self::default();
        let mut latency_total = 0u64;
        for attempt in attempts {
            health.attempts += 1;
            latency_total += attempt.latency_ms;
            match attempt.outcome {
                DeliveryOutcome::Success => health.successes += 1,
                outcome if outcome.is_failure() => health.failures += 1,
                _ => {}
            }
        }
        if health.attempts > 0 {
            health.success_rate = health.successes as f64 / health.attempts as f64;
            health.average_latency_ms = latency_total as f64 / health.attempts as f64;
        }
        health
    }
}
