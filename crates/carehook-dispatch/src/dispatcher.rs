//! Webhook dispatcher.
//!
//! Claims ready tasks from the delivery queue and performs one signed HTTP
//! POST per claim. Every attempt is appended to the ledger before the queue
//! is acknowledged, so a crash between the two leaves at most a repeated
//! attempt, never a lost one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, header, redirect};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinSet;

use carehook_core::{
    DELIVERY_ATTEMPT_HEADER, DeliveryAttempt, DeliveryOutcome, DeliveryTask, EVENT_ID_HEADER,
    EVENT_TYPE_HEADER, Event, HookError, Result, SIGNATURE_HEADER, Subscription, TaskState,
    compute_signature,
};
use carehook_storage::{ClaimPolicy, DeliveryLedger, DeliveryQueue, EventStore, StorageError, Stores};

use crate::registry::SubscriptionRegistry;

pub const REASON_SUBSCRIPTION_NOT_FOUND: &str = "subscription not found";
pub const REASON_SUBSCRIPTION_INACTIVE: &str = "subscription inactive";
pub const REASON_EVENT_NOT_FOUND: &str = "event not found";
pub const REASON_MAX_ATTEMPTS: &str = "max attempts exhausted";

/// Longest response body excerpt kept in failure reasons.
const MAX_REASON_BODY: usize = 256;

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum concurrent outbound requests.
    pub concurrency: usize,

    /// Fallback interval between queue polls.
    pub poll_interval_ms: u64,

    /// How long a claim is held before the task can be claimed again.
    pub lease_timeout_ms: u64,

    /// Hard timeout for one outbound request.
    pub request_timeout_ms: u64,

    pub connect_timeout_ms: u64,

    /// Deliver each subscription's events one at a time in `occurred_at` order.
    pub strict_ordering: bool,

    pub max_in_flight_per_subscription: Option<u32>,

    /// Interval of the expired-lease sweep.
    pub lease_sweep_interval_ms: u64,

    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            poll_interval_ms: 500,
            lease_timeout_ms: 60_000,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            strict_ordering: false,
            max_in_flight_per_subscription: None,
            lease_sweep_interval_ms: 30_000,
            user_agent: concat!("carehook/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            lease_timeout: Duration::from_millis(self.lease_timeout_ms),
            max_in_flight_per_subscription: self.max_in_flight_per_subscription,
            strict_ordering: self.strict_ordering,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// How an HTTP response or transport failure is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    Retryable,
    Terminal,
}

/// Classify a response status: 2xx succeeds, 4xx other than 429 is final,
/// everything else (429, 5xx, unexpected 1xx/3xx) is retried.
pub fn classify_status(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Success,
        429 => Classification::Retryable,
        400..=499 => Classification::Terminal,
        _ => Classification::Retryable,
    }
}

/// What happened to one claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    /// Receiver acknowledged, but a success was already recorded.
    Duplicate,
    /// Already delivered earlier; retired without sending.
    AlreadyDelivered,
    Retrying,
    Failed,
    /// The claim expired and was taken over before acknowledgement.
    LeaseLost,
}

/// Totals for one [`Dispatcher::dispatch_ready`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub claimed: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl DispatchSummary {
    fn record(&mut self, result: &Result<Disposition>) {
        match result {
            Ok(Disposition::Delivered) => self.delivered += 1,
            Ok(Disposition::Retrying) => self.retrying += 1,
            Ok(Disposition::Failed) => self.failed += 1,
            Ok(Disposition::Duplicate | Disposition::AlreadyDelivered | Disposition::LeaseLost) => {
                self.skipped += 1
            }
            Err(_) => self.errors += 1,
        }
    }
}

/// Result of one outbound request.
#[derive(Debug, Clone)]
struct SendResult {
    status: Option<u16>,
    latency_ms: u64,
    error: Option<String>,
}

impl SendResult {
    fn classification(&self) -> Classification {
        match self.status {
            Some(status) => classify_status(status),
            None => Classification::Retryable,
        }
    }

    /// The delivery error this outcome maps to, or `None` on success.
    fn into_error(self) -> Option<HookError> {
        let classification = self.classification();
        let reason = match (self.error, self.status) {
            (Some(error), _) => error,
            (None, Some(status)) if classification != Classification::Success => {
                format!("HTTP {status}")
            }
            _ => return None,
        };
        Some(match classification {
            Classification::Terminal => HookError::terminal(self.status, reason),
            _ => HookError::transient(self.status, reason),
        })
    }
}

/// Delivers queued tasks to subscriber endpoints.
pub struct Dispatcher {
    events: Arc<dyn EventStore>,
    queue: Arc<dyn DeliveryQueue>,
    ledger: Arc<dyn DeliveryLedger>,
    registry: Arc<SubscriptionRegistry>,
    client: Client,
    config: DispatcherConfig,
    claim_policy: ClaimPolicy,
    permits: Arc<Semaphore>,
    signal: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        stores: &Stores,
        registry: Arc<SubscriptionRegistry>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .redirect(redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| HookError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            events: stores.events.clone(),
            queue: stores.queue.clone(),
            ledger: stores.ledger.clone(),
            registry,
            client,
            claim_policy: config.claim_policy(),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            signal: Arc::new(Notify::new()),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Wakes the dispatch loop early when notified.
    pub fn signal(&self) -> Arc<Notify> {
        self.signal.clone()
    }

    /// Claim and process every task that is ready now, then return.
    ///
    /// Up to `concurrency` tasks are in flight at once; all of them have
    /// finished when this returns.
    pub async fn dispatch_ready(self: &Arc<Self>) -> Result<DispatchSummary> {
        self.drain(None).await
    }

    async fn drain(self: &Arc<Self>, shutdown: Option<&watch::Receiver<bool>>) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        let mut workers = JoinSet::new();
        let mut claim_error = None;

        loop {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                break;
            }
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| HookError::Internal("dispatcher semaphore closed".into()))?;

            // Reap finished workers so the set does not grow without bound.
            while let Some(joined) = workers.try_join_next() {
                record_join(&mut summary, joined);
            }

            let task = match self
                .queue
                .claim_ready(OffsetDateTime::now_utc(), &self.claim_policy)
                .await
            {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    claim_error = Some(e);
                    break;
                }
            };
            summary.claimed += 1;

            let this = Arc::clone(self);
            workers.spawn(async move {
                let result = this.process(task).await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = workers.join_next().await {
            record_join(&mut summary, joined);
        }

        match claim_error {
            Some(e) => Err(e.into()),
            None => Ok(summary),
        }
    }

    /// Process one claimed task to a single acknowledgement.
    pub async fn process(&self, mut task: DeliveryTask) -> Result<Disposition> {
        if self
            .ledger
            .has_success(task.event_id, task.subscription_id)
            .await?
        {
            tracing::debug!(
                event_id = %task.event_id,
                subscription_id = %task.subscription_id,
                "Already delivered, retiring without sending"
            );
            return self
                .acknowledge(&task, TaskState::Succeeded, Disposition::AlreadyDelivered, None)
                .await;
        }

        let Some(event) = self.events.get(task.event_id).await? else {
            return self.give_up(&mut task, REASON_EVENT_NOT_FOUND).await;
        };

        let subscription = match self.registry.current(task.subscription_id).await? {
            Some(s) if s.active => s,
            Some(_) => return self.give_up(&mut task, REASON_SUBSCRIPTION_INACTIVE).await,
            None => return self.give_up(&mut task, REASON_SUBSCRIPTION_NOT_FOUND).await,
        };

        let attempt_number = task.attempt_count + 1;
        let sent_at = OffsetDateTime::now_utc();
        let result = self.send(&event, &subscription, attempt_number).await?;
        let attempt = DeliveryAttempt::new(&task, attempt_number, sent_at, DeliveryOutcome::Pending)
            .with_status(result.status)
            .with_latency_ms(result.latency_ms);
        task.attempt_count = attempt_number;

        let failure = result.into_error();
        task.last_error = failure
            .as_ref()
            .and_then(HookError::delivery_reason)
            .map(str::to_owned);

        match failure {
            None => self.record_success(&task, attempt).await,
            Some(error) if error.is_retryable() => {
                self.record_retryable_failure(&task, &subscription, attempt, error)
                    .await
            }
            Some(error) => self.record_final_failure(&task, attempt, error).await,
        }
    }

    async fn send(
        &self,
        event: &Event,
        subscription: &Subscription,
        attempt_number: u32,
    ) -> Result<SendResult> {
        let body = event.body()?;
        let signature = compute_signature(subscription.signing_secret.as_bytes(), &body);

        let start = Instant::now();
        let response = self
            .client
            .post(subscription.target_url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(EVENT_ID_HEADER, event.id.to_string())
            .header(EVENT_TYPE_HEADER, event.event_type.as_str())
            .header(DELIVERY_ATTEMPT_HEADER, attempt_number.to_string())
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await;

        let result = match response {
            Ok(resp) => {
                let status = resp.status();
                let error = if status.is_success() {
                    None
                } else {
                    let text = resp.text().await.unwrap_or_default();
                    let excerpt: String = text.chars().take(MAX_REASON_BODY).collect();
                    Some(if excerpt.is_empty() {
                        format!("HTTP {}", status.as_u16())
                    } else {
                        format!("HTTP {}: {excerpt}", status.as_u16())
                    })
                };
                SendResult {
                    status: Some(status.as_u16()),
                    latency_ms: elapsed_ms(start),
                    error,
                }
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    format!(
                        "request timed out after {}ms",
                        self.config.request_timeout_ms
                    )
                } else {
                    format!("network error: {e}")
                };
                SendResult {
                    status: None,
                    latency_ms: elapsed_ms(start),
                    error: Some(error),
                }
            }
        };

        match &result.error {
            None => tracing::info!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                attempt = attempt_number,
                status = result.status,
                elapsed_ms = result.latency_ms,
                "Webhook delivered"
            ),
            Some(error) => tracing::warn!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                attempt = attempt_number,
                status = result.status,
                elapsed_ms = result.latency_ms,
                error = %error,
                "Webhook delivery failed"
            ),
        }

        Ok(result)
    }

    async fn record_success(&self, task: &DeliveryTask, attempt: DeliveryAttempt) -> Result<Disposition> {
        let mut attempt = attempt;
        attempt.outcome = DeliveryOutcome::Success;
        let disposition = match self.ledger.append(&attempt).await {
            Ok(()) => Disposition::Delivered,
            Err(StorageError::DuplicateSuccess { .. }) => {
                tracing::warn!(
                    event_id = %task.event_id,
                    subscription_id = %task.subscription_id,
                    "Success already recorded, logging duplicate delivery"
                );
                attempt.outcome = DeliveryOutcome::Duplicate;
                self.ledger.append(&attempt).await?;
                Disposition::Duplicate
            }
            Err(e) => return Err(e.into()),
        };
        self.acknowledge(task, TaskState::Succeeded, disposition, None)
            .await
    }

    async fn record_final_failure(
        &self,
        task: &DeliveryTask,
        attempt: DeliveryAttempt,
        error: HookError,
    ) -> Result<Disposition> {
        let mut attempt = attempt.with_reason(error.delivery_reason().unwrap_or_default());
        attempt.outcome = DeliveryOutcome::FailedTerminal;
        self.ledger.append(&attempt).await?;
        tracing::warn!(
            event_id = %task.event_id,
            subscription_id = %task.subscription_id,
            attempts = task.attempt_count,
            error = %error,
            "Delivery failed permanently"
        );
        self.acknowledge(task, TaskState::FailedTerminal, Disposition::Failed, None)
            .await
    }

    async fn record_retryable_failure(
        &self,
        task: &DeliveryTask,
        subscription: &Subscription,
        attempt: DeliveryAttempt,
        error: HookError,
    ) -> Result<Disposition> {
        // Deactivation while the request was in flight cancels further retries.
        let still_active = self
            .registry
            .current(task.subscription_id)
            .await?
            .is_some_and(|s| s.active);
        if !still_active {
            let error = HookError::terminal(attempt.response_status, REASON_SUBSCRIPTION_INACTIVE);
            return self.record_final_failure(task, attempt, error).await;
        }

        let policy = subscription.retry_policy;
        if !policy.should_retry(task.attempt_count) {
            let error = HookError::terminal(attempt.response_status, REASON_MAX_ATTEMPTS);
            return self.record_final_failure(task, attempt, error).await;
        }

        let delay = policy.next_delay(task.attempt_count);
        let next_attempt_at = OffsetDateTime::now_utc() + delay;

        let mut attempt = attempt;
        attempt.outcome = DeliveryOutcome::FailedRetryable;
        if let Some(reason) = error.delivery_reason() {
            attempt = attempt.with_reason(reason);
        }
        self.ledger.append(&attempt).await?;

        tracing::debug!(
            event_id = %task.event_id,
            subscription_id = %task.subscription_id,
            attempt = task.attempt_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Delivery scheduled for retry"
        );
        self.acknowledge(task, TaskState::Pending, Disposition::Retrying, Some(next_attempt_at))
            .await
    }

    /// Retire a task that cannot be sent, recording why.
    async fn give_up(&self, task: &mut DeliveryTask, reason: &str) -> Result<Disposition> {
        let attempt_number = task.attempt_count + 1;
        task.last_error = Some(reason.to_string());
        let attempt = DeliveryAttempt::new(
            task,
            attempt_number,
            OffsetDateTime::now_utc(),
            DeliveryOutcome::Pending,
        );
        tracing::info!(
            event_id = %task.event_id,
            subscription_id = %task.subscription_id,
            reason,
            "Delivery cancelled"
        );
        self.record_final_failure(task, attempt, HookError::terminal(None, reason))
            .await
    }

    /// Requeue (`Pending`) or retire (terminal state) the claimed task.
    async fn acknowledge(
        &self,
        task: &DeliveryTask,
        state: TaskState,
        disposition: Disposition,
        next_attempt_at: Option<OffsetDateTime>,
    ) -> Result<Disposition> {
        let acked = match (state, next_attempt_at) {
            (TaskState::Pending, Some(at)) => self.queue.requeue(task, at).await,
            _ => self.queue.retire(task, state).await,
        };
        match acked {
            Ok(()) => Ok(disposition),
            Err(StorageError::LeaseLost { .. }) => {
                tracing::warn!(
                    task_id = %task.id,
                    event_id = %task.event_id,
                    subscription_id = %task.subscription_id,
                    "Lease lost before acknowledgement"
                );
                Ok(Disposition::LeaseLost)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Dispatch until shutdown. In-flight deliveries finish before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.config.concurrency,
            strict_ordering = self.config.strict_ordering,
            "Starting webhook dispatcher"
        );
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            match self.drain(Some(&shutdown)).await {
                Ok(summary) if summary.claimed > 0 => {
                    tracing::debug!(?summary, "Dispatch pass complete");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Dispatch pass failed"),
            }

            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("Webhook dispatcher shutting down");
                        break;
                    }
                }
                _ = self.signal.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Return expired claims to the queue periodically until shutdown.
    pub async fn run_lease_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.lease_sweep_interval_ms);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("Lease sweeper shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.queue.release_expired(OffsetDateTime::now_utc()).await {
                        Ok(0) => {}
                        Ok(released) => {
                            tracing::info!(released, "Released expired delivery leases");
                            self.signal.notify_one();
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to release expired leases"),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn record_join(summary: &mut DispatchSummary, joined: std::result::Result<Result<Disposition>, tokio::task::JoinError>) {
    match joined {
        Ok(result) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "Failed to process delivery task");
            }
            summary.record(&result);
        }
        Err(e) => {
            tracing::error!(error = %e, "Delivery worker panicked");
            summary.errors += 1;
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
