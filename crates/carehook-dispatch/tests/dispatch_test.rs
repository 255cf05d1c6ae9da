//! End-to-end delivery behaviour against mock receivers.

use std::time::Duration;

use carehook_core::{
    DeliveryAttempt, DeliveryOutcome, DeliveryTask, HookError, NewEvent, NewSubscription,
    RetryPolicy, Subscription, TaskState, verify_signature,
};
use carehook_db_memory::InMemoryStorage;
use carehook_dispatch::{Disposition, DispatcherConfig, PipelineConfig, WebhookService};
use carehook_storage::ClaimPolicy;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "whsec_test";

struct Harness {
    storage: InMemoryStorage,
    service: WebhookService,
}

async fn harness(dispatcher: DispatcherConfig) -> Harness {
    let storage = InMemoryStorage::new();
    let service = WebhookService::build(
        storage.stores(),
        PipelineConfig {
            dispatcher,
            ..Default::default()
        },
    )
    .await
    .expect("pipeline builds");
    Harness { storage, service }
}

fn immediate_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::ZERO, Duration::ZERO)
}

impl Harness {
    async fn subscribe(&self, server: &MockServer, filter: &str, policy: RetryPolicy) -> Subscription {
        self.service
            .registry
            .create(
                NewSubscription::new(filter, format!("{}/hook", server.uri()), SECRET)
                    .with_retry_policy(policy),
            )
            .await
            .expect("subscription created")
    }

    async fn submit(&self, event_type: &str, payload: serde_json::Value) -> carehook_core::EventId {
        let id = self
            .service
            .bus
            .submit(NewEvent::new(event_type, payload, OffsetDateTime::now_utc()))
            .await
            .expect("event accepted");
        self.service.bus.resolve_pending(100).await.expect("resolved");
        id
    }

    /// Dispatch until a pass claims nothing.
    async fn dispatch_all(&self) {
        for _ in 0..50 {
            let summary = self
                .service
                .dispatcher
                .dispatch_ready()
                .await
                .expect("dispatch pass");
            if summary.claimed == 0 {
                return;
            }
        }
        panic!("queue did not drain");
    }

    async fn history(
        &self,
        event_id: carehook_core::EventId,
        subscription: &Subscription,
    ) -> Vec<DeliveryAttempt> {
        self.service
            .stores
            .ledger
            .history(event_id, subscription.id)
            .await
            .unwrap()
    }
}

fn outcomes(rows: &[DeliveryAttempt]) -> Vec<DeliveryOutcome> {
    rows.iter().map(|r| r.outcome).collect()
}

#[tokio::test]
async fn test_retries_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig::default()).await;
    let sub = h.subscribe(&server, "appointment.created", immediate_retry(5)).await;
    let event_id = h.submit("appointment.created", json!({"patient_id": 42})).await;
    h.dispatch_all().await;

    let rows = h.history(event_id, &sub).await;
    assert_eq!(
        outcomes(&rows),
        vec![
            DeliveryOutcome::FailedRetryable,
            DeliveryOutcome::FailedRetryable,
            DeliveryOutcome::Success
        ]
    );
    assert_eq!(
        rows.iter().map(|r| r.attempt_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(
        rows.iter().map(|r| r.response_status).collect::<Vec<_>>(),
        vec![Some(500), Some(500), Some(200)]
    );

    let requests = server.received_requests().await.unwrap();
    let attempts: Vec<_> = requests
        .iter()
        .map(|r| r.headers.get("x-delivery-attempt").unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(attempts, vec!["1", "2", "3"]);

    let stats = h.service.stores.queue.stats().await.unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_client_error_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig::default()).await;
    let sub = h.subscribe(&server, "appointment.*", immediate_retry(5)).await;
    let event_id = h.submit("appointment.created", json!({"patient_id": 42})).await;
    h.dispatch_all().await;

    let rows = h.history(event_id, &sub).await;
    assert_eq!(outcomes(&rows), vec![DeliveryOutcome::FailedTerminal]);
    assert_eq!(rows[0].response_status, Some(404));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    let stats = h.service.stores.queue.stats().await.unwrap();
    assert_eq!(stats.failed_terminal, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_too_many_requests_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig::default()).await;
    let sub = h.subscribe(&server, "*", immediate_retry(3)).await;
    let event_id = h.submit("billing.payment_succeeded", json!({"amount": 120})).await;
    h.dispatch_all().await;

    assert_eq!(
        outcomes(&h.history(event_id, &sub).await),
        vec![DeliveryOutcome::FailedRetryable, DeliveryOutcome::Success]
    );
}

#[tokio::test]
async fn test_attempts_never_exceed_max() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig::default()).await;
    let sub = h.subscribe(&server, "lab.*", immediate_retry(3)).await;
    let event_id = h.submit("lab.result_ready", json!({"order": "A-1"})).await;
    h.dispatch_all().await;

    let rows = h.history(event_id, &sub).await;
    assert_eq!(
        outcomes(&rows),
        vec![
            DeliveryOutcome::FailedRetryable,
            DeliveryOutcome::FailedRetryable,
            DeliveryOutcome::FailedTerminal
        ]
    );
    assert_eq!(rows[2].reason.as_deref(), Some("max attempts exhausted"));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_request_is_signed_and_carries_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig::default()).await;
    h.subscribe(&server, "appointment.created", RetryPolicy::default())
        .await;
    let payload = json!({"patient_id": 42, "slot": "2026-10-18T09:30:00Z"});
    let event_id = h.submit("appointment.created", payload.clone()).await;
    h.dispatch_all().await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let header = |name: &str| request.headers.get(name).unwrap().to_str().unwrap().to_string();
    assert_eq!(header("content-type"), "application/json");
    assert_eq!(header("x-event-id"), event_id.to_string());
    assert_eq!(header("x-event-type"), "appointment.created");
    assert!(verify_signature(
        SECRET.as_bytes(),
        &request.body,
        &header("x-signature")
    ));

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body, payload);
}

#[tokio::test]
async fn test_timeout_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig {
        request_timeout_ms: 200,
        ..Default::default()
    })
    .await;
    let sub = h
        .subscribe(
            &server,
            "*",
            RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(60)),
        )
        .await;
    let event_id = h.submit("shift.changed", json!({"ward": "B2"})).await;
    h.dispatch_all().await;

    let rows = h.history(event_id, &sub).await;
    assert_eq!(outcomes(&rows), vec![DeliveryOutcome::FailedRetryable]);
    assert_eq!(rows[0].response_status, None);
    assert!(rows[0].reason.as_deref().unwrap().contains("timed out"));

    let stats = h.service.stores.queue.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_deactivation_during_attempt_stops_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig::default()).await;
    let sub = h.subscribe(&server, "appointment.*", immediate_retry(10)).await;
    let event_id = h.submit("appointment.cancelled", json!({"patient_id": 7})).await;

    let dispatcher = h.service.dispatcher.clone();
    let pass = tokio::spawn(async move { dispatcher.dispatch_ready().await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.service.registry.deactivate(sub.id).await.unwrap();
    pass.await.unwrap().unwrap();
    h.dispatch_all().await;

    let rows = h.history(event_id, &sub).await;
    assert_eq!(outcomes(&rows), vec![DeliveryOutcome::FailedTerminal]);
    assert_eq!(rows[0].reason.as_deref(), Some("subscription inactive"));
    assert_eq!(rows[0].response_status, Some(500));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(h.service.stores.queue.stats().await.unwrap().failed_terminal, 1);
}

#[tokio::test]
async fn test_queued_task_for_inactive_subscription_is_retired_unsent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig::default()).await;
    let sub = h.subscribe(&server, "*", RetryPolicy::default()).await;
    let event_id = h.submit("billing.invoice_issued", json!({"invoice": 9})).await;
    h.service.registry.deactivate(sub.id).await.unwrap();
    h.dispatch_all().await;

    let rows = h.history(event_id, &sub).await;
    assert_eq!(outcomes(&rows), vec![DeliveryOutcome::FailedTerminal]);
    assert_eq!(rows[0].reason.as_deref(), Some("subscription inactive"));
    assert_eq!(rows[0].response_status, None);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failing_endpoint_does_not_affect_others() {
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&broken)
        .await;

    let h = harness(DispatcherConfig::default()).await;
    let good = h.subscribe(&healthy, "billing.*", immediate_retry(4)).await;
    let bad = h.subscribe(&broken, "billing.*", immediate_retry(4)).await;
    let event_id = h.submit("billing.payment_succeeded", json!({"amount": 10})).await;
    h.dispatch_all().await;

    assert_eq!(
        outcomes(&h.history(event_id, &good).await),
        vec![DeliveryOutcome::Success]
    );
    assert_eq!(h.history(event_id, &bad).await.len(), 4);
    assert_eq!(healthy.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_every_matching_subscription_gets_an_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig {
        concurrency: 4,
        ..Default::default()
    })
    .await;
    let all = h.subscribe(&server, "*", RetryPolicy::default()).await;
    let appointments = h.subscribe(&server, "appointment.*", RetryPolicy::default()).await;
    let billing = h
        .subscribe(&server, "billing.payment_succeeded", RetryPolicy::default())
        .await;

    let mut submitted = Vec::new();
    for event_type in [
        "appointment.created",
        "appointment.rescheduled",
        "billing.payment_succeeded",
        "billing.refund_issued",
        "lab.result_ready",
    ] {
        submitted.push((event_type, h.submit(event_type, json!({"n": 1})).await));
    }
    h.dispatch_all().await;

    for (event_type, event_id) in submitted {
        assert_eq!(h.history(event_id, &all).await.len(), 1, "{event_type}");
        let expect_appointment = event_type.starts_with("appointment.");
        assert_eq!(
            h.history(event_id, &appointments).await.len(),
            usize::from(expect_appointment),
            "{event_type}"
        );
        let expect_billing = event_type == "billing.payment_succeeded";
        assert_eq!(
            h.history(event_id, &billing).await.len(),
            usize::from(expect_billing),
            "{event_type}"
        );
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 8);
}

#[tokio::test]
async fn test_recorded_success_is_not_resent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig::default()).await;
    let sub = h.subscribe(&server, "*", RetryPolicy::default()).await;
    let event_id = h.submit("appointment.created", json!({"patient_id": 1})).await;

    let policy = ClaimPolicy::default();
    let task = h
        .service
        .stores
        .queue
        .claim_ready(OffsetDateTime::now_utc(), &policy)
        .await
        .unwrap()
        .unwrap();
    h.service
        .stores
        .ledger
        .append(&DeliveryAttempt::new(
            &task,
            1,
            OffsetDateTime::now_utc(),
            DeliveryOutcome::Success,
        ))
        .await
        .unwrap();

    let disposition = h.service.dispatcher.process(task).await.unwrap();
    assert_eq!(disposition, Disposition::AlreadyDelivered);
    assert!(server.received_requests().await.unwrap().is_empty());

    let rows = h.history(event_id, &sub).await;
    assert_eq!(
        rows.iter()
            .filter(|r| r.outcome == DeliveryOutcome::Success)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_crashed_claim_is_recovered_after_lease_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig::default()).await;
    let sub = h.subscribe(&server, "*", RetryPolicy::default()).await;
    let event_id = h.submit("shift.changed", json!({"ward": "ICU"})).await;

    // A worker claims with a short lease and never acknowledges.
    let short = ClaimPolicy {
        lease_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let abandoned = h
        .service
        .stores
        .queue
        .claim_ready(OffsetDateTime::now_utc(), &short)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.service.dispatcher.dispatch_ready().await.unwrap().claimed, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.dispatch_all().await;

    assert_eq!(
        outcomes(&h.history(event_id, &sub).await),
        vec![DeliveryOutcome::Success]
    );
    assert!(
        h.service
            .stores
            .queue
            .retire(&abandoned, TaskState::Succeeded)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_strict_ordering_delivers_in_occurrence_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(20)))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig {
        strict_ordering: true,
        concurrency: 8,
        ..Default::default()
    })
    .await;
    h.subscribe(&server, "appointment.*", RetryPolicy::default())
        .await;

    let base = OffsetDateTime::now_utc() - time::Duration::minutes(5);
    let mut expected = Vec::new();
    for i in (0..5).rev() {
        let id = h
            .service
            .bus
            .submit(NewEvent::new(
                "appointment.updated",
                json!({"seq": i}),
                base + time::Duration::seconds(i),
            ))
            .await
            .unwrap();
        expected.push((i, id));
    }
    h.service.bus.resolve_pending(100).await.unwrap();
    h.dispatch_all().await;

    expected.sort_by_key(|(i, _)| *i);
    let received: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.headers.get("x-event-id").unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(
        received,
        expected
            .iter()
            .map(|(_, id)| id.to_string())
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_intake_rejects_invalid_and_reports_unavailable_store() {
    let h = harness(DispatcherConfig::default()).await;

    for (event_type, payload) in [
        ("", json!({})),
        ("billing.*", json!({})),
        ("appointment.created", json!([1, 2, 3])),
    ] {
        let result = h
            .service
            .bus
            .submit(NewEvent::new(event_type, payload, OffsetDateTime::now_utc()))
            .await;
        assert!(matches!(result, Err(HookError::Validation(_))), "{event_type}");
    }

    h.storage.events.set_offline(true);
    let result = h
        .service
        .bus
        .submit(NewEvent::new(
            "appointment.created",
            json!({"patient_id": 42}),
            OffsetDateTime::now_utc(),
        ))
        .await;
    assert!(matches!(result, Err(HookError::QueueUnavailable(_))));
}

#[tokio::test]
async fn test_fan_out_is_idempotent() {
    let server = MockServer::start().await;
    let h = harness(DispatcherConfig::default()).await;
    let sub = h.subscribe(&server, "*", RetryPolicy::default()).await;
    let event = NewEvent::new("lab.result_ready", json!({}), OffsetDateTime::now_utc()).into_event();

    // Simulate a crash after enqueue but before the event was marked resolved.
    h.service.stores.events.record(&event).await.unwrap();
    h.service
        .stores
        .queue
        .enqueue(&DeliveryTask::new(&event, &sub))
        .await
        .unwrap();

    assert_eq!(h.service.bus.resolve_pending(10).await.unwrap(), 0);
    assert_eq!(h.service.bus.resolve_pending(10).await.unwrap(), 0);
    assert_eq!(h.storage.queue.len(), 1);
    assert!(h.service.stores.events.unresolved(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_background_pipeline_delivers_and_shuts_down() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(DispatcherConfig {
        poll_interval_ms: 50,
        ..Default::default()
    })
    .await;
    h.subscribe(&server, "appointment.*", RetryPolicy::default())
        .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = h.service.spawn(shutdown_rx);

    h.service
        .bus
        .submit(NewEvent::new(
            "appointment.created",
            json!({"patient_id": 42}),
            OffsetDateTime::now_utc(),
        ))
        .await
        .unwrap();

    let delivered = async {
        loop {
            if !server.received_requests().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), delivered)
        .await
        .expect("event delivered by background tasks");

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("task stopped")
            .unwrap();
    }
}

#[tokio::test]
async fn subscription_created_on_another_instance_receives_next_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    // Intake instance loads its snapshot before the subscription exists.
    let intake = harness(DispatcherConfig::default()).await;
    let admin = WebhookService::build(intake.storage.stores(), PipelineConfig::default())
        .await
        .expect("admin pipeline builds");
    let subscription = admin
        .registry
        .create(
            NewSubscription::new("appointment.created", format!("{}/hook", server.uri()), SECRET)
                .with_retry_policy(immediate_retry(3)),
        )
        .await
        .unwrap();
    assert!(intake.service.registry.resolve("appointment.created").is_empty());

    let event_id = intake
        .service
        .bus
        .submit(NewEvent::new(
            "appointment.created",
            json!({"appointment_id": "apt-7"}),
            OffsetDateTime::now_utc(),
        ))
        .await
        .unwrap();
    assert_eq!(intake.service.bus.resolve_pending(100).await.unwrap(), 1);

    intake.dispatch_all().await;
    let rows = intake.history(event_id, &subscription).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].outcome, DeliveryOutcome::Success);
}
