use std::time::Duration;

use carehook_db_memory::InMemoryStorage;
use carehook_server::{AppConfig, CarehookServer};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestServer {
    base: String,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server stopped")
            .unwrap();
    }
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.dispatcher.poll_interval_ms = 50;
    cfg.intake.resolve_poll_interval_ms = 50;
    cfg
}

async fn start_server(storage: &InMemoryStorage) -> TestServer {
    let server = CarehookServer::with_stores(&test_config(), storage.stores())
        .await
        .expect("build server");

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = server
            .serve(listener, async move {
                let _ = rx.await;
            })
            .await;
    });

    TestServer {
        base: format!("http://{addr}"),
        shutdown: tx,
        handle,
    }
}

#[tokio::test]
async fn health_endpoints_work() {
    let storage = InMemoryStorage::new();
    let server = start_server(&storage).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/", server.base)).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["service"], "carehook");

    let resp = client
        .get(format!("{}/healthz", server.base))
        .header("x-request-id", "req-123")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(resp.headers()["x-request-id"], "req-123");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client
        .get(format!("{}/readyz", server.base))
        .send()
        .await
        .unwrap();
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ready");

    server.stop().await;
}

#[tokio::test]
async fn subscription_administration() {
    let storage = InMemoryStorage::new();
    let server = start_server(&storage).await;
    let client = reqwest::Client::new();
    let base = &server.base;

    let resp = client
        .post(format!("{base}/subscriptions"))
        .json(&json!({
            "event_type_filter": "appointment.*",
            "target_url": "https://clinic.example.com/hooks",
            "signing_secret": "whsec_admin",
            "description": "front desk"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["signing_secret"], "***");
    assert_eq!(created["active"], true);
    let id = created["id"].as_str().unwrap().to_string();

    let resp = client
        .get(format!("{base}/subscriptions/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let fetched: Value = resp.json().await.unwrap();
    assert_eq!(fetched["event_type_filter"], "appointment.*");
    assert_eq!(fetched["signing_secret"], "***");

    let resp = client
        .patch(format!("{base}/subscriptions/{id}"))
        .json(&json!({ "event_type_filter": "appointment.created" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let patched: Value = resp.json().await.unwrap();
    assert_eq!(patched["event_type_filter"], "appointment.created");

    let resp = client
        .post(format!("{base}/subscriptions/{id}/deactivate"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["active"], false);

    let resp = client
        .post(format!("{base}/subscriptions/{id}/activate"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["active"], true);

    let list: Value = client
        .get(format!("{base}/subscriptions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);

    let health: Value = client
        .get(format!("{base}/subscriptions/{id}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["health"]["attempts"], 0);

    server.stop().await;
}

#[tokio::test]
async fn errors_are_reported_as_json() {
    let storage = InMemoryStorage::new();
    let server = start_server(&storage).await;
    let client = reqwest::Client::new();
    let base = &server.base;

    // Unknown subscription
    let resp = client
        .get(format!(
            "{base}/subscriptions/6f1c1f0e-8a55-4c4b-9d2e-1b7f6f0e2a11"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "not-found");

    // Malformed identifier
    let resp = client
        .get(format!("{base}/events/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "validation");

    // Invalid subscription
    let resp = client
        .post(format!("{base}/subscriptions"))
        .json(&json!({
            "event_type_filter": "billing.*",
            "target_url": "ftp://files.example.com",
            "signing_secret": "k"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Wildcards are not event types
    let resp = client
        .post(format!("{base}/events"))
        .json(&json!({ "type": "billing.*", "payload": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "validation");

    // Body that is not JSON
    let resp = client
        .post(format!("{base}/events"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    server.stop().await;
}

#[tokio::test]
async fn intake_fails_loudly_when_store_is_down() {
    let storage = InMemoryStorage::new();
    let server = start_server(&storage).await;
    let client = reqwest::Client::new();

    storage.events.set_offline(true);
    let resp = client
        .post(format!("{}/events", server.base))
        .json(&json!({ "type": "lab.result_ready", "payload": {"order": "A-1"} }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "queue-unavailable");

    storage.events.set_offline(false);
    server.stop().await;
}

#[tokio::test]
async fn submitted_event_is_delivered_end_to_end() {
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/appointments"))
        .and(header_exists("x-signature"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&receiver)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks/appointments"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&receiver)
        .await;

    let storage = InMemoryStorage::new();
    let server = start_server(&storage).await;
    let client = reqwest::Client::new();
    let base = &server.base;

    let created: Value = client
        .post(format!("{base}/subscriptions"))
        .json(&json!({
            "event_type_filter": "appointment.*",
            "target_url": format!("{}/hooks/appointments", receiver.uri()),
            "signing_secret": "whsec_e2e",
            "retry_policy": { "max_attempts": 3, "base_delay_ms": 0, "max_delay_ms": 0 }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let subscription_id = created["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{base}/events"))
        .json(&json!({
            "type": "appointment.created",
            "payload": {"patient_id": 42},
            "occurred_at": "2026-10-18T09:30:00Z"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let accepted: Value = resp.json().await.unwrap();
    let event_id = accepted["id"].as_str().unwrap().to_string();

    let event: Value = client
        .get(format!("{base}/events/{event_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(event["type"], "appointment.created");

    // Ledger rows are written before the task is retired, so a retired task
    // implies a complete history.
    let stats_url = format!("{base}/queue/stats");
    let delivered = async {
        loop {
            let stats: Value = client
                .get(&stats_url)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if stats["succeeded"] == 1 {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    let stats = tokio::time::timeout(Duration::from_secs(10), delivered)
        .await
        .expect("delivery succeeded");
    assert_eq!(stats["pending"], 0);

    let rows: Value = client
        .get(format!("{base}/deliveries/{event_id}/{subscription_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows = rows.as_array().unwrap();
    let outcomes: Vec<_> = rows.iter().map(|r| r["outcome"].clone()).collect();
    assert_eq!(outcomes, vec![json!("failed_retryable"), json!("success")]);
    assert_eq!(rows[0]["response_status"], 503);

    let deliveries: Value = client
        .get(format!("{base}/events/{event_id}/deliveries"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deliveries.as_array().unwrap().len(), 2);

    let health: Value = client
        .get(format!("{base}/subscriptions/{subscription_id}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["health"]["attempts"], 2);
    assert_eq!(health["health"]["successes"], 1);

    server.stop().await;
}
