use axum::{
    Json,
    extract::{
        Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

use carehook_core::{
    DeliveryAttempt, Event, EventId, NewEvent, NewSubscription, QueueStats, Subscription,
    SubscriptionId, SubscriptionPatch,
};
use carehook_dispatch::WebhookService;

use crate::error::ApiResult;

/// Shared state of every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub service: WebhookService,
}

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "carehook",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
    });
    (StatusCode::OK, Json(body))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Ready once the queue store answers.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.stores.queue.stats().await {
        Ok(_) => (StatusCode::OK, Json(HealthResponse { status: "ready" })),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                }),
            )
        }
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    /// Defaults to the time of submission.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
pub struct SubmitEventResponse {
    pub id: EventId,
}

pub async fn submit_event(
    State(state): State<AppState>,
    body: Result<Json<SubmitEventRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitEventResponse>)> {
    let Json(req) = body?;
    let occurred_at = req.occurred_at.unwrap_or_else(OffsetDateTime::now_utc);
    let id = state
        .service
        .bus
        .submit(NewEvent::new(req.event_type, req.payload, occurred_at))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitEventResponse { id })))
}

pub async fn get_event(
    State(state): State<AppState>,
    id: Result<Path<EventId>, PathRejection>,
) -> ApiResult<Json<Event>> {
    let Path(id) = id?;
    Ok(Json(state.service.bus.get(id).await?))
}

/// Every attempt for one event, across subscriptions.
pub async fn event_deliveries(
    State(state): State<AppState>,
    id: Result<Path<EventId>, PathRejection>,
) -> ApiResult<Json<Vec<DeliveryAttempt>>> {
    let Path(id) = id?;
    state.service.bus.get(id).await?;
    let attempts = state.service.stores.ledger.attempts_for_event(id).await?;
    Ok(Json(attempts))
}

pub async fn delivery_history(
    State(state): State<AppState>,
    ids: Result<Path<(EventId, SubscriptionId)>, PathRejection>,
) -> ApiResult<Json<Vec<DeliveryAttempt>>> {
    let Path((event_id, subscription_id)) = ids?;
    let attempts = state
        .service
        .stores
        .ledger
        .history(event_id, subscription_id)
        .await?;
    Ok(Json(attempts))
}

pub async fn queue_stats(State(state): State<AppState>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.service.stores.queue.stats().await?))
}

// =============================================================================
// Subscriptions
// =============================================================================

pub async fn create_subscription(
    State(state): State<AppState>,
    body: Result<Json<NewSubscription>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let Json(new) = body?;
    let subscription = state.service.registry.create(new).await?;
    Ok((StatusCode::CREATED, Json(subscription.masked())))
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<Subscription>>> {
    let subscriptions = state.service.registry.list().await?;
    Ok(Json(subscriptions.iter().map(Subscription::masked).collect()))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    id: Result<Path<SubscriptionId>, PathRejection>,
) -> ApiResult<Json<Subscription>> {
    let Path(id) = id?;
    Ok(Json(state.service.registry.get(id).await?.masked()))
}

pub async fn update_subscription(
    State(state): State<AppState>,
    id: Result<Path<SubscriptionId>, PathRejection>,
    body: Result<Json<SubscriptionPatch>, JsonRejection>,
) -> ApiResult<Json<Subscription>> {
    let Path(id) = id?;
    let Json(patch) = body?;
    Ok(Json(state.service.registry.update(id, patch).await?.masked()))
}

pub async fn deactivate_subscription(
    State(state): State<AppState>,
    id: Result<Path<SubscriptionId>, PathRejection>,
) -> ApiResult<Json<Subscription>> {
    let Path(id) = id?;
    Ok(Json(state.service.registry.deactivate(id).await?.masked()))
}

pub async fn activate_subscription(
    State(state): State<AppState>,
    id: Result<Path<SubscriptionId>, PathRejection>,
) -> ApiResult<Json<Subscription>> {
    let Path(id) = id?;
    Ok(Json(state.service.registry.activate(id).await?.masked()))
}

pub async fn subscription_health(
    State(state): State<AppState>,
    id: Result<Path<SubscriptionId>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let Path(id) = id?;
    let subscription = state.service.registry.get(id).await?;
    let health = state.service.stores.ledger.health(id).await?;
    Ok(Json(json!({
        "subscription_id": id,
        "active": subscription.active,
        "health": health,
    })))
}
