use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use carehook_db_memory::InMemoryStorage;
use carehook_db_postgres::PostgresStorage;
use carehook_dispatch::WebhookService;
use carehook_storage::Stores;

use crate::config::{AppConfig, ServerConfig, StorageBackend, StorageConfig};
use crate::handlers::{self, AppState};
use crate::middleware::request_id;

pub fn build_app(state: AppState, cfg: &ServerConfig) -> Router {
    Router::new()
        // Health and info endpoints
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        // Producer intake and event inspection
        .route("/events", post(handlers::submit_event))
        .route("/events/{id}", get(handlers::get_event))
        .route("/events/{id}/deliveries", get(handlers::event_deliveries))
        .route(
            "/deliveries/{event_id}/{subscription_id}",
            get(handlers::delivery_history),
        )
        .route("/queue/stats", get(handlers::queue_stats))
        // Subscription administration
        .route(
            "/subscriptions",
            get(handlers::list_subscriptions).post(handlers::create_subscription),
        )
        .route(
            "/subscriptions/{id}",
            get(handlers::get_subscription).patch(handlers::update_subscription),
        )
        .route(
            "/subscriptions/{id}/deactivate",
            post(handlers::deactivate_subscription),
        )
        .route(
            "/subscriptions/{id}/activate",
            post(handlers::activate_subscription),
        )
        .route(
            "/subscriptions/{id}/health",
            get(handlers::subscription_health),
        )
        .with_state(state)
        .layer(
            // Outermost first: request id -> trace -> body limit
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_id))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|req: &axum::http::Request<_>| {
                            use tracing::field::Empty;
                            let req_id = req
                                .extensions()
                                .get::<axum::http::HeaderValue>()
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("")
                                .to_string();
                            tracing::info_span!(
                                "http.request",
                                http.method = %req.method(),
                                http.target = %req.uri(),
                                http.status_code = Empty,
                                request_id = %req_id
                            )
                        })
                        .on_response(
                            |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                                span.record(
                                    "http.status_code",
                                    tracing::field::display(res.status().as_u16()),
                                );
                                tracing::info!(
                                    http.status = %res.status().as_u16(),
                                    elapsed_ms = %latency.as_millis(),
                                    "request handled"
                                );
                            },
                        ),
                )
                .layer(axum::extract::DefaultBodyLimit::max(cfg.body_limit_bytes)),
        )
}

/// Open the configured storage backend.
pub async fn open_stores(cfg: &StorageConfig) -> anyhow::Result<Stores> {
    match cfg.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; events and deliveries are lost on restart");
            Ok(InMemoryStorage::new().stores())
        }
        StorageBackend::Postgres => {
            let pg = cfg
                .postgres
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("storage.postgres config is required"))?;
            let storage = PostgresStorage::connect(pg).await?;
            Ok(Stores::from_backend(Arc::new(storage)))
        }
    }
}

pub struct CarehookServer {
    addr: SocketAddr,
    app: Router,
    service: WebhookService,
    shutdown_grace: Duration,
}

impl CarehookServer {
    /// Open storage, load the registry and assemble the router.
    pub async fn build(cfg: &AppConfig) -> anyhow::Result<Self> {
        let stores = open_stores(&cfg.storage).await?;
        Self::with_stores(cfg, stores).await
    }

    pub async fn with_stores(cfg: &AppConfig, stores: Stores) -> anyhow::Result<Self> {
        let service = WebhookService::build(stores, cfg.pipeline()).await?;
        let app = build_app(
            AppState {
                service: service.clone(),
            },
            &cfg.server,
        );
        Ok(Self {
            addr: cfg.addr(),
            app,
            service,
            shutdown_grace: Duration::from_millis(cfg.server.shutdown_grace_ms),
        })
    }

    pub fn service(&self) -> &WebhookService {
        &self.service
    }

    /// Serve until Ctrl+C, then stop the background workers.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `signal` completes. Background workers are
    /// started first and given `shutdown_grace` to finish in-flight work.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = self.service.spawn(shutdown_rx);

        tracing::info!("listening on {}", listener.local_addr()?);
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(signal)
            .await;

        let _ = shutdown_tx.send(true);
        let drain = async {
            for worker in workers {
                if let Err(e) = worker.await {
                    tracing::error!(error = %e, "Background worker panicked");
                }
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            tracing::warn!(
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "Background workers did not stop in time"
            );
        }

        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
