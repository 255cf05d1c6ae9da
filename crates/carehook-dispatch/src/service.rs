//! Wiring of registry, event bus and dispatcher over one set of stores.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use carehook_core::Result;
use carehook_storage::Stores;

use crate::bus::{EventBus, IntakeConfig};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::registry::{RegistryConfig, SubscriptionRegistry};

/// Settings for every component of the pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub intake: IntakeConfig,
    pub registry: RegistryConfig,
    pub dispatcher: DispatcherConfig,
}

/// The whole delivery pipeline: intake, fan-out and dispatch.
#[derive(Debug, Clone)]
pub struct WebhookService {
    pub stores: Stores,
    pub registry: Arc<SubscriptionRegistry>,
    pub bus: Arc<EventBus>,
    pub dispatcher: Arc<Dispatcher>,
}

impl WebhookService {
    /// Build the pipeline and load the first registry snapshot.
    pub async fn build(stores: Stores, config: PipelineConfig) -> Result<Self> {
        let registry = Arc::new(
            SubscriptionRegistry::load(stores.subscriptions.clone(), config.registry).await?,
        );
        let dispatcher = Arc::new(Dispatcher::new(&stores, registry.clone(), config.dispatcher)?);
        let bus = Arc::new(
            EventBus::new(
                stores.events.clone(),
                stores.queue.clone(),
                registry.clone(),
                config.intake,
            )
            .with_dispatch_signal(dispatcher.signal()),
        );

        Ok(Self {
            stores,
            registry,
            bus,
            dispatcher,
        })
    }

    /// Start the resolver, dispatcher, lease sweeper and registry refresher.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let bus = self.bus.clone();
        let resolver_shutdown = shutdown.clone();
        let dispatcher = self.dispatcher.clone();
        let dispatcher_shutdown = shutdown.clone();
        let sweeper = self.dispatcher.clone();
        let sweeper_shutdown = shutdown.clone();
        let registry = self.registry.clone();

        vec![
            tokio::spawn(async move { bus.run(resolver_shutdown).await }),
            tokio::spawn(async move { dispatcher.run(dispatcher_shutdown).await }),
            tokio::spawn(async move { sweeper.run_lease_sweeper(sweeper_shutdown).await }),
            tokio::spawn(async move { registry.run_refresher(shutdown).await }),
        ]
    }
}
