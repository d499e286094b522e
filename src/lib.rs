pub mod agents;
pub mod config;
pub mod deployment;
pub mod events;
pub mod healthcheck;
pub mod lifecycle;
pub mod protocol;
pub mod secrets;
pub mod socket;

use std::sync::Arc;

use agents::AgentRegistry;
use config::CoordinatorConfig;
use deployment::DeploymentStore;
use events::EventBroadcaster;
use healthcheck::HealthcheckProvider;
use lifecycle::{LifecycleService, OperationRegistry};
use secrets::SecretStore;
use socket::MessageDispatcher;

/// Shared coordinator state passed to every connection task.
///
/// The two mutable registries (agent connections, in-flight operations) are
/// owned here and injected into every component that needs them — nothing in
/// the coordinator reaches for globals.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<CoordinatorConfig>,
    pub agent_registry: Arc<AgentRegistry>,
    pub operations: Arc<OperationRegistry>,
    pub deployments: Arc<DeploymentStore>,
    pub lifecycle: Arc<LifecycleService>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub broadcaster: EventBroadcaster,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire the coordinator components together over one config.
    pub fn new(
        config: CoordinatorConfig,
        deployments: DeploymentStore,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let config = Arc::new(config);
        let agent_registry = Arc::new(AgentRegistry::new(config.agents.clone()));
        let operations = Arc::new(OperationRegistry::new(config.operation_timeout()));
        let broadcaster = EventBroadcaster::new();
        let healthcheck = Arc::new(HealthcheckProvider::new());
        let lifecycle = Arc::new(LifecycleService::new(
            agent_registry.clone(),
            operations.clone(),
            secrets,
            healthcheck,
        ));
        let dispatcher = Arc::new(MessageDispatcher::standard(
            agent_registry.clone(),
            operations.clone(),
            broadcaster.clone(),
        ));

        Self {
            config,
            agent_registry,
            operations,
            deployments: Arc::new(deployments),
            lifecycle,
            dispatcher,
            broadcaster,
            started_at: std::time::Instant::now(),
        }
    }
}
