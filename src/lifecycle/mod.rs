//! Lifecycle orchestration — the coordinator's entry point for
//! deploy/start/stop/restart.
//!
//! Each call resolves the target agent, resolves secret references in the
//! deployment definition, transmits the command envelope on the agent's
//! socket, and hands back the correlated pending operation. The caller only
//! observes completion once the reply (or the timeout) arrives.

pub mod operations;

pub use operations::{OperationRegistry, PendingOperation};

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::agents::{AgentRegistry, SelectionError};
use crate::deployment::Deployment;
use crate::healthcheck::HealthcheckProvider;
use crate::protocol::{
    DeploymentStatus, LifecycleCommand, LifecycleRequest, MessageType, OperationResult,
    SocketMessage,
};
use crate::secrets::{resolve_placeholders, SecretError, SecretStore};
use crate::socket::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("agent reported failure: {message}")]
    AgentFailure { message: String },
    #[error("command dropped before settlement")]
    CommandDropped,
}

// ─── Message IDs ─────────────────────────────────────────────────────────────

/// Milliseconds since the epoch, strictly increasing across calls. Rapid
/// repeated commands against the same deployment and version would otherwise
/// collide on the same wall-clock millisecond.
fn monotonic_millis() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = chrono::Utc::now().timestamp_millis();
    let previous = LAST
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .expect("fetch_update closure never declines");
    now.max(previous + 1)
}

/// `lifecycle/<command>/<deploymentID>/<version-or-"current">/<monotonic-timestamp>`
pub fn lifecycle_message_id(
    command: LifecycleCommand,
    deployment_id: &str,
    version: Option<&str>,
) -> String {
    format!(
        "lifecycle/{}/{}/{}/{}",
        command.as_str(),
        deployment_id,
        version.unwrap_or("current"),
        monotonic_millis()
    )
}

// ─── Service ─────────────────────────────────────────────────────────────────

/// Drives application lifecycle commands against remote agents.
pub struct LifecycleService {
    agents: Arc<AgentRegistry>,
    operations: Arc<OperationRegistry>,
    secrets: Arc<dyn SecretStore>,
    healthcheck: Arc<HealthcheckProvider>,
}

impl LifecycleService {
    pub fn new(
        agents: Arc<AgentRegistry>,
        operations: Arc<OperationRegistry>,
        secrets: Arc<dyn SecretStore>,
        healthcheck: Arc<HealthcheckProvider>,
    ) -> Self {
        Self {
            agents,
            operations,
            secrets,
            healthcheck,
        }
    }

    pub async fn deploy(
        &self,
        deployment: &Deployment,
        version: Option<&str>,
    ) -> Result<PendingOperation, LifecycleError> {
        self.dispatch(LifecycleCommand::Deploy, deployment, version).await
    }

    pub async fn start(
        &self,
        deployment: &Deployment,
        version: Option<&str>,
    ) -> Result<PendingOperation, LifecycleError> {
        self.dispatch(LifecycleCommand::Start, deployment, version).await
    }

    pub async fn stop(
        &self,
        deployment: &Deployment,
        version: Option<&str>,
    ) -> Result<PendingOperation, LifecycleError> {
        self.dispatch(LifecycleCommand::Stop, deployment, version).await
    }

    pub async fn restart(
        &self,
        deployment: &Deployment,
        version: Option<&str>,
    ) -> Result<PendingOperation, LifecycleError> {
        self.dispatch(LifecycleCommand::Restart, deployment, version).await
    }

    /// Start, await the agent's reply, then verify health: a `STARTED` result
    /// is upgraded (or downgraded) by the health-check poller before being
    /// reported upward.
    pub async fn start_verified(
        &self,
        deployment: &Deployment,
        version: Option<&str>,
    ) -> Result<OperationResult, LifecycleError> {
        let pending = self.dispatch(LifecycleCommand::Start, deployment, version).await?;
        self.verify(deployment, pending, DeploymentStatus::Started).await
    }

    /// Restart counterpart of [`start_verified`](Self::start_verified).
    pub async fn restart_verified(
        &self,
        deployment: &Deployment,
        version: Option<&str>,
    ) -> Result<OperationResult, LifecycleError> {
        let pending = self.dispatch(LifecycleCommand::Restart, deployment, version).await?;
        self.verify(deployment, pending, DeploymentStatus::Restarted).await
    }

    async fn verify(
        &self,
        deployment: &Deployment,
        pending: PendingOperation,
        started: DeploymentStatus,
    ) -> Result<OperationResult, LifecycleError> {
        let mut result = pending.wait().await?;
        if result.status == started {
            result.status = self
                .healthcheck
                .execute_healthcheck(&deployment.id, &deployment.healthcheck)
                .await;
        }
        Ok(result)
    }

    async fn dispatch(
        &self,
        command: LifecycleCommand,
        deployment: &Deployment,
        version: Option<&str>,
    ) -> Result<PendingOperation, LifecycleError> {
        let target = self.agents.first_available(deployment)?;
        let message_id = lifecycle_message_id(command, &deployment.id, version);

        // Agents never see unresolved [dsm:<key>] references.
        let mut outbound = deployment.clone();
        outbound.definition = resolve_placeholders(&deployment.definition, self.secrets.as_ref())?;

        let envelope = SocketMessage::new(
            message_id.clone(),
            MessageType::Lifecycle,
            LifecycleRequest {
                deployment: outbound,
                version: version.map(str::to_string),
                command,
            },
        );

        // Register before transmitting so the reply can never race the
        // registration; a failed transmit unwinds the registration.
        let pending = self.operations.operation_started(&message_id);
        if let Err(e) = target.socket.send(&envelope).await {
            self.operations.discard(&message_id);
            return Err(e.into());
        }

        info!(
            message_id = %message_id,
            deployment = %deployment.id,
            agent = %target.agent,
            command = command.as_str(),
            "lifecycle command sent"
        );
        Ok(pending)
    }
}
