//! Wire protocol between the coordinator and remote execution agents.
//!
//! Every frame on an agent connection is a JSON-encoded [`SocketMessage`]
//! envelope: `{ messageID, messageType, payload }`. The `messageID` is the
//! correlation key that ties an asynchronous reply back to the command that
//! caused it; for everything else it is an opaque string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::AgentKind;
use crate::deployment::Deployment;

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// Frame type tag carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Agent → coordinator: identity assertion, first frame after connecting.
    Announcement,
    /// Coordinator → agent: tracking outcome reply to an announcement.
    Confirmation,
    /// Agent → coordinator keepalive.
    Ping,
    /// Coordinator → agent keepalive acknowledgement.
    Pong,
    /// Coordinator → agent: lifecycle command.
    Lifecycle,
    /// Agent → coordinator: lifecycle command result.
    Result,
    /// Agent → coordinator: lifecycle command failure report.
    Failure,
}

/// Protocol envelope. `P` is the per-type payload; inbound frames are first
/// decoded with `P = serde_json::Value` and the payload is interpreted by the
/// handler registered for the frame's type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketMessage<P> {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    pub payload: P,
}

impl<P> SocketMessage<P> {
    pub fn new(message_id: impl Into<String>, message_type: MessageType, payload: P) -> Self {
        Self {
            message_id: message_id.into(),
            message_type,
            payload,
        }
    }
}

/// An inbound frame before its payload has been interpreted.
pub type RawMessage = SocketMessage<Value>;

// ─── Payloads ─────────────────────────────────────────────────────────────────

/// `ANNOUNCEMENT` payload — the identity triple an agent asserts on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(rename = "hostID")]
    pub host_id: String,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    #[serde(rename = "agentKey")]
    pub agent_key: String,
}

/// `CONFIRMATION` payload — how the registry classified an announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirmation {
    pub outcome: TrackingOutcome,
}

/// Outcome of resolving an announcement against the configured agent list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingOutcome {
    /// Known agent, first connection — entry created.
    Tracked,
    /// Known agent with an existing entry — socket overwritten.
    Reconnecting,
    /// Unknown agent — the connection must not be served further.
    Rejected,
}

/// Lifecycle command directed at a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleCommand {
    Deploy,
    Start,
    Stop,
    Restart,
}

impl LifecycleCommand {
    /// Lowercase form used in lifecycle message IDs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleCommand::Deploy => "deploy",
            LifecycleCommand::Start => "start",
            LifecycleCommand::Stop => "stop",
            LifecycleCommand::Restart => "restart",
        }
    }
}

/// `LIFECYCLE` payload — coordinator → agent command envelope body.
///
/// The deployment carried here has already had its secret placeholders
/// resolved; agents never see `[dsm:<key>]` references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleRequest {
    pub deployment: Deployment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub command: LifecycleCommand,
}

/// Terminal (or in-progress) state of a deployment as reported upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Deployed,
    Started,
    Stopped,
    Restarted,
    Failed,
    /// No reply arrived within the operation timeout.
    Timeout,
    /// Health-checking disabled — the process started but health is assumed.
    UnknownStarted,
    HealthCheckOk,
    HealthCheckFailure,
}

/// `RESULT` payload — what an agent reports after executing a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: DeploymentStatus,
    #[serde(rename = "deployOperation")]
    pub deploy_operation: bool,
    #[serde(rename = "deployedVersion", skip_serializing_if = "Option::is_none")]
    pub deployed_version: Option<String>,
}

impl OperationResult {
    /// Synthetic result used when an in-flight command times out.
    pub fn timed_out() -> Self {
        Self {
            status: DeploymentStatus::Timeout,
            deploy_operation: false,
            deployed_version: None,
        }
    }
}

/// `FAILURE` payload — an agent-side error report for an in-flight command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub message: String,
}
