//! Agent identity and connection tracking.

pub mod registry;

pub use registry::{AgentRegistry, ConnectedAgent, SelectionError};

use serde::{Deserialize, Serialize};

/// Execution-platform kind of a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentKind {
    /// Container-runtime agent.
    Docker,
    /// Filesystem/process-spawning agent.
    Process,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Docker => write!(f, "DOCKER"),
            AgentKind::Process => write!(f, "PROCESS"),
        }
    }
}

/// Stable, configuration-sourced identity of a remote agent.
///
/// Loaded once at startup from the `[[agent]]` tables in `config.toml`.
/// Identity is the full triple — socket identity is never part of it, which
/// is what lets an agent survive transport churn across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Agent {
    #[serde(rename = "hostID")]
    pub host_id: String,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    #[serde(rename = "agentKey")]
    pub agent_key: String,
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.host_id, self.kind, self.agent_key)
    }
}
