//! Deployment definitions — the named application/service descriptions the
//! coordinator drives lifecycle commands against.
//!
//! Definitions are static configuration, loaded once from
//! `{data_dir}/deployments.toml` (`[[deployment]]` tables). The coordinator
//! consumes them as opaque values: everything an agent needs to execute a
//! command travels inside [`Deployment::definition`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::agents::AgentKind;

// ─── Model ────────────────────────────────────────────────────────────────────

/// Where a deployment's artifact comes from and which agent kind executes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Execution-platform kind an agent must have to run this deployment.
    #[serde(rename = "type")]
    pub kind: AgentKind,
}

/// Which hosts a deployment may land on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Eligible host IDs. Exactly one connected agent is selected from these.
    pub hosts: Vec<String>,
}

/// Per-deployment health-check polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthcheckConfig {
    /// When false, a started deployment is assumed healthy without polling.
    pub enabled: bool,
    /// HTTP endpoint polled after a start/restart.
    pub endpoint: String,
    /// Fixed polling period in milliseconds.
    pub delay: u64,
    /// Per-request timeout in milliseconds.
    pub timeout: u64,
    /// Polling stops (and fails, absent a healthy response) after this many attempts.
    pub max_attempts: u32,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            delay: 2_000,
            timeout: 1_000,
            max_attempts: 5,
        }
    }
}

/// A named application/service definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub source: SourceSpec,
    pub target: TargetSpec,
    #[serde(default)]
    pub healthcheck: HealthcheckConfig,
    /// Opaque execution definition forwarded to the agent. String leaf values
    /// may contain `[dsm:<key>]` secret references, resolved before transmit.
    #[serde(default = "empty_definition")]
    pub definition: Value,
}

fn empty_definition() -> Value {
    Value::Object(serde_json::Map::new())
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// `deployments.toml` shape — a list of `[[deployment]]` tables.
#[derive(Deserialize, Default)]
struct DeploymentsFile {
    #[serde(default)]
    deployment: Vec<Deployment>,
}

/// In-memory, load-once store of all configured deployments.
pub struct DeploymentStore {
    deployments: HashMap<String, Deployment>,
}

impl DeploymentStore {
    /// Load `{data_dir}/deployments.toml`. A missing file is an empty store;
    /// a malformed file is an error (a typo must not silently drop deployments).
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join("deployments.toml");
        let file = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str::<DeploymentsFile>(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DeploymentsFile::default(),
            Err(e) => return Err(e.into()),
        };

        let deployments: HashMap<String, Deployment> = file
            .deployment
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        info!(count = deployments.len(), path = %path.display(), "deployments loaded");
        Ok(Self { deployments })
    }

    /// Build a store directly from definitions (tests, embedded use).
    pub fn from_deployments(deployments: impl IntoIterator<Item = Deployment>) -> Self {
        Self {
            deployments: deployments.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Deployment> {
        self.deployments.get(id)
    }

    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_deployments_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("deployments.toml"),
            r#"
[[deployment]]
id = "web"

[deployment.source]
type = "DOCKER"

[deployment.target]
hosts = ["h1", "h2"]

[deployment.healthcheck]
enabled = true
endpoint = "http://localhost:8080/health"
delay = 500
timeout = 250
max_attempts = 3

[deployment.definition]
image = "registry.example.com/web"
api_token = "[dsm:web.token]"
"#,
        )
        .unwrap();

        let store = DeploymentStore::load(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        let web = store.get("web").unwrap();
        assert_eq!(web.target.hosts, vec!["h1", "h2"]);
        assert!(web.healthcheck.enabled);
        assert_eq!(web.healthcheck.max_attempts, 3);
        assert_eq!(web.definition["api_token"], "[dsm:web.token]");
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeploymentStore::load(dir.path()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deployments.toml"), "[[deployment]\nid=").unwrap();
        assert!(DeploymentStore::load(dir.path()).is_err());
    }
}
