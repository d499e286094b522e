use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::{Agent, AgentKind};

const DEFAULT_PORT: u16 = 7430;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 30_000;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// One `[[agent]]` table — a statically configured agent identity.
#[derive(Debug, Clone, Deserialize)]
struct TomlAgent {
    host_id: String,
    kind: AgentKind,
    agent_key: String,
}

impl From<TomlAgent> for Agent {
    fn from(a: TomlAgent) -> Self {
        Agent {
            host_id: a.host_id,
            kind: a.kind,
            agent_key: a.agent_key,
        }
    }
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Agent socket server port (default: 7430).
    port: Option<u16>,
    /// Bind address for the socket server (default: "127.0.0.1"; use "0.0.0.0" for LAN agents).
    bind_address: Option<String>,
    /// Log level filter string, e.g. "debug", "info,dominod=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default, human-readable) | "json" (structured for log aggregators).
    log_format: Option<String>,
    /// How long an in-flight lifecycle command may wait for its reply (milliseconds).
    operation_timeout_ms: Option<u64>,
    /// Statically configured agent identities (`[[agent]]`).
    agent: Option<Vec<TomlAgent>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            // Config is loaded before the tracing subscriber exists, so this
            // goes straight to stderr.
            eprintln!(
                "warn: failed to parse '{}': {e} — using defaults",
                path.display()
            );
            None
        }
    }
}

// ─── CoordinatorConfig ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" | "json" (DOMINO_LOG_FORMAT env var).
    pub log_format: String,
    /// Bind address for the agent socket server (DOMINO_BIND env var).
    pub bind_address: String,
    /// Reply deadline for in-flight lifecycle commands.
    pub operation_timeout_ms: u64,
    /// Immutable known-agent list, in selection order.
    pub agents: Vec<Agent>,
}

impl CoordinatorConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let log_format = std::env::var("DOMINO_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let bind_address = bind_address
            .or(std::env::var("DOMINO_BIND").ok().filter(|s| !s.is_empty()))
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);

        let operation_timeout_ms = std::env::var("DOMINO_OPERATION_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .or(toml.operation_timeout_ms)
            .unwrap_or(DEFAULT_OPERATION_TIMEOUT_MS);

        let agents = toml
            .agent
            .unwrap_or_default()
            .into_iter()
            .map(Agent::from)
            .collect();

        Self {
            port,
            data_dir,
            log,
            log_format,
            bind_address,
            operation_timeout_ms,
            agents,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/domino
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("domino");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/domino or ~/.local/share/domino
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("domino");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("domino");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\domino
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("domino");
        }
    }
    // Fallback
    PathBuf::from(".domino")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.operation_timeout_ms, DEFAULT_OPERATION_TIMEOUT_MS);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn toml_overrides_defaults_and_cli_overrides_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
port = 9000
operation_timeout_ms = 5000

[[agent]]
host_id = "h1"
kind = "DOCKER"
agent_key = "k1"

[[agent]]
host_id = "h2"
kind = "PROCESS"
agent_key = "k2"
"#,
        )
        .unwrap();

        let config = CoordinatorConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(config.port, 9000);
        assert_eq!(config.operation_timeout_ms, 5000);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].host_id, "h1");
        assert_eq!(config.agents[1].kind, AgentKind::Process);

        // CLI wins over TOML.
        let config = CoordinatorConfig::new(Some(9001), Some(dir.path().to_path_buf()), None, None);
        assert_eq!(config.port, 9001);
    }

    #[test]
    fn log_settings_flow_from_toml_without_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
log = "debug"
log_format = "json"
"#,
        )
        .unwrap();

        let config = CoordinatorConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(config.log, "debug");
        assert_eq!(config.log_format, "json");

        // CLI log level still wins when given.
        let config = CoordinatorConfig::new(
            None,
            Some(dir.path().to_path_buf()),
            Some("trace".to_string()),
            None,
        );
        assert_eq!(config.log, "trace");
        assert_eq!(config.log_format, "json");
    }
}
