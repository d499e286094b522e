//! Agent connection registry — the coordinator-side connection state machine.
//!
//! The registry owns two pieces of state: the immutable list of known agents
//! (configuration order, which is also the selection order) and a map from
//! agent identity to its connection entry. Entries are created on first
//! announcement and never removed — a disconnect only flips `connected` to
//! false, and a later reconnect overwrites the socket handle and flips it
//! back. Agent identity survives transport churn; only the socket reference
//! and the boolean are volatile.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::Agent;
use crate::deployment::Deployment;
use crate::protocol::{Announcement, TrackingOutcome};
use crate::socket::ConnectionHandle;

/// A known agent together with its currently-active socket handle.
#[derive(Debug, Clone)]
pub struct ConnectedAgent {
    pub agent: Agent,
    pub socket: ConnectionHandle,
}

struct ConnectionEntry {
    socket: ConnectionHandle,
    connected: bool,
}

/// Raised by [`AgentRegistry::first_available`] when no connected agent
/// matches a deployment's host list and source kind. Synchronous and
/// non-retried — retry policy belongs to the caller.
#[derive(Debug, thiserror::Error)]
#[error("no eligible agent has connected yet for deployment {deployment}")]
pub struct SelectionError {
    pub deployment: String,
}

/// Tracks which configured agents are connected, disconnected, or unknown.
///
/// All operations are short synchronous map mutations; the mutex is never
/// held across an await point.
pub struct AgentRegistry {
    known: Vec<Agent>,
    entries: Mutex<HashMap<Agent, ConnectionEntry>>,
}

impl AgentRegistry {
    /// Build a registry over the statically configured agent list.
    pub fn new(known: Vec<Agent>) -> Self {
        Self {
            known,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve an announcement against the known-agent list and record the
    /// connection.
    ///
    /// Unknown identity → [`TrackingOutcome::Rejected`], and the socket is
    /// *not* stored — the caller must stop serving the connection. A known
    /// agent with no entry yet is `Tracked`; a known agent with an existing
    /// entry (connected or not) is `Reconnecting` and its socket reference is
    /// overwritten. The overwrite is what makes a crash-and-reconnect
    /// transparent to the rest of the coordinator: the same identity never
    /// gains a second entry.
    pub fn track_agent(&self, announcement: &Announcement, socket: ConnectionHandle) -> TrackingOutcome {
        let Some(agent) = self.known.iter().find(|a| {
            a.host_id == announcement.host_id
                && a.kind == announcement.kind
                && a.agent_key == announcement.agent_key
        }) else {
            warn!(
                host_id = %announcement.host_id,
                kind = %announcement.kind,
                "announcement from unknown agent rejected"
            );
            return TrackingOutcome::Rejected;
        };

        let mut entries = self.entries.lock().expect("agent registry poisoned");
        match entries.insert(
            agent.clone(),
            ConnectionEntry {
                socket,
                connected: true,
            },
        ) {
            None => {
                info!(agent = %agent, "agent tracked");
                TrackingOutcome::Tracked
            }
            Some(_previous) => {
                // The previous socket is deliberately not closed here; its
                // connection task ends on its own when the peer goes away.
                info!(agent = %agent, "agent reconnecting — socket overwritten");
                TrackingOutcome::Reconnecting
            }
        }
    }

    /// Reverse lookup: which agent currently owns this socket?
    ///
    /// Transport-level close/error events carry only a socket handle, not an
    /// agent identity — this scan recovers it.
    pub fn identify_agent(&self, socket_id: Uuid) -> Option<Agent> {
        let entries = self.entries.lock().expect("agent registry poisoned");
        entries
            .iter()
            .find(|(_, entry)| entry.socket.id() == socket_id)
            .map(|(agent, _)| agent.clone())
    }

    /// Flip the owning entry to disconnected. A disconnect event for a socket
    /// no entry holds (never announced, or already superseded by a reconnect)
    /// is logged and ignored — it must never take the coordinator down.
    pub fn mark_agent_disconnected(&self, socket_id: Uuid) {
        let mut entries = self.entries.lock().expect("agent registry poisoned");
        let owner = entries
            .iter_mut()
            .find(|(_, entry)| entry.socket.id() == socket_id);
        match owner {
            Some((agent, entry)) => {
                entry.connected = false;
                info!(agent = %agent, "agent disconnected");
            }
            None => {
                warn!(socket = %socket_id, "disconnect for unidentified socket — ignoring");
            }
        }
    }

    /// Select the first connected agent eligible for a deployment: host in
    /// `deployment.target.hosts`, kind matching `deployment.source`, entry
    /// connected. Iteration follows the configured agent list order, so the
    /// choice is deterministic. Exactly one agent is selected — multi-instance
    /// routing is a known limitation, not a bug.
    pub fn first_available(&self, deployment: &Deployment) -> Result<ConnectedAgent, SelectionError> {
        let entries = self.entries.lock().expect("agent registry poisoned");
        self.known
            .iter()
            .filter(|a| {
                deployment.target.hosts.iter().any(|h| h == &a.host_id)
                    && a.kind == deployment.source.kind
            })
            .find_map(|a| {
                entries
                    .get(a)
                    .filter(|entry| entry.connected)
                    .map(|entry| ConnectedAgent {
                        agent: a.clone(),
                        socket: entry.socket.clone(),
                    })
            })
            .ok_or_else(|| SelectionError {
                deployment: deployment.id.clone(),
            })
    }

    /// Number of agents currently marked connected (liveness reporting).
    pub fn connected_count(&self) -> usize {
        let entries = self.entries.lock().expect("agent registry poisoned");
        entries.values().filter(|e| e.connected).count()
    }

    /// The configured agent list, in selection order.
    pub fn known_agents(&self) -> &[Agent] {
        &self.known
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentKind;
    use crate::deployment::{Deployment, HealthcheckConfig, SourceSpec, TargetSpec};

    fn agent(host: &str, kind: AgentKind, key: &str) -> Agent {
        Agent {
            host_id: host.to_string(),
            kind,
            agent_key: key.to_string(),
        }
    }

    fn announcement(host: &str, kind: AgentKind, key: &str) -> Announcement {
        Announcement {
            host_id: host.to_string(),
            kind,
            agent_key: key.to_string(),
        }
    }

    fn deployment(id: &str, kind: AgentKind, hosts: &[&str]) -> Deployment {
        Deployment {
            id: id.to_string(),
            source: SourceSpec { kind },
            target: TargetSpec {
                hosts: hosts.iter().map(|h| h.to_string()).collect(),
            },
            healthcheck: HealthcheckConfig::default(),
            definition: serde_json::json!({}),
        }
    }

    fn handle() -> ConnectionHandle {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        ConnectionHandle::new(tx)
    }

    #[test]
    fn unknown_agent_is_rejected_without_an_entry() {
        let registry = AgentRegistry::new(vec![agent("h1", AgentKind::Docker, "k1")]);
        let socket = handle();
        let outcome = registry.track_agent(&announcement("h9", AgentKind::Docker, "k1"), socket.clone());
        assert_eq!(outcome, TrackingOutcome::Rejected);
        assert!(registry.identify_agent(socket.id()).is_none());
    }

    #[test]
    fn first_announcement_tracks_then_reconnect_supersedes() {
        let registry = AgentRegistry::new(vec![agent("h1", AgentKind::Docker, "k1")]);
        let s1 = handle();
        let s2 = handle();

        let outcome = registry.track_agent(&announcement("h1", AgentKind::Docker, "k1"), s1.clone());
        assert_eq!(outcome, TrackingOutcome::Tracked);

        registry.mark_agent_disconnected(s1.id());

        let outcome = registry.track_agent(&announcement("h1", AgentKind::Docker, "k1"), s2.clone());
        assert_eq!(outcome, TrackingOutcome::Reconnecting);

        assert_eq!(
            registry.identify_agent(s2.id()).unwrap().host_id,
            "h1",
            "new socket must resolve to the agent"
        );
        assert!(
            registry.identify_agent(s1.id()).is_none(),
            "superseded socket must no longer resolve"
        );
    }

    #[test]
    fn reconnect_without_disconnect_also_supersedes() {
        let registry = AgentRegistry::new(vec![agent("h1", AgentKind::Docker, "k1")]);
        let s1 = handle();
        let s2 = handle();
        registry.track_agent(&announcement("h1", AgentKind::Docker, "k1"), s1);
        let outcome = registry.track_agent(&announcement("h1", AgentKind::Docker, "k1"), s2);
        assert_eq!(outcome, TrackingOutcome::Reconnecting);
    }

    #[test]
    fn disconnect_for_unknown_socket_is_a_no_op() {
        let registry = AgentRegistry::new(vec![agent("h1", AgentKind::Docker, "k1")]);
        registry.mark_agent_disconnected(Uuid::new_v4());
        assert_eq!(registry.connected_count(), 0);
    }

    #[test]
    fn first_available_requires_host_kind_and_connection() {
        let registry = AgentRegistry::new(vec![
            agent("h1", AgentKind::Process, "k1"),
            agent("h2", AgentKind::Docker, "k2"),
            agent("h3", AgentKind::Docker, "k3"),
        ]);
        let d = deployment("web", AgentKind::Docker, &["h1", "h2", "h3"]);

        // Nothing connected yet.
        assert!(registry.first_available(&d).is_err());

        // h1 has the wrong kind; connecting it must not satisfy the deployment.
        registry.track_agent(&announcement("h1", AgentKind::Process, "k1"), handle());
        assert!(registry.first_available(&d).is_err());

        // h3 connects — eligible.
        let s3 = handle();
        registry.track_agent(&announcement("h3", AgentKind::Docker, "k3"), s3.clone());
        let selected = registry.first_available(&d).unwrap();
        assert_eq!(selected.agent.host_id, "h3");

        // h2 connects — earlier in configured order, wins from now on.
        registry.track_agent(&announcement("h2", AgentKind::Docker, "k2"), handle());
        let selected = registry.first_available(&d).unwrap();
        assert_eq!(selected.agent.host_id, "h2");

        // Disconnect h2 — selection falls back to h3.
        let h2_socket = registry
            .first_available(&d)
            .map(|c| c.socket.id())
            .unwrap();
        registry.mark_agent_disconnected(h2_socket);
        let selected = registry.first_available(&d).unwrap();
        assert_eq!(selected.agent.host_id, "h3");
    }

    #[test]
    fn deployment_targeting_no_known_host_fails() {
        let registry = AgentRegistry::new(vec![agent("h1", AgentKind::Docker, "k1")]);
        registry.track_agent(&announcement("h1", AgentKind::Docker, "k1"), handle());
        let d = deployment("web", AgentKind::Docker, &["elsewhere"]);
        let err = registry.first_available(&d).unwrap_err();
        assert!(err.to_string().contains("no eligible agent"));
    }
}
