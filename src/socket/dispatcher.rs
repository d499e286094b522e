//! Inbound frame routing.
//!
//! A connection carries heterogeneous frames; the dispatcher maps each
//! envelope's type tag to its handler. A frame with no registered handler, or
//! a payload that fails to decode, is dropped with a log line — a single
//! malformed or unsupported frame must never terminate the connection it
//! shares with all subsequent traffic for that agent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::agents::AgentRegistry;
use crate::events::EventBroadcaster;
use crate::lifecycle::OperationRegistry;
use crate::protocol::{
    Announcement, Confirmation, FailureReport, MessageType, OperationResult, RawMessage,
    SocketMessage, TrackingOutcome,
};
use crate::socket::ConnectionHandle;

/// Per-type frame handler. Receives the socket so it may reply.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, socket: &ConnectionHandle, frame: RawMessage);
}

/// Tag → handler map over [`MessageType`].
pub struct MessageDispatcher {
    handlers: HashMap<MessageType, Box<dyn FrameHandler>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The standard coordinator wiring: announcement, ping, result, failure.
    pub fn standard(
        agents: Arc<AgentRegistry>,
        operations: Arc<OperationRegistry>,
        broadcaster: EventBroadcaster,
    ) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(
            MessageType::Announcement,
            Box::new(AnnouncementHandler {
                agents,
                broadcaster: broadcaster.clone(),
            }),
        );
        dispatcher.register(MessageType::Ping, Box::new(PingHandler));
        dispatcher.register(
            MessageType::Result,
            Box::new(ResultHandler {
                operations: operations.clone(),
                broadcaster,
            }),
        );
        dispatcher.register(MessageType::Failure, Box::new(FailureHandler { operations }));
        dispatcher
    }

    pub fn register(&mut self, message_type: MessageType, handler: Box<dyn FrameHandler>) {
        self.handlers.insert(message_type, handler);
    }

    /// Route one inbound frame. Unknown types are dropped with a log line,
    /// never raised.
    pub async fn process(&self, socket: &ConnectionHandle, frame: RawMessage) {
        match self.handlers.get(&frame.message_type) {
            Some(handler) => handler.handle(socket, frame).await,
            None => {
                warn!(
                    message_type = ?frame.message_type,
                    message_id = %frame.message_id,
                    "no handler for message type — frame dropped"
                );
            }
        }
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// `ANNOUNCEMENT` → track the agent, reply with the outcome. A rejected
/// announcement additionally closes the connection: the registry did not
/// store the socket and nothing further may be served on it.
struct AnnouncementHandler {
    agents: Arc<AgentRegistry>,
    broadcaster: EventBroadcaster,
}

#[async_trait]
impl FrameHandler for AnnouncementHandler {
    async fn handle(&self, socket: &ConnectionHandle, frame: RawMessage) {
        let announcement: Announcement = match serde_json::from_value(frame.payload) {
            Ok(a) => a,
            Err(e) => {
                warn!(message_id = %frame.message_id, err = %e, "malformed announcement dropped");
                return;
            }
        };

        let outcome = self.agents.track_agent(&announcement, socket.clone());
        let reply = SocketMessage::new(
            frame.message_id,
            MessageType::Confirmation,
            Confirmation { outcome },
        );
        if let Err(e) = socket.send(&reply).await {
            warn!(err = %e, "confirmation send failed");
            return;
        }

        match outcome {
            TrackingOutcome::Rejected => socket.close().await,
            TrackingOutcome::Tracked | TrackingOutcome::Reconnecting => {
                self.broadcaster.broadcast(
                    "agent.connected",
                    json!({
                        "hostID": announcement.host_id,
                        "type": announcement.kind,
                        "agentKey": announcement.agent_key,
                        "outcome": outcome,
                    }),
                );
            }
        }
    }
}

/// `PING` → `PONG` with the same message ID. No state change.
struct PingHandler;

#[async_trait]
impl FrameHandler for PingHandler {
    async fn handle(&self, socket: &ConnectionHandle, frame: RawMessage) {
        let reply = SocketMessage::new(frame.message_id, MessageType::Pong, json!({}));
        if let Err(e) = socket.send(&reply).await {
            warn!(err = %e, "pong send failed");
        }
    }
}

/// `RESULT` → settle the correlated in-flight command.
struct ResultHandler {
    operations: Arc<OperationRegistry>,
    broadcaster: EventBroadcaster,
}

#[async_trait]
impl FrameHandler for ResultHandler {
    async fn handle(&self, _socket: &ConnectionHandle, frame: RawMessage) {
        let result: OperationResult = match serde_json::from_value(frame.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(message_id = %frame.message_id, err = %e, "malformed result dropped");
                return;
            }
        };
        debug!(message_id = %frame.message_id, status = ?result.status, "result frame");
        let status = result.status;
        // Duplicate or post-timeout results settle nothing and must not emit
        // a settlement event.
        if self.operations.operation_finished(&frame.message_id, result) {
            self.broadcaster.broadcast(
                "operation.settled",
                json!({ "messageID": frame.message_id, "status": status }),
            );
        }
    }
}

/// `FAILURE` → reject the correlated in-flight command.
struct FailureHandler {
    operations: Arc<OperationRegistry>,
}

#[async_trait]
impl FrameHandler for FailureHandler {
    async fn handle(&self, _socket: &ConnectionHandle, frame: RawMessage) {
        let failure: FailureReport = match serde_json::from_value(frame.payload) {
            Ok(f) => f,
            Err(e) => {
                warn!(message_id = %frame.message_id, err = %e, "malformed failure report dropped");
                return;
            }
        };
        self.operations.operation_failed(&frame.message_id, failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeploymentStatus;
    use tokio::sync::mpsc;

    fn connection() -> (ConnectionHandle, mpsc::Receiver<crate::socket::Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(tx), rx)
    }

    fn standard_dispatcher() -> (MessageDispatcher, Arc<OperationRegistry>) {
        let agents = Arc::new(AgentRegistry::new(vec![]));
        let operations = Arc::new(OperationRegistry::new(std::time::Duration::from_secs(5)));
        let dispatcher =
            MessageDispatcher::standard(agents, operations.clone(), EventBroadcaster::new());
        (dispatcher, operations)
    }

    #[tokio::test]
    async fn unknown_message_type_is_dropped_without_replying() {
        let (dispatcher, _) = standard_dispatcher();
        let (socket, mut rx) = connection();

        // CONFIRMATION is coordinator → agent only; no handler is registered.
        let frame = SocketMessage::new("x", MessageType::Confirmation, json!({}));
        dispatcher.process(&socket, frame).await;
        assert!(rx.try_recv().is_err(), "no reply expected");
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong_sharing_the_id() {
        let (dispatcher, _) = standard_dispatcher();
        let (socket, mut rx) = connection();

        let frame = SocketMessage::new("keepalive-7", MessageType::Ping, json!({}));
        dispatcher.process(&socket, frame).await;

        let out = rx.try_recv().expect("pong frame queued");
        let crate::socket::Outbound::Frame(text) = out else {
            panic!("expected a frame");
        };
        let reply: RawMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(reply.message_type, MessageType::Pong);
        assert_eq!(reply.message_id, "keepalive-7");
    }

    #[tokio::test]
    async fn result_frame_settles_the_matching_operation() {
        let (dispatcher, operations) = standard_dispatcher();
        let (socket, _rx) = connection();

        let pending = operations.operation_started("m1");
        let frame = SocketMessage::new(
            "m1",
            MessageType::Result,
            json!({"status": "DEPLOYED", "deployOperation": true}),
        );
        dispatcher.process(&socket, frame).await;

        let result = pending.wait().await.unwrap();
        assert_eq!(result.status, DeploymentStatus::Deployed);
    }

    #[tokio::test]
    async fn duplicate_result_emits_no_second_settlement_event() {
        let agents = Arc::new(AgentRegistry::new(vec![]));
        let operations = Arc::new(OperationRegistry::new(std::time::Duration::from_secs(5)));
        let broadcaster = EventBroadcaster::new();
        let mut events = broadcaster.subscribe();
        let dispatcher = MessageDispatcher::standard(agents, operations.clone(), broadcaster);
        let (socket, _rx) = connection();

        let pending = operations.operation_started("m1");
        let frame = SocketMessage::new(
            "m1",
            MessageType::Result,
            json!({"status": "DEPLOYED", "deployOperation": true}),
        );
        dispatcher.process(&socket, frame.clone()).await;
        pending.wait().await.unwrap();
        assert!(events.try_recv().is_ok(), "first result must emit operation.settled");

        // Late duplicate settles nothing — no event.
        dispatcher.process(&socket, frame).await;
        assert!(events.try_recv().is_err(), "duplicate result must not emit an event");
    }

    #[tokio::test]
    async fn malformed_result_payload_is_dropped() {
        let (dispatcher, operations) = standard_dispatcher();
        let (socket, _rx) = connection();

        let _pending = operations.operation_started("m1");
        let frame = SocketMessage::new("m1", MessageType::Result, json!({"status": 42}));
        dispatcher.process(&socket, frame).await;
        assert_eq!(operations.in_flight(), 1, "operation must remain pending");
    }

    #[tokio::test]
    async fn failure_frame_rejects_the_matching_operation() {
        let (dispatcher, operations) = standard_dispatcher();
        let (socket, _rx) = connection();

        let pending = operations.operation_started("m1");
        let frame = SocketMessage::new(
            "m1",
            MessageType::Failure,
            json!({"message": "container exited"}),
        );
        dispatcher.process(&socket, frame).await;

        let err = pending.wait().await.unwrap_err();
        assert!(err.to_string().contains("container exited"));
    }
}
