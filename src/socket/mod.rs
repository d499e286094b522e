//! Agent socket server.
//!
//! One persistent WebSocket connection per agent, JSON text frames. The
//! server shares its port with a plain HTTP `GET /health` liveness endpoint
//! so operators can probe the coordinator without a WS library.
//!
//! Each connection runs a single select loop: inbound frames are routed
//! through the [`MessageDispatcher`]; outbound frames arrive over an mpsc
//! channel whose sender is the connection's [`ConnectionHandle`] — the same
//! handle the registry stores and the lifecycle service transmits on.

pub mod dispatcher;

pub use dispatcher::{FrameHandler, MessageDispatcher};

use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{RawMessage, SocketMessage};
use crate::AppContext;

// ─── Connection handle ────────────────────────────────────────────────────────

/// Instruction for a connection's writer half.
#[derive(Debug)]
pub enum Outbound {
    Frame(String),
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("agent connection closed")]
    ConnectionClosed,
    #[error("frame serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Cloneable sending side of one agent connection.
///
/// Identity is the generated `id`, never the channel — two handles compare
/// equal iff they belong to the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serialize and queue an envelope for transmission.
    pub async fn send<P: Serialize>(&self, frame: &SocketMessage<P>) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)?;
        self.tx
            .send(Outbound::Frame(text))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Ask the connection to close after flushing queued frames.
    pub async fn close(&self) {
        let _ = self.tx.send(Outbound::Close).await;
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

// ─── Server ──────────────────────────────────────────────────────────────────

/// Bind the configured address and serve until shutdown.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "agent socket server listening (WebSocket + HTTP health on same port)");
    serve(listener, ctx).await
}

/// Serve on an already-bound listener. Split out so tests can bind port 0.
pub async fn serve(listener: TcpListener, ctx: Arc<AppContext>) -> Result<()> {
    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    // Pinned so we can use it in the select! loop without moving.
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping agent socket server");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("agent socket server stopped");
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Respond to an HTTP `GET /health` request with a JSON status document.
async fn handle_health_probe(mut stream: tokio::net::TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request (we don't inspect it — any GET /health is fine).
    let mut req_buf = vec![0u8; 2048];
    let _ = stream.read(&mut req_buf).await;

    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "knownAgents": ctx.agent_registry.known_agents().len(),
        "connectedAgents": ctx.agent_registry.connected_count(),
        "inFlightOperations": ctx.operations.in_flight(),
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Peek for "GET /health" to tell liveness probes apart from WebSocket
    // upgrades; both start with "GET " on the shared port.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 11 && &peek_buf[..11] == b"GET /health" {
        return handle_health_probe(stream, &ctx).await;
    }

    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);
    let handle = ConnectionHandle::new(out_tx);
    debug!(socket = %handle.id(), "agent connection open");

    loop {
        tokio::select! {
            // Inbound frame from the agent.
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RawMessage>(&text) {
                            Ok(frame) => ctx.dispatcher.process(&handle, frame).await,
                            Err(e) => {
                                // A malformed frame is dropped; the connection
                                // carries all of this agent's traffic and must
                                // survive one bad message.
                                warn!(socket = %handle.id(), err = %e, "malformed frame dropped");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(socket = %handle.id(), err = %e, "socket error");
                        break;
                    }
                    _ => {}
                }
            }
            // Outbound frame queued by a handler or the lifecycle service.
            out = out_rx.recv() => {
                match out {
                    Some(Outbound::Frame(text)) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!(socket = %handle.id(), err = %e, "send error");
                            break;
                        }
                    }
                    Some(Outbound::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // Transport gone — flip the owning entry (if any) to disconnected. A
    // socket no entry holds (rejected, or superseded by a reconnect) is a
    // logged no-op inside the registry.
    if let Some(agent) = ctx.agent_registry.identify_agent(handle.id()) {
        ctx.broadcaster.broadcast(
            "agent.disconnected",
            serde_json::json!({
                "hostID": agent.host_id,
                "type": agent.kind,
                "agentKey": agent.agent_key,
            }),
        );
    }
    ctx.agent_registry.mark_agent_disconnected(handle.id());
    debug!(socket = %handle.id(), "agent connection closed");
    Ok(())
}
