//! In-flight lifecycle command correlation.
//!
//! A lifecycle call looks synchronous to its caller but is an asynchronous
//! round trip over an agent socket: the command is transmitted, and the reply
//! arrives later on the inbound frame path, matched back purely by
//! `messageID`. This registry is the seam between those two execution
//! contexts.
//!
//! Settlement is exactly-once per message ID. The map entry is removed as the
//! settlement decision: whichever path (result, failure, timeout) removes the
//! entry wins, and every later attempt finds nothing and becomes a logged
//! no-op. No second flag is kept — "does the entry still exist" is the whole
//! discipline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::lifecycle::LifecycleError;
use crate::protocol::{FailureReport, OperationResult};

type Settlement = Result<OperationResult, FailureReport>;

/// Ephemeral per-command state: the settlement channel plus the timeout task.
/// Exists only between `operation_started` and settlement.
struct ActiveCommand {
    settle: oneshot::Sender<Settlement>,
    timer: JoinHandle<()>,
}

/// The caller-visible side of an in-flight command.
///
/// Resolves when the correlated reply arrives or the operation times out.
/// Timeout is a normal result value (`status = TIMEOUT`), not an error —
/// callers branch on status to detect it.
#[derive(Debug)]
pub struct PendingOperation {
    rx: oneshot::Receiver<Settlement>,
}

impl PendingOperation {
    /// Suspend until the command settles.
    pub async fn wait(self) -> Result<OperationResult, LifecycleError> {
        match self.rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(failure)) => Err(LifecycleError::AgentFailure {
                message: failure.message,
            }),
            // Sender dropped without settling — only happens when the command
            // was discarded (e.g. the transmit failed after registration).
            Err(_) => Err(LifecycleError::CommandDropped),
        }
    }
}

/// Correlates outbound command IDs to pending caller-visible futures, with
/// timeout-driven settlement.
pub struct OperationRegistry {
    operation_timeout: Duration,
    pending: Arc<Mutex<HashMap<String, ActiveCommand>>>,
}

impl OperationRegistry {
    pub fn new(operation_timeout: Duration) -> Self {
        Self {
            operation_timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register an in-flight command and hand back its future.
    ///
    /// Arms a timer for the operation timeout; if neither
    /// [`operation_finished`](Self::operation_finished) nor
    /// [`operation_failed`](Self::operation_failed) runs first, the timer
    /// *resolves* the future with a synthetic `{status: TIMEOUT,
    /// deployOperation: false}` result and removes the entry.
    pub fn operation_started(&self, message_id: &str) -> PendingOperation {
        let (tx, rx) = oneshot::channel();

        let pending = Arc::clone(&self.pending);
        let id = message_id.to_string();
        let timeout = self.operation_timeout;

        // The timer is spawned and the entry inserted under the same lock the
        // timer must take to remove it, so even a zero timeout cannot fire
        // before the entry exists.
        let mut map = self.pending.lock().expect("operation registry poisoned");
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let command = pending.lock().expect("operation registry poisoned").remove(&id);
            if let Some(command) = command {
                warn!(message_id = %id, timeout_ms = timeout.as_millis() as u64, "operation timed out");
                let _ = command.settle.send(Ok(OperationResult::timed_out()));
            }
        });
        let previous = map.insert(message_id.to_string(), ActiveCommand { settle: tx, timer });
        if let Some(previous) = previous {
            // The ID generation scheme makes this unreachable in practice.
            warn!(message_id, "duplicate in-flight message ID — previous command dropped");
            previous.timer.abort();
        }

        PendingOperation { rx }
    }

    /// Resolve the command with an agent-reported result. Unknown IDs
    /// (already settled, timed out, or never started) are a logged no-op —
    /// this covers duplicate delivery and post-timeout arrivals. Returns
    /// whether an in-flight command was actually settled.
    pub fn operation_finished(&self, message_id: &str, result: OperationResult) -> bool {
        match self.take(message_id) {
            Some(command) => {
                command.timer.abort();
                debug!(message_id, status = ?result.status, "operation finished");
                let _ = command.settle.send(Ok(result));
                true
            }
            None => {
                warn!(message_id, "result for unknown message ID — dropped");
                false
            }
        }
    }

    /// Reject the command with an agent-reported failure. Same lookup and
    /// removal discipline as [`operation_finished`](Self::operation_finished).
    pub fn operation_failed(&self, message_id: &str, failure: FailureReport) {
        match self.take(message_id) {
            Some(command) => {
                command.timer.abort();
                warn!(message_id, error = %failure.message, "operation failed");
                let _ = command.settle.send(Err(failure));
            }
            None => {
                warn!(message_id, "failure for unknown message ID — dropped");
            }
        }
    }

    /// Drop a just-registered command without settling it (transmit failed
    /// before anyone could await the future).
    pub fn discard(&self, message_id: &str) {
        if let Some(command) = self.take(message_id) {
            command.timer.abort();
            debug!(message_id, "operation discarded");
        }
    }

    /// Number of commands currently awaiting settlement.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().expect("operation registry poisoned").len()
    }

    fn take(&self, message_id: &str) -> Option<ActiveCommand> {
        self.pending
            .lock()
            .expect("operation registry poisoned")
            .remove(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeploymentStatus;

    fn deployed() -> OperationResult {
        OperationResult {
            status: DeploymentStatus::Deployed,
            deploy_operation: true,
            deployed_version: Some("1.0.0".to_string()),
        }
    }

    #[tokio::test]
    async fn finish_resolves_the_pending_future() {
        let registry = OperationRegistry::new(Duration::from_secs(5));
        let pending = registry.operation_started("m1");
        registry.operation_finished("m1", deployed());

        let result = pending.wait().await.unwrap();
        assert_eq!(result.status, DeploymentStatus::Deployed);
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn duplicate_finish_is_a_no_op() {
        let registry = OperationRegistry::new(Duration::from_secs(5));
        let pending = registry.operation_started("m1");
        registry.operation_finished("m1", deployed());
        // Late duplicate — must neither panic nor disturb anything.
        registry.operation_finished("m1", deployed());
        assert_eq!(pending.wait().await.unwrap().status, DeploymentStatus::Deployed);
    }

    #[tokio::test]
    async fn failure_rejects_with_the_agent_message() {
        let registry = OperationRegistry::new(Duration::from_secs(5));
        let pending = registry.operation_started("m1");
        registry.operation_failed(
            "m1",
            FailureReport {
                message: "image pull failed".to_string(),
            },
        );

        let err = pending.wait().await.unwrap_err();
        assert!(err.to_string().contains("image pull failed"));
    }

    #[tokio::test]
    async fn timeout_resolves_with_a_synthetic_result() {
        let registry = OperationRegistry::new(Duration::from_millis(50));
        let pending = registry.operation_started("m1");

        let start = std::time::Instant::now();
        let result = pending.wait().await.unwrap();
        assert_eq!(result.status, DeploymentStatus::Timeout);
        assert!(!result.deploy_operation);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn zero_timeout_still_settles_instead_of_hanging() {
        let registry = OperationRegistry::new(Duration::ZERO);
        let pending = registry.operation_started("m1");

        let result = tokio::time::timeout(Duration::from_secs(1), pending.wait())
            .await
            .expect("must settle, not hang")
            .unwrap();
        assert_eq!(result.status, DeploymentStatus::Timeout);
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn finish_before_timeout_wins() {
        let registry = OperationRegistry::new(Duration::from_millis(50));
        let pending = registry.operation_started("m1");
        registry.operation_finished("m1", deployed());

        // Give the (aborted) timer every chance to have fired wrongly.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let result = pending.wait().await.unwrap();
        assert_eq!(result.status, DeploymentStatus::Deployed);
    }

    #[tokio::test]
    async fn finish_and_failure_for_unknown_ids_do_not_panic() {
        let registry = OperationRegistry::new(Duration::from_secs(5));
        registry.operation_finished("never-started", deployed());
        registry.operation_failed(
            "never-started",
            FailureReport {
                message: "late".to_string(),
            },
        );
    }

    #[tokio::test]
    async fn discard_removes_without_settling() {
        let registry = OperationRegistry::new(Duration::from_secs(5));
        let pending = registry.operation_started("m1");
        registry.discard("m1");
        assert_eq!(registry.in_flight(), 0);
        assert!(matches!(
            pending.wait().await,
            Err(LifecycleError::CommandDropped)
        ));
    }
}
