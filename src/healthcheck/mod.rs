//! Post-start health verification.
//!
//! "Process started" is not "process healthy". After a successful start or
//! restart, the coordinator polls the deployment's HTTP health endpoint a
//! bounded number of times and turns the outcome into a terminal
//! [`DeploymentStatus`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::deployment::HealthcheckConfig;
use crate::protocol::DeploymentStatus;

/// Synthetic status code fed to the interpreter when the request itself
/// failed (connection refused, per-request timeout). Transport failures are
/// just another unhealthy response; they never abort the polling loop.
const SERVICE_UNAVAILABLE: u16 = 503;

// ─── Attempt ──────────────────────────────────────────────────────────────────

/// Bounded retry counter. `attempted()` counts one poll down; the derived
/// reads tell the loop (and the interpreter) where it stands.
#[derive(Debug, Clone)]
pub struct Attempt {
    max_attempts: u32,
    remaining: u32,
}

impl Attempt {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            remaining: max_attempts,
        }
    }

    /// Record one attempt.
    pub fn attempted(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    pub fn attempts_left(&self) -> u32 {
        self.remaining
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_limit_reached(&self) -> bool {
        self.remaining == 0
    }
}

// ─── Response interpretation ──────────────────────────────────────────────────

/// What one poll's status code means for the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Terminal: the deployment is healthy.
    Healthy,
    /// Terminal: the deployment is unhealthy — stop polling.
    Unhealthy,
    /// Keep polling.
    Undecided,
}

/// External collaborator that turns a status code plus the current attempt
/// state into a verdict.
pub trait ResponseInterpreter: Send + Sync {
    fn interpret(&self, status_code: u16, attempt: &Attempt) -> HealthVerdict;
}

/// Default interpretation: any 2xx is healthy, everything else keeps polling
/// (the provider's attempt-exhaustion rule supplies the failure default).
pub struct StatusCodeInterpreter;

impl ResponseInterpreter for StatusCodeInterpreter {
    fn interpret(&self, status_code: u16, _attempt: &Attempt) -> HealthVerdict {
        if (200..300).contains(&status_code) {
            HealthVerdict::Healthy
        } else {
            HealthVerdict::Undecided
        }
    }
}

// ─── Provider ─────────────────────────────────────────────────────────────────

/// Polls a deployment's health endpoint on a fixed period until a terminal
/// verdict is produced or the attempt limit is exhausted.
pub struct HealthcheckProvider {
    http: reqwest::Client,
    interpreter: Arc<dyn ResponseInterpreter>,
}

impl HealthcheckProvider {
    pub fn new() -> Self {
        Self::with_interpreter(Arc::new(StatusCodeInterpreter))
    }

    pub fn with_interpreter(interpreter: Arc<dyn ResponseInterpreter>) -> Self {
        Self {
            http: reqwest::Client::new(),
            interpreter,
        }
    }

    /// Verify a started deployment.
    ///
    /// Disabled health-checking resolves immediately with `UNKNOWN_STARTED`
    /// (health assumed, not verified) and issues no HTTP call. Otherwise the
    /// endpoint is polled every `config.delay` milliseconds with a per-request
    /// timeout of `config.timeout` milliseconds. The loop exits on the first
    /// terminal verdict, or with `HEALTH_CHECK_FAILURE` once the attempt
    /// limit is reached without a healthy response. The ticker lives on this
    /// stack frame, so every exit path tears it down.
    pub async fn execute_healthcheck(
        &self,
        deployment_id: &str,
        config: &HealthcheckConfig,
    ) -> DeploymentStatus {
        if !config.enabled {
            debug!(deployment = deployment_id, "health-checking disabled — assuming started");
            return DeploymentStatus::UnknownStarted;
        }

        let mut attempt = Attempt::new(config.max_attempts);
        let period = Duration::from_millis(config.delay.max(1));
        let per_request = Duration::from_millis(config.timeout.max(1));

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick completes immediately; consume it so the
        // first poll happens one full period after the start, like the rest.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            attempt.attempted();

            let status_code = match self
                .http
                .get(&config.endpoint)
                .timeout(per_request)
                .send()
                .await
            {
                Ok(response) => response.status().as_u16(),
                Err(e) => {
                    debug!(
                        deployment = deployment_id,
                        err = %e,
                        "health request failed — treating as unavailable"
                    );
                    SERVICE_UNAVAILABLE
                }
            };

            match self.interpreter.interpret(status_code, &attempt) {
                HealthVerdict::Healthy => {
                    info!(
                        deployment = deployment_id,
                        attempts_used = attempt.max_attempts() - attempt.attempts_left(),
                        "health check passed"
                    );
                    return DeploymentStatus::HealthCheckOk;
                }
                HealthVerdict::Unhealthy => {
                    warn!(deployment = deployment_id, status_code, "health check failed");
                    return DeploymentStatus::HealthCheckFailure;
                }
                HealthVerdict::Undecided => {}
            }

            if attempt.is_limit_reached() {
                warn!(
                    deployment = deployment_id,
                    max_attempts = attempt.max_attempts(),
                    "health check attempts exhausted"
                );
                return DeploymentStatus::HealthCheckFailure;
            }
        }
    }
}

impl Default for HealthcheckProvider {
    fn default() -> Self {
        Self::new()
    }
}
