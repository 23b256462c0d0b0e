//! Health probing with bounded exponential backoff

use crate::config::schema::ServicesConfig;
use crate::error::{KilnError, KilnResult};
use crate::runtime::{ContainerRuntime, SandboxHandle};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// How readiness of a service is established
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
    /// A TCP connect to the given service port succeeds
    Tcp { port: u16 },
    /// A command run inside the service sandbox exits 0
    Exec { command: Vec<String> },
    /// Ready as soon as it is launched
    #[default]
    None,
}

/// Retry schedule for health probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl HealthPolicy {
    pub fn from_config(config: &ServicesConfig) -> Self {
        Self {
            max_attempts: config.health_max_attempts.max(1),
            interval: Duration::from_millis(config.health_interval_ms),
            max_interval: Duration::from_millis(config.health_max_interval_ms),
            timeout: Duration::from_millis(config.health_timeout_ms),
        }
    }

    /// Per-service attempt override
    pub fn with_attempts(mut self, attempts: Option<u32>) -> Self {
        if let Some(attempts) = attempts {
            self.max_attempts = attempts.max(1);
        }
        self
    }

    /// Delay after failed attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.interval
            .checked_mul(factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    /// Upper bound on the time spent before giving up
    pub fn budget(&self) -> Duration {
        let delays: Duration = (1..self.max_attempts).map(|a| self.delay(a)).sum();
        delays + self.timeout * self.max_attempts
    }
}

/// Probe until healthy or the attempt budget is spent
///
/// Returns the number of attempts used. A probe that errors counts as a
/// failed attempt.
pub async fn wait_healthy(
    runtime: &dyn ContainerRuntime,
    handle: &SandboxHandle,
    check: &HealthCheck,
    policy: &HealthPolicy,
) -> KilnResult<u32> {
    if *check == HealthCheck::None {
        return Ok(0);
    }

    for attempt in 1..=policy.max_attempts {
        match runtime.probe(handle, check, policy.timeout).await {
            Ok(true) => {
                debug!("{} healthy after {} probe(s)", handle.hostname, attempt);
                return Ok(attempt);
            }
            Ok(false) => {}
            Err(e) => debug!("Probe of {} errored: {}", handle.hostname, e),
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.delay(attempt)).await;
        }
    }

    Err(KilnError::ServiceUnhealthy {
        hostname: handle.hostname.clone(),
        attempts: policy.max_attempts,
    })
}
