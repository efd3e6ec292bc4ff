//! Engine configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::trading::SizingConfig;

/// How wallet tasks learn about new transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// One push-subscription channel per wallet
    Push,
    /// Periodic history polling per wallet
    Poll,
}

impl DetectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMode::Push => "push",
            DetectionMode::Poll => "poll",
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "push" | "subscribe" | "ws" => Ok(Self::Push),
            "poll" | "polling" => Ok(Self::Poll),
            other => Err(format!("unknown detection mode '{}' (expected push or poll)", other)),
        }
    }
}

/// Bounded exponential backoff for detector reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Randomization factor in [0, 1); 0 disables jitter
    pub jitter: f64,
    /// Consecutive failures before the task gives up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
            max_attempts: 5,
        }
    }
}

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory reconciliation cadence
    pub reconcile_interval: Duration,

    pub mode: DetectionMode,

    /// History polling cadence (poll mode)
    pub poll_interval: Duration,

    /// History entries fetched per poll
    pub history_limit: usize,

    /// Deadline for each ledger call
    pub call_timeout: Duration,

    pub reconnect: ReconnectPolicy,

    pub sizing: SizingConfig,

    /// Run every check but never submit
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            mode: DetectionMode::Push,
            poll_interval: Duration::from_secs(10),
            history_limit: 20,
            call_timeout: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
            sizing: SizingConfig::default(),
            dry_run: false,
        }
    }
}
