use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

pub const DEFAULT_MAX_SLEEP_MS: u64 = 1_000; // re-scan at least once a second
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
pub const DEFAULT_FAILURE_CHANNEL_CAPACITY: usize = 256;

/// What the dispatch loop does when a job comes due while an earlier
/// invocation of the same job is still executing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Dispatch the new occurrence concurrently with the running one.
    #[default]
    Allow,
    /// Hold the occurrence until the running invocation reports back.
    Serialize,
}

/// Engine tunables (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on a single dispatch-loop sleep, even when no job is due.
    pub max_sleep_ms: u64,
    /// How long `shutdown()` waits for in-flight executions before giving up.
    pub shutdown_grace_ms: u64,
    pub overlap: OverlapPolicy,
    /// Buffer size of the failure observer channel.
    pub failure_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_sleep_ms: DEFAULT_MAX_SLEEP_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            overlap: OverlapPolicy::Allow,
            failure_channel_capacity: DEFAULT_FAILURE_CHANNEL_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Uses the explicit path when given, otherwise `~/.cadence/cadence.toml`.
    /// A missing file is not an error: every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_"))
            .extract()
            .map_err(|e| SchedulerError::Config(e.to_string()))
    }

    pub fn max_sleep(&self) -> Duration {
        // A zero cap would turn the loop into a busy poll.
        Duration::from_millis(self.max_sleep_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
