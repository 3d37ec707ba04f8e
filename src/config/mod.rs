//! Layered runtime configuration: defaults in code, overridable by a TOML
//! file and environment variables, merged once at startup into one ambient
//! `RuntimeConfig`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Process-wide configuration for the runtime core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory under which projects/sessions/legions/templates persist.
    pub data_dir: PathBuf,
    /// Bound on how long a session may remain `starting` before it errors out.
    pub init_timeout_secs: u64,
    /// Default per-project cap on live minions, used when a project omits one.
    pub default_max_concurrent_minions: usize,
    /// Depth of each Observer Hub subscriber's outbound queue before it is
    /// dropped as lagged.
    pub observer_queue_depth: usize,
    /// How often the Observer Hub emits heartbeats to subscribers.
    pub heartbeat_interval_secs: u64,
    /// Grace window after a missed heartbeat before a subscriber is disconnected.
    pub heartbeat_grace_secs: u64,
    /// Resolution of the Scheduler's dispatch loop tick.
    pub scheduler_tick_secs: u64,
    /// Maximum bounded history entries retained per schedule.
    pub schedule_history_limit: usize,
    /// Grace period between a graceful stop signal and a hard kill for the
    /// Agent Driver's child process.
    pub driver_stop_grace_secs: u64,
    /// Per-session cap on pending (not yet running) queue items. Oldest-at-
    /// tail eviction is disallowed (§5) — once full, enqueue is rejected and
    /// the caller must cancel an existing item first.
    pub max_queue_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            init_timeout_secs: 60,
            default_max_concurrent_minions: 10,
            observer_queue_depth: 256,
            heartbeat_interval_secs: 15,
            heartbeat_grace_secs: 45,
            scheduler_tick_secs: 1,
            schedule_history_limit: 50,
            driver_stop_grace_secs: 5,
            max_queue_depth: 100,
        }
    }
}

impl RuntimeConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.heartbeat_grace_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    pub fn driver_stop_grace(&self) -> Duration {
        Duration::from_secs(self.driver_stop_grace_secs)
    }

    /// Load defaults, then a TOML file at `path` if present, then the
    /// `LEGION_` environment prefix.
    pub fn load(path: Option<&std::path::Path>) -> CoreResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&RuntimeConfig::default()).map_err(|e| {
                CoreError::Internal(format!("failed to seed default config: {e}"))
            })?);

        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            }
        }

        builder = builder.add_source(config::Environment::with_prefix("LEGION").separator("__"));

        let built = builder
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to build config: {e}")))?;

        built
            .try_deserialize()
            .map_err(|e| CoreError::Internal(format!("failed to deserialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.default_max_concurrent_minions, 10);
        assert!(cfg.init_timeout_secs > 0);
    }

    #[test]
    fn load_without_file_returns_defaults() {
        let cfg = RuntimeConfig::load(None).expect("defaults alone must build");
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
    }
}
