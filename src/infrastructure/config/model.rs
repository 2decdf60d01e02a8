//! Configuration model with serde defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a gator process tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Tracking directory holding per-job stores and spec dumps.
    #[serde(default = "default_tracking_dir")]
    pub tracking_dir: String,

    #[serde(default)]
    pub intervals: IntervalsConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub console: ConsoleConfig,
}

fn default_tracking_dir() -> String {
    "tracking".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracking_dir: default_tracking_dir(),
            intervals: IntervalsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
            console: ConsoleConfig::default(),
        }
    }
}

/// Periodic tick intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IntervalsConfig {
    /// Resource sampling cadence in seconds.
    #[serde(default = "default_sample_secs")]
    pub sample_secs: u64,

    /// Upward `update` cadence in seconds.
    #[serde(default = "default_update_secs")]
    pub update_secs: u64,
}

const fn default_sample_secs() -> u64 {
    5
}

const fn default_update_secs() -> u64 {
    10
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            sample_secs: default_sample_secs(),
            update_secs: default_update_secs(),
        }
    }
}

impl IntervalsConfig {
    pub fn sample(&self) -> Duration {
        Duration::from_secs(self.sample_secs)
    }

    pub fn update(&self) -> Duration {
        Duration::from_secs(self.update_secs)
    }
}

/// The timeout ladder used throughout the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutsConfig {
    /// Initial upward-connect backoff in milliseconds.
    #[serde(default = "default_connect_initial_ms")]
    pub connect_initial_ms: u64,

    /// Backoff cap in milliseconds.
    #[serde(default = "default_connect_cap_ms")]
    pub connect_cap_ms: u64,

    /// Maximum upward-connect attempts before giving up.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Grace period for a launched child to `register`, in seconds.
    #[serde(default = "default_register_grace_secs")]
    pub register_grace_secs: u64,

    /// Wait after closing stdin before SIGTERM, in seconds.
    #[serde(default = "default_term_grace_secs")]
    pub term_grace_secs: u64,

    /// Wait after SIGTERM before SIGKILL, in seconds.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// Cap on waiting for stopped children to report, in seconds.
    #[serde(default = "default_stop_drain_secs")]
    pub stop_drain_secs: u64,

    /// Store write timeout in seconds.
    #[serde(default = "default_store_write_secs")]
    pub store_write_secs: u64,

    /// Protocol request/response timeout in seconds.
    #[serde(default = "default_rpc_secs")]
    pub rpc_secs: u64,

    /// Scheduler operation timeout in seconds.
    #[serde(default = "default_scheduler_secs")]
    pub scheduler_secs: u64,
}

const fn default_connect_initial_ms() -> u64 {
    500
}

const fn default_connect_cap_ms() -> u64 {
    5_000
}

const fn default_connect_attempts() -> u32 {
    12
}

const fn default_register_grace_secs() -> u64 {
    60
}

const fn default_term_grace_secs() -> u64 {
    10
}

const fn default_kill_grace_secs() -> u64 {
    5
}

const fn default_stop_drain_secs() -> u64 {
    30
}

const fn default_store_write_secs() -> u64 {
    5
}

const fn default_rpc_secs() -> u64 {
    5
}

const fn default_scheduler_secs() -> u64 {
    60
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_initial_ms: default_connect_initial_ms(),
            connect_cap_ms: default_connect_cap_ms(),
            connect_attempts: default_connect_attempts(),
            register_grace_secs: default_register_grace_secs(),
            term_grace_secs: default_term_grace_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            stop_drain_secs: default_stop_drain_secs(),
            store_write_secs: default_store_write_secs(),
            rpc_secs: default_rpc_secs(),
            scheduler_secs: default_scheduler_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn connect_initial(&self) -> Duration {
        Duration::from_millis(self.connect_initial_ms)
    }

    pub fn connect_cap(&self) -> Duration {
        Duration::from_millis(self.connect_cap_ms)
    }

    pub fn register_grace(&self) -> Duration {
        Duration::from_secs(self.register_grace_secs)
    }

    pub fn term_grace(&self) -> Duration {
        Duration::from_secs(self.term_grace_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn stop_drain(&self) -> Duration {
        Duration::from_secs(self.stop_drain_secs)
    }

    pub fn store_write(&self) -> Duration {
        Duration::from_secs(self.store_write_secs)
    }

    pub fn rpc(&self) -> Duration {
        Duration::from_secs(self.rpc_secs)
    }

    pub fn scheduler(&self) -> Duration {
        Duration::from_secs(self.scheduler_secs)
    }
}

/// Scheduler adapter selection and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Concurrency slots for the local adapter. Zero means one per CPU.
    #[serde(default)]
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { concurrency: 0 }
    }
}

impl SchedulerConfig {
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency > 0 {
            self.concurrency
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        }
    }
}

/// Diagnostics (tracing) configuration. Job output rendering is configured
/// separately under `console`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// trace, debug, info, warn, or error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// pretty or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Root console rendering of job log entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConsoleConfig {
    /// Minimum severity rendered at the root (DEBUG .. CRITICAL).
    #[serde(default = "default_console_severity")]
    pub severity: String,
}

fn default_console_severity() -> String {
    "INFO".to_string()
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            severity: default_console_severity(),
        }
    }
}
