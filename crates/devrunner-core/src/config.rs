use crate::error::{SupervisorError, SupervisorResult};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Overrides the listen port
pub const ENV_PORT: &str = "DEV_RUNNER_PORT";
/// Overrides the termination grace window (`2`, `2s`, `500ms`)
pub const ENV_GRACE_PERIOD: &str = "DEV_RUNNER_GRACE_PERIOD";
/// Overrides the log file directory
pub const ENV_LOG_DIR: &str = "DEV_RUNNER_LOG_DIR";

/// TCP endpoint the supervised server listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortBinding {
    pub host: String,
    pub port: u16,
}

impl PortBinding {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Browser-facing URL for this binding
    pub fn url(&self, scheme: &str) -> String {
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl Default for PortBinding {
    fn default() -> Self {
        Self::new(default_host(), default_port())
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How the child is attached to the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Child shares the supervisor's lifetime and is cleaned up on drop
    #[default]
    Attached,
    /// Child runs in its own session and outlives the supervisor
    Detached,
}

/// Readiness probing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    /// Number of probes before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between probes (in milliseconds)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Connect timeout of a single probe (in milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Fail the start as soon as the child exits before the port opens
    #[serde(default = "default_fail_on_early_exit")]
    pub fail_on_early_exit: bool,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            fail_on_early_exit: default_fail_on_early_exit(),
        }
    }
}

impl ReadinessConfig {
    /// Keep the interval, derive the attempt count from a total wait
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let interval = self.interval_ms.max(1) as u128;
        let attempts = timeout.as_millis().div_ceil(interval).max(1);
        self.max_attempts = attempts.min(u32::MAX as u128) as u32;
        self
    }

    pub fn validate(&self) -> SupervisorResult<()> {
        if self.max_attempts == 0 {
            return Err(SupervisorError::configuration(
                "readiness max_attempts must be at least 1",
            ));
        }

        if self.probe_timeout_ms == 0 {
            return Err(SupervisorError::configuration(
                "readiness probe_timeout_ms must be greater than 0",
            ));
        }

        if self.interval_ms > 60_000 {
            return Err(SupervisorError::configuration(
                "readiness interval_ms should not exceed 60 seconds",
            ));
        }

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Termination timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TerminationConfig {
    /// Wait after the graceful signal before escalating (in milliseconds)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Wait after the forceful signal before giving up (in milliseconds)
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,

    /// How long the port may stay bound after both passes (in milliseconds)
    #[serde(default = "default_release_timeout_ms")]
    pub release_timeout_ms: u64,

    /// Liveness polling interval during waits (in milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            kill_wait_ms: default_kill_wait_ms(),
            release_timeout_ms: default_release_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TerminationConfig {
    pub fn validate(&self) -> SupervisorResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(SupervisorError::configuration(
                "termination poll_interval_ms must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Main supervisor configuration
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct SupervisorConfig {
    #[builder(default = "default_name()")]
    pub name: String,
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    pub binding: PortBinding,
    #[builder(default = "default_url_scheme()")]
    pub url_scheme: String,
    #[builder(default = "default_log_dir()")]
    pub log_dir: PathBuf,
    #[builder(default)]
    pub launch_mode: LaunchMode,
    #[builder(default)]
    pub readiness: ReadinessConfig,
    #[builder(default)]
    pub termination: TerminationConfig,
    #[builder(default = "default_notify_delay_ms()")]
    pub notify_delay_ms: u64,
    #[builder(default = "default_notify_timeout_ms()")]
    pub notify_timeout_ms: u64,
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    pub fn validate(&self) -> SupervisorResult<()> {
        if self.command.trim().is_empty() {
            return Err(SupervisorError::configuration("command must not be empty"));
        }

        if self.binding.port == 0 {
            return Err(SupervisorError::configuration("port must be greater than 0"));
        }

        if self.binding.host.trim().is_empty() {
            return Err(SupervisorError::configuration("host must not be empty"));
        }

        self.readiness.validate()?;
        self.termination.validate()
    }

    pub fn url(&self) -> String {
        self.binding.url(&self.url_scheme)
    }

    pub fn grace_period(&self) -> Duration {
        self.termination.grace_period()
    }

    pub fn notify_delay(&self) -> Duration {
        Duration::from_millis(self.notify_delay_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    /// Apply `DEV_RUNNER_*` overrides from the given variables
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> SupervisorResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                ENV_PORT => {
                    self.binding.port = value.parse().map_err(|_| {
                        SupervisorError::configuration(format!("{ENV_PORT}={value} is not a port"))
                    })?;
                }
                ENV_GRACE_PERIOD => {
                    let grace = parse_duration(value).ok_or_else(|| {
                        SupervisorError::configuration(format!(
                            "{ENV_GRACE_PERIOD}={value} is not a duration"
                        ))
                    })?;
                    self.termination.grace_period_ms =
                        u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
                }
                ENV_LOG_DIR if !value.is_empty() => {
                    self.log_dir = PathBuf::from(value);
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn apply_process_env(&mut self) -> SupervisorResult<()> {
        self.apply_env(std::env::vars())
    }
}

impl SupervisorConfigBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

/// Parse `500ms`, `2s` or a bare number of seconds (`2`, `1.5`)
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    let secs = value.strip_suffix('s').unwrap_or(value).trim();
    let secs: f64 = secs.parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

// Default value functions for serde and the builder
fn default_name() -> String {
    "dev-server".to_string()
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    5005
}
fn default_url_scheme() -> String {
    "https".to_string()
}
fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_max_attempts() -> u32 {
    30
}
fn default_interval_ms() -> u64 {
    1_000
}
fn default_probe_timeout_ms() -> u64 {
    300
}
fn default_fail_on_early_exit() -> bool {
    true
}
fn default_grace_period_ms() -> u64 {
    2_000
}
fn default_kill_wait_ms() -> u64 {
    1_000
}
fn default_release_timeout_ms() -> u64 {
    2_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_notify_delay_ms() -> u64 {
    2_000
}
fn default_notify_timeout_ms() -> u64 {
    5_000
}
