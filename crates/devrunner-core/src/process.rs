use crate::config::{LaunchMode, PortBinding, SupervisorConfig};
use crate::state::ProcessState;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The supervised process as seen by the supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessHandle {
    pub pid: ProcessId,
    pub launched_at: DateTime<Local>,
    pub state: ProcessState,
}

/// Result of a single signal delivery
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Insufficient privileges
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// True when the target is gone or on its way out
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// Information about a running process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: ProcessId,
    pub name: String,
    pub command: Vec<String>,
}

impl ProcessInfo {
    /// Space-joined argv, empty when the command line could not be read
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.pid, self.name)
    }
}

/// Error types for process operations
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessId),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Everything needed to spawn the supervised command
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub mode: LaunchMode,
}

impl LaunchSpec {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            working_directory: config.working_directory.clone(),
            env: config.env.clone(),
            mode: config.launch_mode,
        }
    }

    pub fn display_command(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Starts processes and tracks whether they are alive
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn the command with stdout and stderr both redirected to `output`.
    /// `None` discards the output.
    async fn launch(
        &self,
        spec: &LaunchSpec,
        output: Option<std::fs::File>,
    ) -> Result<ProcessId, ProcessError>;

    /// Check whether the process still exists. Tracked children are reaped.
    async fn is_alive(&self, pid: ProcessId) -> bool;

    /// Stop tracking a process without signalling it
    fn release(&self, pid: ProcessId);
}

/// OS-level termination primitives
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// SIGTERM on Unix, `taskkill` without /F on Windows
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult;

    /// Unconditional kill of the process and its descendants
    async fn force_kill(&self, pid: ProcessId) -> TerminationResult;

    /// Processes listening on the binding's port
    async fn pids_on_port(&self, binding: &PortBinding) -> anyhow::Result<Vec<ProcessId>>;

    /// Name and command line, when the process is visible
    async fn describe(&self, pid: ProcessId) -> Option<ProcessInfo>;
}
