use crate::process::ProcessId;
use crate::config::PortBinding;
use crate::state::ProcessState;
use std::path::PathBuf;
use thiserror::Error;

/// Error taxonomy for supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Port {binding} is already in use by another process{}", format_occupants(.occupants))]
    PortConflict {
        binding: PortBinding,
        occupants: Vec<ProcessId>,
    },

    #[error("Process {pid} did not open {binding} after {attempts} attempts")]
    ReadinessTimeout {
        pid: ProcessId,
        binding: PortBinding,
        attempts: u32,
        log_tail: Vec<String>,
    },

    #[error("Failed to launch `{command}`: {reason}")]
    ProcessLaunchFailure {
        command: String,
        reason: String,
        pid: Option<ProcessId>,
        log_tail: Vec<String>,
    },

    #[error("Process {pid} survived forceful termination")]
    TerminationFailed { pid: ProcessId },

    #[error("Port {binding} still bound after termination{}", format_occupants(.occupants))]
    PortReleaseTimeout {
        binding: PortBinding,
        occupants: Vec<ProcessId>,
    },

    #[error("Cannot open log file {}: {source}", .path.display())]
    LogOpenError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No log files found in {}", .dir.display())]
    NoLogsFound { dir: PathBuf },

    #[error("Another operation is in progress (state: {state})")]
    OperationInProgress { state: ProcessState },

    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: ProcessState, to: ProcessState },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

fn format_occupants(occupants: &[ProcessId]) -> String {
    if occupants.is_empty() {
        return String::new();
    }
    let pids = occupants
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!(" (pids: {pids})")
}

impl SupervisorError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        SupervisorError::Configuration(msg.into())
    }

    /// Errors that need an operator before anything else can succeed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SupervisorError::PortConflict { .. }
                | SupervisorError::ProcessLaunchFailure { .. }
                | SupervisorError::TerminationFailed { .. }
                | SupervisorError::PortReleaseTimeout { .. }
                | SupervisorError::Configuration(_)
        )
    }

    /// Errors after which the supervised process may still become usable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SupervisorError::ReadinessTimeout { .. } | SupervisorError::OperationInProgress { .. }
        )
    }

    /// Errors that only degrade diagnostics
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            SupervisorError::LogOpenError { .. } | SupervisorError::NoLogsFound { .. }
        )
    }

    /// Log lines captured when the error was raised, if any
    pub fn log_tail(&self) -> Option<&[String]> {
        match self {
            SupervisorError::ReadinessTimeout { log_tail, .. }
            | SupervisorError::ProcessLaunchFailure { log_tail, .. }
                if !log_tail.is_empty() =>
            {
                Some(log_tail)
            }
            _ => None,
        }
    }

    pub fn pid(&self) -> Option<ProcessId> {
        match self {
            SupervisorError::ReadinessTimeout { pid, .. }
            | SupervisorError::TerminationFailed { pid } => Some(*pid),
            SupervisorError::ProcessLaunchFailure { pid, .. } => *pid,
            _ => None,
        }
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
