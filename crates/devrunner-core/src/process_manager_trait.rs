use crate::process::{ProcessLauncher, ProcessTermination};

/// Platform process manager: launching plus termination
///
/// Implemented once per OS. The supervisor only talks to this trait, which
/// keeps the state machine testable with an in-memory implementation.
///
/// Implementations should:
/// - track attached children so liveness checks reap them
/// - signal the whole process group when the child leads one
/// - leave detached children running when dropped
pub trait ProcessManager: ProcessLauncher + ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
