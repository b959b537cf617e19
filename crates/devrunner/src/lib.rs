//! devrunner - supervise a local development web server
//!
//! Wires the platform process manager and a browser notifier into the
//! [`Supervisor`] from `devrunner-core`.

pub mod browser;
mod factory;

pub use factory::{PlatformProcessManager, PlatformProcessManagerFactory};

use std::sync::Arc;

/// Supervisor backed by this platform's process manager
pub type DevRunner = Supervisor<PlatformProcessManager>;

/// Build a supervisor for the current platform
pub fn create_supervisor(
    config: SupervisorConfig,
    notifier: Arc<dyn BrowserNotifier>,
) -> SupervisorResult<DevRunner> {
    let manager = Arc::new(PlatformProcessManagerFactory::create_process_manager());
    tracing::debug!(
        platform = PlatformProcessManagerFactory::platform_name(),
        "Created process manager"
    );
    Supervisor::new(config, manager, notifier)
}

// Re-export core functionality
pub use devrunner_core::*;
