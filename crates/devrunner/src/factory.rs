use devrunner_core::ProcessManagerFactory;

#[cfg(unix)]
pub type PlatformProcessManager = devrunner_unix::UnixProcessManager;

#[cfg(windows)]
pub type PlatformProcessManager = devrunner_windows::WindowsProcessManager;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    type Manager = PlatformProcessManager;

    fn create_process_manager() -> Self::Manager {
        #[cfg(unix)]
        return devrunner_unix::UnixProcessManagerFactory::create_process_manager();

        #[cfg(windows)]
        return devrunner_windows::WindowsProcessManagerFactory::create_process_manager();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return devrunner_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(windows)]
        return devrunner_windows::WindowsProcessManagerFactory::platform_name();
    }
}
