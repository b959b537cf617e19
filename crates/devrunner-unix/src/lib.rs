#[cfg(unix)]
mod port_lookup;
mod unix_process_manager;

pub use unix_process_manager::UnixProcessManager;

pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl devrunner_core::ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_process_manager() -> Self::Manager {
        <UnixProcessManager as devrunner_core::ProcessManager>::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
