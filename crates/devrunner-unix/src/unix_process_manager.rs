#[cfg(unix)]
mod unix_impl {
    use crate::port_lookup;
    use async_trait::async_trait;
    use devrunner_core::{
        LaunchMode, LaunchSpec, PortBinding, ProcessError, ProcessId, ProcessInfo,
        ProcessLauncher, ProcessManager, ProcessTermination, TerminationResult,
    };
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::{self, Pid as NixPid};
    use std::collections::HashMap;
    use std::process::Stdio;
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    struct TrackedChild {
        child: Child,
        mode: LaunchMode,
    }

    /// Unix process manager with process group and process tree handling
    pub struct UnixProcessManager {
        system: Mutex<System>,
        children: Mutex<HashMap<ProcessId, TrackedChild>>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            <Self as ProcessManager>::new()
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn nix_pid(pid: ProcessId) -> NixPid {
        NixPid::from_raw(pid.0 as i32)
    }

    /// True when `pid` leads its own group and that group is not ours
    fn leads_foreign_group(pid: NixPid) -> bool {
        matches!(unistd::getpgid(Some(pid)), Ok(pgid) if pgid == pid && pgid != unistd::getpgrp())
    }

    /// Signal the whole group when the target leads one, else just the pid
    fn deliver(pid: ProcessId, sig: Signal) -> TerminationResult {
        let target = nix_pid(pid);
        let (result, scope) = if leads_foreign_group(target) {
            (signal::killpg(target, sig), "process group")
        } else {
            (signal::kill(target, sig), "process")
        };

        match result {
            Ok(()) => {
                info!(pid = %pid, signal = ?sig, scope, "Signal sent");
                TerminationResult::Success
            }
            Err(Errno::ESRCH) => {
                debug!(pid = %pid, "Process not found (already terminated)");
                TerminationResult::ProcessNotFound
            }
            Err(Errno::EPERM) => {
                warn!(pid = %pid, signal = ?sig, "Permission denied");
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!(pid = %pid, signal = ?sig, error = %e, "Failed to send signal");
                TerminationResult::Failed(format!("{sig:?} failed: {e}"))
            }
        }
    }

    impl UnixProcessManager {
        /// Recursively find all descendants, deepest first
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().is_some_and(|ppid| ppid.as_u32() == parent_pid) {
                    let child_pid = pid.as_u32();
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }

        fn descendants(&self, root: ProcessId) -> Vec<ProcessId> {
            let mut system = lock(&self.system);
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing(),
            );
            let mut found = Vec::new();
            Self::find_children_recursive(&system, root.0, &mut found);
            found.into_iter().map(ProcessId::from).collect()
        }
    }

    #[async_trait]
    impl ProcessLauncher for UnixProcessManager {
        async fn launch(
            &self,
            spec: &LaunchSpec,
            output: Option<std::fs::File>,
        ) -> Result<ProcessId, ProcessError> {
            let mut cmd = Command::new(&spec.command);
            cmd.args(&spec.args).envs(&spec.env).stdin(Stdio::null());

            if let Some(dir) = &spec.working_directory {
                cmd.current_dir(dir);
            }

            match output {
                Some(file) => {
                    let stderr = file.try_clone()?;
                    cmd.stdout(Stdio::from(file)).stderr(Stdio::from(stderr));
                }
                None => {
                    cmd.stdout(Stdio::null()).stderr(Stdio::null());
                }
            }

            match spec.mode {
                // Own group so termination reaches the whole tree
                LaunchMode::Attached => {
                    cmd.process_group(0);
                }
                // Own session; survives the supervisor and its terminal
                LaunchMode::Detached => {
                    // SAFETY: setsid is async-signal-safe and touches no parent state
                    unsafe {
                        cmd.pre_exec(|| {
                            unistd::setsid()
                                .map(|_| ())
                                .map_err(std::io::Error::from)
                        });
                    }
                }
            }

            let child = cmd
                .spawn()
                .map_err(|e| ProcessError::SpawnFailed(format!("{}: {e}", spec.command)))?;
            let pid = child.id().map(ProcessId::from).ok_or_else(|| {
                ProcessError::SpawnFailed(format!("{} exited before reporting a pid", spec.command))
            })?;

            info!(
                pid = %pid,
                command = %spec.display_command(),
                mode = ?spec.mode,
                "Spawned Unix process"
            );
            lock(&self.children).insert(
                pid,
                TrackedChild {
                    child,
                    mode: spec.mode,
                },
            );
            Ok(pid)
        }

        async fn is_alive(&self, pid: ProcessId) -> bool {
            {
                let mut children = lock(&self.children);
                if let Some(tracked) = children.get_mut(&pid) {
                    match tracked.child.try_wait() {
                        Ok(None) => return true,
                        Ok(Some(status)) => {
                            info!(pid = %pid, %status, "Child exited");
                            children.remove(&pid);
                            return false;
                        }
                        Err(e) => warn!(pid = %pid, error = %e, "Failed to poll child"),
                    }
                }
            }

            // Signal 0 probes existence; EPERM still means it exists
            match signal::kill(nix_pid(pid), None) {
                Ok(()) | Err(Errno::EPERM) => true,
                Err(_) => false,
            }
        }

        fn release(&self, pid: ProcessId) {
            // Dropping the Child leaves reaping to tokio's orphan queue
            if lock(&self.children).remove(&pid).is_some() {
                debug!(pid = %pid, "Released child");
            }
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
            deliver(pid, Signal::SIGTERM)
        }

        async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
            let descendants = self.descendants(pid);
            if !descendants.is_empty() {
                info!(pid = %pid, count = descendants.len(), "Killing descendants");
            }
            for child in descendants {
                match signal::kill(nix_pid(child), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => warn!(pid = %child, error = %e, "Failed to kill descendant"),
                }
            }
            deliver(pid, Signal::SIGKILL)
        }

        async fn pids_on_port(&self, binding: &PortBinding) -> anyhow::Result<Vec<ProcessId>> {
            port_lookup::listening_pids(binding.port).await
        }

        async fn describe(&self, pid: ProcessId) -> Option<ProcessInfo> {
            let mut system = lock(&self.system);
            let sys_pid = sysinfo::Pid::from_u32(pid.0);
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[sys_pid]),
                true,
                ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
            );
            system.process(sys_pid).map(|process| ProcessInfo {
                pid,
                name: process.name().to_string_lossy().into_owned(),
                command: process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect(),
            })
        }
    }

    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            info!("Initializing Unix process manager");
            Self {
                system: Mutex::new(System::new()),
                children: Mutex::new(HashMap::new()),
            }
        }
    }

    impl Drop for UnixProcessManager {
        fn drop(&mut self) {
            // Attached children share our lifetime; detached ones are left running
            let children = std::mem::take(&mut *lock(&self.children));
            let attached: Vec<ProcessId> = children
                .into_iter()
                .filter_map(|(pid, mut tracked)| {
                    let running = matches!(tracked.child.try_wait(), Ok(None));
                    (running && tracked.mode == LaunchMode::Attached).then_some(pid)
                })
                .collect();

            if attached.is_empty() {
                return;
            }

            warn!(
                count = attached.len(),
                "Emergency cleanup: terminating attached processes during drop"
            );
            for pid in attached {
                let result = deliver(pid, Signal::SIGTERM);
                if !result.is_delivered() {
                    warn!(pid = %pid, ?result, "SIGTERM failed during drop, sending SIGKILL");
                    deliver(pid, Signal::SIGKILL);
                }
            }
        }
    }
}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::UnixProcessManager;

// Provide a stub for non-Unix systems
#[cfg(not(unix))]
pub struct UnixProcessManager;

#[cfg(not(unix))]
impl UnixProcessManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
