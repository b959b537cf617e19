use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use devrunner_core::*;

/// Creates the process without a console window
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
/// Detaches the process from the parent's console
#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;
/// New process group, so console control events don't reach the supervisor
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

struct TrackedChild {
    child: Child,
    mode: LaunchMode,
}

/// Windows-specific process manager with process tree management
pub struct WindowsProcessManager {
    system: Mutex<System>,
    children: Mutex<HashMap<ProcessId, TrackedChild>>,
}

impl Default for WindowsProcessManager {
    fn default() -> Self {
        <Self as ProcessManager>::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ProcessLauncher for WindowsProcessManager {
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

        #[cfg(windows)]
        {
            let flags = match spec.mode {
                LaunchMode::Attached => CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP,
                LaunchMode::Detached => DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP,
            };
            cmd.creation_flags(flags);
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
            "Spawned Windows process"
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
        self.exists(pid)
    }

    fn release(&self, pid: ProcessId) {
        if lock(&self.children).remove(&pid).is_some() {
            debug!(pid = %pid, "Released child");
        }
    }
}

#[async_trait]
impl ProcessTermination for WindowsProcessManager {
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
        // Without /F taskkill asks the process tree to close
        self.taskkill(pid, false).await
    }

    async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
        match self.taskkill(pid, true).await {
            TerminationResult::Failed(reason) => {
                warn!(pid = %pid, %reason, "taskkill failed, killing tree manually");
                self.kill_tree_manually(pid)
            }
            result => result,
        }
    }

    async fn pids_on_port(&self, binding: &PortBinding) -> anyhow::Result<Vec<ProcessId>> {
        let output = Command::new("netstat")
            .args(["-ano", "-p", "TCP"])
            .output()
            .await
            .context("failed to run netstat")?;
        let mut pids = parse_netstat_listeners(&String::from_utf8_lossy(&output.stdout), binding.port);

        // IPv6 listeners are only reported with -p TCPv6
        let output = Command::new("netstat")
            .args(["-ano", "-p", "TCPv6"])
            .output()
            .await
            .context("failed to run netstat")?;
        pids.extend(parse_netstat_listeners(
            &String::from_utf8_lossy(&output.stdout),
            binding.port,
        ));
        pids.sort();
        pids.dedup();
        Ok(pids)
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

impl WindowsProcessManager {
    /// taskkill /T over the whole tree, /F when forced
    async fn taskkill(&self, pid: ProcessId, force: bool) -> TerminationResult {
        let pid_string = pid.to_string();
        let mut args = vec!["/T", "/PID", &pid_string];
        if force {
            args.insert(0, "/F");
        }

        let output = match Command::new("taskkill").args(&args).output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to run taskkill");
                return TerminationResult::Failed(format!("taskkill failed to run: {e}"));
            }
        };

        if output.status.success() {
            info!(pid = %pid, force, "taskkill delivered");
            return TerminationResult::Success;
        }
        if !self.exists(pid) {
            debug!(pid = %pid, "Process not found (already terminated)");
            return TerminationResult::ProcessNotFound;
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("Access is denied") {
            warn!(pid = %pid, "Permission denied");
            return TerminationResult::AccessDenied;
        }
        warn!(pid = %pid, force, %stderr, "taskkill failed");
        TerminationResult::Failed(stderr)
    }

    fn exists(&self, pid: ProcessId) -> bool {
        let mut system = lock(&self.system);
        let sys_pid = sysinfo::Pid::from_u32(pid.0);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        system.process(sys_pid).is_some()
    }

    /// Kill descendants bottom-up, then the root, through sysinfo
    fn kill_tree_manually(&self, root: ProcessId) -> TerminationResult {
        let mut system = lock(&self.system);
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());

        let mut tree = Vec::new();
        Self::find_children_recursive(&system, root.0, &mut tree);
        tree.push(root.0);

        let mut result = TerminationResult::ProcessNotFound;
        for pid in tree {
            if let Some(process) = system.process(sysinfo::Pid::from_u32(pid)) {
                if process.kill() {
                    result = TerminationResult::Success;
                } else if pid == root.0 {
                    result = TerminationResult::Failed(format!("could not kill {pid}"));
                }
            }
        }
        result
    }

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
}

impl ProcessManager for WindowsProcessManager {
    fn new() -> Self {
        info!("Initializing Windows process manager");
        Self {
            system: Mutex::new(System::new()),
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl Drop for WindowsProcessManager {
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
            let result = std::process::Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .output();

            match result {
                Ok(output) if !output.status.success() => {
                    warn!(
                        pid = %pid,
                        stderr = %String::from_utf8_lossy(&output.stderr),
                        "Failed to kill process during drop"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(pid = %pid, error = %e, "Failed to execute taskkill during drop");
                }
            }
        }
    }
}

/// Pids from `netstat -ano` rows in LISTENING state on `port`
pub(crate) fn parse_netstat_listeners(text: &str, port: u16) -> Vec<ProcessId> {
    let mut pids: Vec<ProcessId> = text
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // Proto  Local Address  Foreign Address  State  PID
            if fields.len() != 5 || !fields[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            if fields[3] != "LISTENING" {
                return None;
            }
            let (_, local_port) = fields[1].rsplit_once(':')?;
            if local_port.parse::<u16>().ok()? != port {
                return None;
            }
            fields[4].parse::<u32>().ok().map(ProcessId::from)
        })
        .collect();
    pids.sort();
    pids.dedup();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETSTAT: &str = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1044
  TCP    127.0.0.1:5005         0.0.0.0:0              LISTENING       4242
  TCP    127.0.0.1:5005         127.0.0.1:51234        ESTABLISHED     4242
  TCP    127.0.0.1:51234        127.0.0.1:5005         ESTABLISHED     9000
  TCP    [::1]:5005             [::]:0                 LISTENING       4243
  TCP    0.0.0.0:50050          0.0.0.0:0              LISTENING       77
";

    #[test]
    fn test_parse_netstat_listeners() {
        assert_eq!(
            parse_netstat_listeners(NETSTAT, 5005),
            vec![ProcessId(4242), ProcessId(4243)]
        );
        assert_eq!(parse_netstat_listeners(NETSTAT, 135), vec![ProcessId(1044)]);
        assert!(parse_netstat_listeners(NETSTAT, 50).is_empty());
        assert!(parse_netstat_listeners("", 5005).is_empty());
    }

    #[cfg(windows)]
    #[tokio::test]
    async fn test_launch_and_force_kill() {
        let manager = WindowsProcessManager::new();
        let spec = LaunchSpec {
            command: "ping".to_string(),
            args: vec!["-n".to_string(), "30".to_string(), "127.0.0.1".to_string()],
            working_directory: None,
            env: HashMap::new(),
            mode: LaunchMode::Attached,
        };
        let pid = manager.launch(&spec, None).await.unwrap();
        assert!(manager.is_alive(pid).await);

        assert!(manager.force_kill(pid).await.is_delivered());
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while manager.is_alive(pid).await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(!manager.is_alive(pid).await);
    }
}
