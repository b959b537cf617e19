//! In-memory process manager for exercising the supervisor without real
//! processes. A "process" is a pid plus an optional TCP listener on the
//! supervised port, so port probes behave exactly as in production.

use crate::config::PortBinding;
use crate::process::{
    LaunchSpec, ProcessError, ProcessId, ProcessInfo, ProcessLauncher, ProcessTermination,
    TerminationResult,
};
use crate::process_manager_trait::ProcessManager;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devrunner_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A localhost binding whose port was free a moment ago
pub(crate) fn free_binding() -> PortBinding {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    PortBinding::new("127.0.0.1", port)
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBehavior {
    pub fail_spawn: bool,
    /// Process runs but never binds the port
    pub never_bind: bool,
    /// Process exits right after launch
    pub exit_immediately: bool,
    /// Graceful termination is delivered but ignored
    pub ignore_graceful: bool,
    /// No signal has any effect
    pub unkillable: bool,
    /// On exit the listener is inherited by a new, untracked pid
    pub orphan_on_exit: bool,
}

#[derive(Default)]
struct FakeState {
    behavior: FakeBehavior,
    processes: HashMap<ProcessId, Option<TcpListener>>,
    launches: Vec<LaunchSpec>,
}

pub(crate) struct FakeProcessManager {
    binding: PortBinding,
    next_pid: AtomicU32,
    state: Mutex<FakeState>,
}

impl FakeProcessManager {
    pub fn new(binding: PortBinding) -> Self {
        Self {
            binding,
            next_pid: AtomicU32::new(10_000),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn binding(&self) -> &PortBinding {
        &self.binding
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        self.state.lock().unwrap().behavior = behavior;
    }

    pub fn launch_count(&self) -> usize {
        self.state.lock().unwrap().launches.len()
    }

    pub fn last_launch(&self) -> Option<LaunchSpec> {
        self.state.lock().unwrap().launches.last().cloned()
    }

    fn allocate_pid(&self) -> ProcessId {
        ProcessId(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    fn bind(&self) -> TcpListener {
        TcpListener::bind((self.binding.host.as_str(), self.binding.port)).unwrap()
    }

    /// Bind the port from a process the supervisor never launched
    pub fn occupy_foreign(&self) -> ProcessId {
        let pid = self.allocate_pid();
        let listener = self.bind();
        self.state
            .lock()
            .unwrap()
            .processes
            .insert(pid, Some(listener));
        pid
    }

    /// Make a running process start listening
    pub fn bind_now(&self, pid: ProcessId) {
        let listener = self.bind();
        if let Some(slot) = self.state.lock().unwrap().processes.get_mut(&pid) {
            *slot = Some(listener);
        }
    }

    /// The process dies outside the supervisor's control
    pub fn kill_externally(&self, pid: ProcessId) {
        self.state.lock().unwrap().processes.remove(&pid);
    }

    /// Drop the listener but keep the process alive
    pub fn close_port(&self, pid: ProcessId) {
        if let Some(slot) = self.state.lock().unwrap().processes.get_mut(&pid) {
            *slot = None;
        }
    }

    fn exit(&self, pid: ProcessId) -> TerminationResult {
        let orphan_pid = self.allocate_pid();
        let mut state = self.state.lock().unwrap();
        let Some(listener) = state.processes.remove(&pid) else {
            return TerminationResult::ProcessNotFound;
        };
        if state.behavior.orphan_on_exit && listener.is_some() {
            state.processes.insert(orphan_pid, listener);
            // Only the first generation orphans
            state.behavior.orphan_on_exit = false;
        }
        TerminationResult::Success
    }
}

#[async_trait]
impl ProcessLauncher for FakeProcessManager {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        _output: Option<std::fs::File>,
    ) -> Result<ProcessId, ProcessError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.launches.push(spec.clone());
            state.behavior.clone()
        };
        if behavior.fail_spawn {
            return Err(ProcessError::SpawnFailed(format!(
                "{}: command not found",
                spec.command
            )));
        }

        let pid = self.allocate_pid();
        if behavior.exit_immediately {
            return Ok(pid);
        }

        let listener = (!behavior.never_bind).then(|| self.bind());
        self.state.lock().unwrap().processes.insert(pid, listener);
        Ok(pid)
    }

    async fn is_alive(&self, pid: ProcessId) -> bool {
        self.state.lock().unwrap().processes.contains_key(&pid)
    }

    fn release(&self, _pid: ProcessId) {}
}

#[async_trait]
impl ProcessTermination for FakeProcessManager {
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
        {
            let state = self.state.lock().unwrap();
            if !state.processes.contains_key(&pid) {
                return TerminationResult::ProcessNotFound;
            }
            if state.behavior.ignore_graceful || state.behavior.unkillable {
                return TerminationResult::Success;
            }
        }
        self.exit(pid)
    }

    async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
        if self.state.lock().unwrap().behavior.unkillable {
            return TerminationResult::AccessDenied;
        }
        self.exit(pid)
    }

    async fn pids_on_port(&self, _binding: &PortBinding) -> anyhow::Result<Vec<ProcessId>> {
        let state = self.state.lock().unwrap();
        let mut pids: Vec<ProcessId> = state
            .processes
            .iter()
            .filter(|(_, listener)| listener.is_some())
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort();
        Ok(pids)
    }

    async fn describe(&self, pid: ProcessId) -> Option<ProcessInfo> {
        self.state
            .lock()
            .unwrap()
            .processes
            .contains_key(&pid)
            .then(|| ProcessInfo {
                pid,
                name: "fake-server".to_string(),
                command: vec!["fake-server".to_string()],
            })
    }
}

impl ProcessManager for FakeProcessManager {
    fn new() -> Self {
        FakeProcessManager::new(free_binding())
    }
}
