//! The supervisor: one dev server, one port, one state machine.
//!
//! Mutating operations (`start`, `stop`, `restart`, ...) serialize on an
//! operation lock and are rejected, not queued, while another one runs.
//! State is published through a watch channel so `status` and subscribers
//! never wait on that lock.


use crate::config::{PortBinding, SupervisorConfig};
use crate::error::{SupervisorError, SupervisorResult};
use crate::logs::LogSink;
use crate::notifier::BrowserNotifier;
use crate::probe::{PortProbe, Readiness};
use crate::process::{LaunchSpec, ProcessHandle, ProcessId, ProcessInfo};
use crate::process_manager_trait::ProcessManager;
use crate::state::ProcessState;
use crate::termination::{TerminationPolicy, TerminationReport, TerminationTarget};
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Log lines attached to launch and readiness failures
const FAILURE_TAIL_LINES: usize = 20;

/// Result of a successful start
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// A new process was launched and its port opened
    Started(ProcessHandle),
    /// The server was already running; nothing was launched
    AlreadyRunning(ProcessHandle),
}

impl StartOutcome {
    pub fn handle(&self) -> &ProcessHandle {
        match self {
            StartOutcome::Started(handle) | StartOutcome::AlreadyRunning(handle) => handle,
        }
    }

    pub fn into_handle(self) -> ProcessHandle {
        match self {
            StartOutcome::Started(handle) | StartOutcome::AlreadyRunning(handle) => handle,
        }
    }

    pub fn was_started(&self) -> bool {
        matches!(self, StartOutcome::Started(_))
    }
}

/// Point-in-time view of the supervised server
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub state: ProcessState,
    pub handle: Option<ProcessHandle>,
    pub binding: PortBinding,
    pub url: String,
    /// Something accepts connections on the binding
    pub port_open: bool,
    /// Liveness of the tracked pid; `None` without a handle
    pub process_alive: Option<bool>,
}

impl StatusReport {
    /// Running according to the state machine, but the port stopped answering
    pub fn is_degraded(&self) -> bool {
        self.state == ProcessState::Running && !self.port_open
    }
}

pub struct Supervisor<M, N: ?Sized = dyn BrowserNotifier> {
    config: SupervisorConfig,
    manager: Arc<M>,
    notifier: Arc<N>,
    probe: PortProbe,
    logs: LogSink,
    termination: TerminationPolicy<M>,
    operation: tokio::sync::Mutex<()>,
    state: watch::Sender<ProcessState>,
    handle: Mutex<Option<ProcessHandle>>,
    last_launch: Mutex<Option<DateTime<Local>>>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<M, N> Supervisor<M, N>
where
    M: ProcessManager,
    N: BrowserNotifier + ?Sized,
{
    pub fn new(
        config: SupervisorConfig,
        manager: Arc<M>,
        notifier: Arc<N>,
    ) -> SupervisorResult<Self> {
        config.validate()?;

        let probe = PortProbe::new(config.readiness.probe_timeout());
        let termination = TerminationPolicy::new(
            manager.clone(),
            probe.clone(),
            config.binding.clone(),
            config.termination.clone(),
        );
        let (state, _) = watch::channel(ProcessState::Idle);

        info!(
            name = %config.name,
            binding = %config.binding,
            log_dir = %config.log_dir.display(),
            "Creating supervisor"
        );

        Ok(Self {
            logs: LogSink::new(config.log_dir.clone()),
            config,
            manager,
            notifier,
            probe,
            termination,
            operation: tokio::sync::Mutex::new(()),
            state,
            handle: Mutex::new(None),
            last_launch: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Replace the shutdown token, e.g. with one wired to Ctrl-C
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn url(&self) -> String {
        self.config.url()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn handle(&self) -> Option<ProcessHandle> {
        lock(&self.handle).clone()
    }

    /// Receives every published state change
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Cancelling this token aborts an in-flight start and stops the process
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Launch the server and wait for its port to open
    pub async fn start(&self) -> SupervisorResult<StartOutcome> {
        let _operation = self.begin()?;
        let state = self.state();
        if !state.can_start() && state != ProcessState::Running {
            // A previous stop failed and still owns the process
            return Err(SupervisorError::OperationInProgress { state });
        }
        self.start_locked().await
    }

    /// Clear whatever holds the port, then start
    pub async fn force_start(&self) -> SupervisorResult<StartOutcome> {
        let _operation = self.begin()?;
        info!(binding = %self.config.binding, "Force start requested");
        self.stop_locked(self.config.grace_period(), false).await?;
        if let Err(e) = self.termination.terminate(TerminationTarget::Port).await {
            self.settle();
            return Err(e);
        }
        self.start_locked().await
    }

    pub async fn stop(&self) -> SupervisorResult<()> {
        self.stop_with_grace(self.config.grace_period()).await
    }

    pub async fn stop_with_grace(&self, grace_period: Duration) -> SupervisorResult<()> {
        let _operation = self.begin()?;
        self.stop_locked(grace_period, true).await.map(|_| ())
    }

    /// Stop the tracked process, then kill anything else bound to the port.
    /// Works without a handle, e.g. from a fresh CLI invocation.
    pub async fn clear_port(&self) -> SupervisorResult<TerminationReport> {
        let _operation = self.begin()?;
        let mut report = self
            .stop_locked(self.config.grace_period(), true)
            .await?
            .unwrap_or_default();
        let sweep = self.termination.terminate(TerminationTarget::Port).await?;
        report.swept.extend(sweep.swept);
        Ok(report)
    }

    /// Stop then start under one lock; `Idle` and `Stopped` are never published
    pub async fn restart(&self) -> SupervisorResult<StartOutcome> {
        let _operation = self.begin()?;
        info!(binding = %self.config.binding, "Restarting server");
        self.stop_locked(self.config.grace_period(), false).await?;
        self.start_locked().await
    }

    pub async fn status(&self) -> StatusReport {
        let binding = &self.config.binding;
        let port_open = self.probe.is_open(binding).await;
        let process_alive = match self.handle() {
            Some(handle) => Some(self.manager.is_alive(handle.pid).await),
            None => None,
        };

        if self.state() == ProcessState::Running && !port_open && process_alive != Some(true) {
            // Only settle when nobody else is mid-operation
            if let Ok(_operation) = self.operation.try_lock() {
                if self.state() == ProcessState::Running {
                    if let Some(handle) = self.take_handle() {
                        warn!(pid = %handle.pid, "Server exited outside the supervisor");
                        self.manager.release(handle.pid);
                    }
                    self.note("server exited").await;
                    if let Err(e) = self.transition(ProcessState::Stopped) {
                        debug!(error = %e, "Could not settle exited server");
                    }
                }
            }
        }

        StatusReport {
            state: self.state(),
            handle: self.handle(),
            binding: binding.clone(),
            url: self.config.url(),
            port_open,
            process_alive,
        }
    }

    /// Last `n` lines of the active or most recent session log
    pub async fn logs(&self, n: usize) -> SupervisorResult<Vec<String>> {
        self.logs.tail(n).await
    }

    pub async fn log_path(&self) -> SupervisorResult<PathBuf> {
        self.logs.latest_log().await
    }

    /// Everything currently listening on the supervised port
    pub async fn port_occupants(&self) -> SupervisorResult<Vec<ProcessInfo>> {
        let pids = self.manager.pids_on_port(&self.config.binding).await?;
        let mut occupants = Vec::with_capacity(pids.len());
        for pid in pids {
            let info = self.manager.describe(pid).await.unwrap_or_else(|| ProcessInfo {
                pid,
                name: "unknown".to_string(),
                command: Vec::new(),
            });
            occupants.push(info);
        }
        Ok(occupants)
    }

    fn begin(&self) -> SupervisorResult<tokio::sync::MutexGuard<'_, ()>> {
        self.operation
            .try_lock()
            .map_err(|_| SupervisorError::OperationInProgress {
                state: self.state(),
            })
    }

    fn transition(&self, next: ProcessState) -> SupervisorResult<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                result = Err(SupervisorError::InvalidTransition {
                    from: *current,
                    to: next,
                });
                return false;
            }
            debug!(from = %current, to = %next, "State transition");
            *current = next;
            true
        });
        result?;

        if let Some(handle) = lock(&self.handle).as_mut() {
            handle.state = next;
        }
        Ok(())
    }

    /// Leave `Stopping` when a restart or force start gives up before launching
    fn settle(&self) {
        if self.state() == ProcessState::Stopping {
            if let Err(e) = self.transition(ProcessState::Stopped) {
                debug!(error = %e, "Could not settle after stop");
            }
        }
    }

    fn set_handle(&self, handle: Option<ProcessHandle>) {
        *lock(&self.handle) = handle;
    }

    fn take_handle(&self) -> Option<ProcessHandle> {
        lock(&self.handle).take()
    }

    /// Strictly increasing across launches, even within one clock tick
    fn next_launch_time(&self) -> DateTime<Local> {
        let mut last = lock(&self.last_launch);
        let mut now = Local::now();
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + chrono::Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    async fn note(&self, message: &str) {
        if let Some(session) = self.logs.current() {
            if let Err(e) = session.note(message).await {
                debug!(path = %session.path().display(), error = %e, "Failed to write log marker");
            }
        }
    }

    async fn failure_tail(&self) -> Vec<String> {
        self.logs
            .tail(FAILURE_TAIL_LINES)
            .await
            .unwrap_or_default()
    }

    async fn start_locked(&self) -> SupervisorResult<StartOutcome> {
        let state = self.state();
        if state == ProcessState::Running {
            if let Some(handle) = self.handle() {
                info!(pid = %handle.pid, url = %self.config.url(), "Server already running");
                return Ok(StartOutcome::AlreadyRunning(handle));
            }
        }

        if self.shutdown.is_cancelled() {
            self.settle();
            return Err(SupervisorError::Cancelled);
        }

        if state == ProcessState::Failed {
            if let Some(handle) = self.handle() {
                if self.manager.is_alive(handle.pid).await {
                    info!(pid = %handle.pid, "Previous launch still alive, resuming readiness probing");
                    self.transition(ProcessState::Launching)?;
                    self.transition(ProcessState::ProbingReadiness)?;
                    return self.await_readiness(handle).await;
                }
                self.manager.release(handle.pid);
                self.set_handle(None);
            }
        }

        let binding = &self.config.binding;
        if self.probe.is_open(binding).await {
            let occupants = self
                .manager
                .pids_on_port(binding)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Port occupant lookup failed");
                    Vec::new()
                });
            warn!(%binding, pids = ?occupants, "Port already in use");
            self.settle();
            return Err(SupervisorError::PortConflict {
                binding: binding.clone(),
                occupants,
            });
        }

        self.launch().await
    }

    async fn launch(&self) -> SupervisorResult<StartOutcome> {
        self.transition(ProcessState::Launching)?;

        let spec = LaunchSpec::from_config(&self.config);
        let output = self.open_session_output(&spec).await;

        info!(command = %spec.display_command(), mode = ?spec.mode, "Launching server");
        let pid = match self.manager.launch(&spec, output).await {
            Ok(pid) => pid,
            Err(e) => {
                error!(command = %spec.display_command(), error = %e, "Launch failed");
                self.note(&format!("launch failed: {e}")).await;
                self.transition(ProcessState::Failed)?;
                return Err(SupervisorError::ProcessLaunchFailure {
                    command: spec.display_command(),
                    reason: e.to_string(),
                    pid: None,
                    log_tail: self.failure_tail().await,
                });
            }
        };

        let handle = ProcessHandle {
            pid,
            launched_at: self.next_launch_time(),
            state: ProcessState::Launching,
        };
        self.set_handle(Some(handle.clone()));
        self.note(&format!("started pid {pid}")).await;

        self.transition(ProcessState::ProbingReadiness)?;
        self.await_readiness(handle).await
    }

    /// A log failure never blocks the launch; output is discarded instead
    async fn open_session_output(&self, spec: &LaunchSpec) -> Option<std::fs::File> {
        let session = match self.logs.open().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Launching without a log file");
                return None;
            }
        };

        if let Err(e) = session.note(&format!("$ {}", spec.display_command())).await {
            debug!(error = %e, "Failed to write log marker");
        }

        match session.stdio_file().await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %session.path().display(), error = %e, "Cannot hand log file to child");
                None
            }
        }
    }

    async fn await_readiness(&self, mut handle: ProcessHandle) -> SupervisorResult<StartOutcome> {
        let pid = handle.pid;
        let binding = &self.config.binding;
        let readiness = &self.config.readiness;
        let watch_exit = readiness.fail_on_early_exit;

        info!(pid = %pid, %binding, attempts = readiness.max_attempts, "Waiting for port to open");
        let outcome = self
            .probe
            .wait_for_readiness(
                binding,
                readiness.max_attempts,
                readiness.interval(),
                &self.shutdown,
                || self.process_alive(pid, watch_exit),
            )
            .await;

        match outcome {
            Readiness::Ready => {
                self.transition(ProcessState::Running)?;
                handle.state = ProcessState::Running;
                info!(pid = %pid, url = %self.config.url(), "Server is ready");
                self.note(&format!("ready on {}", self.config.url())).await;
                self.notify_browser().await;
                if self.shutdown.is_cancelled() {
                    info!(pid = %pid, "Start cancelled after readiness, stopping server");
                    if let Err(e) = self.stop_locked(self.config.grace_period(), true).await {
                        error!(pid = %pid, error = %e, "Failed to stop cancelled server");
                    }
                    return Err(SupervisorError::Cancelled);
                }
                Ok(StartOutcome::Started(handle))
            }
            Readiness::TimedOut => {
                warn!(pid = %pid, %binding, attempts = readiness.max_attempts, "Port did not open in time");
                self.note("port did not open in time").await;
                self.transition(ProcessState::Failed)?;
                Err(SupervisorError::ReadinessTimeout {
                    pid,
                    binding: binding.clone(),
                    attempts: readiness.max_attempts,
                    log_tail: self.failure_tail().await,
                })
            }
            Readiness::Exited => {
                error!(pid = %pid, "Server exited before opening its port");
                self.note("process exited before opening its port").await;
                self.transition(ProcessState::Failed)?;
                self.set_handle(None);
                self.manager.release(pid);
                Err(SupervisorError::ProcessLaunchFailure {
                    command: LaunchSpec::from_config(&self.config).display_command(),
                    reason: "process exited before opening its port".to_string(),
                    pid: Some(pid),
                    log_tail: self.failure_tail().await,
                })
            }
            Readiness::Cancelled => {
                info!(pid = %pid, "Start cancelled, stopping server");
                if let Err(e) = self.stop_locked(self.config.grace_period(), true).await {
                    error!(pid = %pid, error = %e, "Failed to stop cancelled server");
                }
                Err(SupervisorError::Cancelled)
            }
        }
    }

    async fn process_alive(&self, pid: ProcessId, watch_exit: bool) -> bool {
        !watch_exit || self.manager.is_alive(pid).await
    }

    async fn notify_browser(&self) {
        let url = self.config.url();
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.config.notify_delay()) => {}
        }

        let timeout = self.config.notify_timeout();
        match tokio::time::timeout(timeout, self.notifier.notify_ready(&url)).await {
            Ok(Ok(())) => debug!(%url, "Browser notified"),
            Ok(Err(e)) => warn!(%url, error = %e, "Browser notification failed"),
            Err(_) => warn!(%url, ?timeout, "Browser notification timed out"),
        }
    }

    /// Returns `None` when there was nothing to stop
    async fn stop_locked(
        &self,
        grace_period: Duration,
        publish_stopped: bool,
    ) -> SupervisorResult<Option<TerminationReport>> {
        let state = self.state();
        if matches!(state, ProcessState::Idle | ProcessState::Stopped) {
            debug!(%state, "Nothing to stop");
            return Ok(None);
        }

        self.transition(ProcessState::Stopping)?;
        let target = self
            .handle()
            .map_or(TerminationTarget::Port, |handle| TerminationTarget::Pid(handle.pid));
        info!(?target, ?grace_period, "Stopping server");

        let report = match self.termination.terminate_with_grace(target, grace_period).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Stop failed");
                self.note(&format!("stop failed: {e}")).await;
                return Err(e);
            }
        };

        self.note("server stopped").await;
        self.set_handle(None);
        if publish_stopped {
            self.transition(ProcessState::Stopped)?;
        }
        Ok(Some(report))
    }
}
