//! Two-pass termination: signal the known pid, then sweep the port.
//!
//! Detached launches decouple the child's lifetime from the supervisor, and
//! dev servers routinely fork workers, so the pid we hold is not always the
//! process bound to the port. The sweep pass catches whatever is left.

use crate::config::{PortBinding, TerminationConfig};
use crate::error::{SupervisorError, SupervisorResult};
use crate::probe::PortProbe;
use crate::process::{ProcessId, ProcessLauncher, ProcessTermination, TerminationResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationTarget {
    /// The supervised pid is known
    Pid(ProcessId),
    /// Pid unknown; only the port sweep runs
    Port,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPhase {
    Graceful,
    Forceful,
}

/// One escalation step against one pid
#[derive(Debug, Clone)]
pub struct TerminationAttempt {
    pub target: ProcessId,
    pub phase: TerminationPhase,
    pub deadline: Instant,
}

impl TerminationAttempt {
    fn new(target: ProcessId, phase: TerminationPhase, wait: Duration) -> Self {
        Self {
            target,
            phase,
            deadline: Instant::now() + wait,
        }
    }
}

/// What a successful termination had to do
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminationReport {
    /// The known pid exited within the grace period
    pub exited_gracefully: bool,
    /// The known pid needed a forceful kill
    pub forced: bool,
    /// Port occupants killed by the sweep
    pub swept: Vec<ProcessId>,
}

pub struct TerminationPolicy<M> {
    manager: Arc<M>,
    probe: PortProbe,
    binding: PortBinding,
    config: TerminationConfig,
}

impl<M> TerminationPolicy<M>
where
    M: ProcessLauncher + ProcessTermination,
{
    pub fn new(
        manager: Arc<M>,
        probe: PortProbe,
        binding: PortBinding,
        config: TerminationConfig,
    ) -> Self {
        Self {
            manager,
            probe,
            binding,
            config,
        }
    }

    pub fn binding(&self) -> &PortBinding {
        &self.binding
    }

    pub async fn terminate(&self, target: TerminationTarget) -> SupervisorResult<TerminationReport> {
        self.terminate_with_grace(target, self.config.grace_period())
            .await
    }

    /// Succeeds only once the port is confirmed free
    pub async fn terminate_with_grace(
        &self,
        target: TerminationTarget,
        grace_period: Duration,
    ) -> SupervisorResult<TerminationReport> {
        let mut report = TerminationReport::default();

        if let TerminationTarget::Pid(pid) = target {
            self.stop_pid(pid, grace_period, &mut report).await?;
        }

        self.sweep_port(&mut report).await;
        self.confirm_released().await?;

        info!(
            binding = %self.binding,
            graceful = report.exited_gracefully,
            forced = report.forced,
            swept = report.swept.len(),
            "Termination complete"
        );
        Ok(report)
    }

    async fn stop_pid(
        &self,
        pid: ProcessId,
        grace_period: Duration,
        report: &mut TerminationReport,
    ) -> SupervisorResult<()> {
        let attempt = TerminationAttempt::new(pid, TerminationPhase::Graceful, grace_period);
        debug!(?attempt, "Starting termination attempt");

        match self.manager.terminate_gracefully(pid).await {
            TerminationResult::ProcessNotFound => {
                info!(pid = %pid, "Process already gone");
                self.manager.release(pid);
                report.exited_gracefully = true;
                return Ok(());
            }
            TerminationResult::Success => {
                if self.wait_for_exit(pid, attempt.deadline).await {
                    info!(pid = %pid, "Process exited gracefully");
                    self.manager.release(pid);
                    report.exited_gracefully = true;
                    return Ok(());
                }
                warn!(pid = %pid, ?grace_period, "Process ignored graceful termination");
            }
            other => {
                warn!(pid = %pid, result = ?other, "Graceful termination not delivered");
            }
        }

        let attempt =
            TerminationAttempt::new(pid, TerminationPhase::Forceful, self.config.kill_wait());
        debug!(?attempt, "Escalating termination attempt");
        report.forced = true;

        let result = self.manager.force_kill(pid).await;
        if self.wait_for_exit(pid, attempt.deadline).await {
            info!(pid = %pid, "Process killed");
            self.manager.release(pid);
            return Ok(());
        }

        error!(pid = %pid, result = ?result, "Process survived forceful termination");
        Err(SupervisorError::TerminationFailed { pid })
    }

    /// Poll liveness until the deadline; checks at least once
    async fn wait_for_exit(&self, pid: ProcessId, deadline: Instant) -> bool {
        loop {
            if !self.manager.is_alive(pid).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn sweep_port(&self, report: &mut TerminationReport) {
        let own_pid = ProcessId(std::process::id());
        let occupants = match self.manager.pids_on_port(&self.binding).await {
            Ok(pids) => pids,
            Err(e) => {
                warn!(binding = %self.binding, error = %e, "Port occupant lookup failed");
                return;
            }
        };

        let targets: Vec<ProcessId> = occupants.into_iter().filter(|pid| *pid != own_pid).collect();
        if targets.is_empty() {
            return;
        }

        info!(binding = %self.binding, pids = ?targets, "Sweeping port occupants");
        for pid in &targets {
            match self.manager.force_kill(*pid).await {
                TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                other => warn!(pid = %pid, result = ?other, "Failed to kill port occupant"),
            }
        }

        let deadline = Instant::now() + self.config.kill_wait();
        for pid in &targets {
            if !self.wait_for_exit(*pid, deadline).await {
                warn!(pid = %pid, "Port occupant still alive after kill");
            }
            self.manager.release(*pid);
        }
        report.swept = targets;
    }

    async fn confirm_released(&self) -> SupervisorResult<()> {
        let released = self
            .probe
            .wait_until_closed(
                &self.binding,
                self.config.release_timeout(),
                self.config.poll_interval(),
            )
            .await;
        if released {
            return Ok(());
        }

        let occupants = self
            .manager
            .pids_on_port(&self.binding)
            .await
            .unwrap_or_default();
        error!(binding = %self.binding, pids = ?occupants, "Port still bound after termination");
        Err(SupervisorError::PortReleaseTimeout {
            binding: self.binding.clone(),
            occupants,
        })
    }
}
