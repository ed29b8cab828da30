use std::time::Duration;

use tokio::task::JoinHandle;

use super::clock::SharedClock;
use super::process::{
    KillReason, ProcessHandle, ProcessState, TerminalState, TerminationCause, Terminator,
    TimeLimitKind,
};
use super::usage::{self, ResourceUsage};

/// Ceilings enforced on one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub memory_bytes: u64,
}

impl ResourceLimits {
    /// Scales every ceiling by `factor`
    pub fn scaled(&self, factor: u32) -> Self {
        Self {
            cpu_time: self.cpu_time * factor,
            wall_time: self.wall_time * factor,
            memory_bytes: self.memory_bytes.saturating_mul(u64::from(factor)),
        }
    }
}

/// Returns the first ceiling crossed, checking memory, then CPU time, then wall time
pub fn check_limits(
    limits: &ResourceLimits,
    usage: &ResourceUsage,
    elapsed: Duration,
) -> Option<TerminationCause> {
    if usage.peak_memory_bytes > limits.memory_bytes {
        Some(TerminationCause::MemoryLimit)
    } else if usage.cpu_time > limits.cpu_time {
        Some(TerminationCause::TimeLimit(TimeLimitKind::CpuTime))
    } else if elapsed >= limits.wall_time {
        Some(TerminationCause::TimeLimit(TimeLimitKind::WallTime))
    } else {
        None
    }
}

/// Checks the final usage of a settled process against its CPU and memory ceilings
///
/// A process can cross a ceiling and exit between two samples of the poller.
/// The merged `wait4` and procfs figures catch that here. Wall time is left
/// alone: the poller and the session deadline already bound it.
pub fn reclassify_by_usage(limits: &ResourceLimits, mut terminal: TerminalState) -> TerminalState {
    let decided_by_limit = matches!(
        terminal.state,
        ProcessState::MemoryExceeded
            | ProcessState::TimedOut(_)
            | ProcessState::Killed(KillReason::SessionDeadline)
            | ProcessState::Running
    );
    if decided_by_limit {
        return terminal;
    }
    let state = match check_limits(limits, &terminal.usage, Duration::ZERO) {
        Some(TerminationCause::MemoryLimit) => ProcessState::MemoryExceeded,
        Some(TerminationCause::TimeLimit(TimeLimitKind::CpuTime)) => {
            ProcessState::TimedOut(TimeLimitKind::CpuTime)
        }
        _ => return terminal,
    };
    log::info!(
        "Final usage {:?} is over {:?}, {:?} becomes {state:?}",
        terminal.usage,
        limits,
        terminal.state
    );
    terminal.state = state;
    terminal
}

/// Polls a process and kills it the moment one of its limits is crossed
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    limits: ResourceLimits,
    poll_interval: Duration,
    clock: SharedClock,
}

/// Keeps the monitoring task alive; dropping it stops monitoring
#[derive(Debug)]
pub struct LimiterGuard {
    task: JoinHandle<Option<TerminationCause>>,
}

impl LimiterGuard {
    /// Waits for the monitor to stop and returns the breach it acted on, if any
    pub async fn finish(mut self) -> Option<TerminationCause> {
        match (&mut self.task).await {
            Ok(breach) => breach,
            Err(e) => {
                log::error!("Limiter task failed: {e}");
                None
            }
        }
    }
}

impl Drop for LimiterGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl ResourceLimiter {
    pub fn new(limits: ResourceLimits, poll_interval: Duration, clock: SharedClock) -> Self {
        Self {
            limits,
            poll_interval,
            clock,
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Starts monitoring `handle`
    pub fn arm(&self, handle: &ProcessHandle) -> LimiterGuard {
        let limiter = self.clone();
        let terminator = handle.terminator();
        log::debug!(
            "Arming limiter for {} (pid {}): {:?}",
            terminator.label(),
            terminator.pid(),
            self.limits
        );
        LimiterGuard {
            task: tokio::spawn(async move { limiter.monitor(terminator).await }),
        }
    }

    async fn monitor(self, terminator: Terminator) -> Option<TerminationCause> {
        loop {
            if terminator.is_settled() {
                return None;
            }

            if let Some(sampled) = usage::sample(terminator.pid()) {
                terminator.record_usage(sampled);
            }
            let elapsed = self.clock.now().saturating_sub(terminator.started_at());
            if let Some(cause) = check_limits(&self.limits, &terminator.peak_usage(), elapsed) {
                if terminator.terminate(cause) {
                    log::info!(
                        "{} (pid {}) crossed a limit after {elapsed:?}: {cause:?}",
                        terminator.label(),
                        terminator.pid()
                    );
                    return Some(cause);
                }
                return None;
            }

            let until_wall_limit = self.limits.wall_time.saturating_sub(elapsed);
            let pause = self.poll_interval.min(until_wall_limit).max(Duration::from_millis(1));
            tokio::time::sleep(pause).await;
        }
    }
}
