use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::config::{JudgeConfig, TranscriptMode, validate_limits};
use crate::error::{JudgeError, JudgeResult};
use crate::sandbox::{
    LimiterGuard, ProcessHandle, ProgramSpec, ResourceLimiter, ResourceLimits, SharedClock,
    TerminalState, TerminationCause, reclassify_by_usage,
};
use crate::verdict::{
    Culprit, JudgeReport, StreamFailure, Verdict, VerdictResolver, apply_stream_faults,
};

use super::bridge::{
    BridgeMode, BridgeReport, Capture, FaultSide, PipeBridge, Progress, TranscriptLog,
    spawn_capture,
};
use super::checker::run_checker;
use super::workspace::Workspace;
use super::{COLLECT_TIMEOUT, TestCase, collect_terminal};

const SOLUTION_TO_INTERACTOR: &str = "solution->interactor";
const INTERACTOR_TO_SOLUTION: &str = "interactor->solution";
const BRIDGE_DRAIN: Duration = Duration::from_millis(200);

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Init,
    Spawning,
    Running,
    Finalizing,
    Done,
}

/// Runs one solution against one interactor on one test case
pub struct InteractionSession<'a> {
    id: String,
    test: &'a TestCase,
    solution: ProgramSpec,
    interactor: ProgramSpec,
    checker: Option<ProgramSpec>,
    config: &'a JudgeConfig,
    clock: SharedClock,
    resolver: VerdictResolver,
    phase: SessionPhase,
}

/// Everything alive between spawning and finalizing
struct LiveSession {
    solution: ProcessHandle,
    interactor: ProcessHandle,
    solution_limits: ResourceLimits,
    interactor_limits: ResourceLimits,
    limiters: Vec<LimiterGuard>,
    to_interactor: PipeBridge,
    to_solution: PipeBridge,
    solution_stderr: Capture,
    interactor_stderr: Capture,
    progress: Arc<Progress>,
    transcript: Option<TranscriptLog>,
    cancel: CancellationToken,
    started_at: Duration,
}

impl LiveSession {
    fn terminate_all(&self, cause: TerminationCause) {
        self.solution.terminate(cause);
        self.interactor.terminate(cause);
    }
}

/// Terminal states observed by the event loop
#[derive(Default)]
struct Observed {
    solution: Option<JudgeResult<TerminalState>>,
    interactor: Option<JudgeResult<TerminalState>>,
}

impl<'a> InteractionSession<'a> {
    pub fn new(
        test: &'a TestCase,
        solution: ProgramSpec,
        interactor: ProgramSpec,
        config: &'a JudgeConfig,
        clock: SharedClock,
    ) -> Self {
        let id = format!(
            "{}-{}-{}",
            Local::now().format("%y%m%d-%H-%M-%S"),
            std::process::id(),
            SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            id,
            test,
            solution,
            interactor,
            checker: None,
            config,
            clock,
            resolver: VerdictResolver::new(config.exit_codes.clone()),
            phase: SessionPhase::Init,
        }
    }

    pub fn with_checker(mut self, checker: ProgramSpec) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Drives the session to its verdict
    ///
    /// Every failure, including the judge's own, ends up in the returned report.
    /// A session runs once; afterwards it stays in [`SessionPhase::Done`].
    pub async fn run(&mut self) -> JudgeReport {
        let created_time = crate::create_timestamp();
        if self.phase != SessionPhase::Init {
            log::error!("Session {} was already run", self.id);
            return JudgeReport::new(
                &self.id,
                created_time,
                Verdict::judge_failure(Culprit::Unknown, "session was already run"),
            );
        }
        log::info!("Session {} started", self.id);

        let workspace = match self.prepare() {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Session {} setup failed: {e}", self.id);
                self.enter(SessionPhase::Done);
                return JudgeReport::new(
                    &self.id,
                    created_time,
                    Verdict::judge_failure(Culprit::Unknown, e.to_string()),
                );
            }
        };

        let report = self.interact(&workspace, created_time).await;
        self.enter(SessionPhase::Done);
        drop(workspace);

        log::info!(
            "Session {} finished: {} ({} ms, {} bytes exchanged)",
            self.id,
            report.outcome,
            report.wall_time_ms,
            report.bytes_exchanged
        );
        report
    }

    fn enter(&mut self, phase: SessionPhase) {
        debug_assert!(phase > self.phase, "{:?} -> {phase:?}", self.phase);
        log::debug!("Session {}: {:?} -> {phase:?}", self.id, self.phase);
        self.phase = phase;
    }

    fn prepare(&self) -> JudgeResult<Workspace> {
        validate_limits(&self.test.limits)?;
        for program in [&self.solution, &self.interactor].into_iter().chain(&self.checker) {
            if program.path.as_os_str().is_empty() {
                return Err(JudgeError::InvalidSetup("empty program path".to_string()));
            }
        }
        let root = self.config.scratch_root()?;
        Workspace::create(
            &root,
            &self.id,
            &self.test.input,
            &self.test.expected_output,
            self.config.keep_work_dir,
        )
    }

    async fn interact(&mut self, workspace: &Workspace, created_time: String) -> JudgeReport {
        self.enter(SessionPhase::Spawning);
        let solution_limits = self.test.limits;
        let interactor_limits = self.config.interactor_limits(&solution_limits);

        // the interactor goes first so a broken judge never runs contestant code
        let interactor = match ProcessHandle::spawn(
            "interactor",
            &self.interactor,
            &workspace.judge_args(),
            &interactor_limits,
            self.clock.clone(),
            workspace.dir(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Session {}: {e}", self.id);
                return JudgeReport::new(
                    &self.id,
                    created_time,
                    Verdict::judge_failure(Culprit::Interactor, e.to_string()),
                );
            }
        };

        let solution = match ProcessHandle::spawn(
            "solution",
            &self.solution,
            &[],
            &solution_limits,
            self.clock.clone(),
            workspace.solution_dir(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Session {}: {e}", self.id);
                interactor.terminate(TerminationCause::Teardown);
                let mut report = JudgeReport::new(
                    &self.id,
                    created_time,
                    Verdict::judge_failure(Culprit::Unknown, e.to_string()),
                );
                report.interactor_exit = collect_terminal(&interactor, COLLECT_TIMEOUT).await;
                return report;
            }
        };

        let live = match self.wire(
            solution,
            interactor,
            workspace,
            solution_limits,
            interactor_limits,
        ) {
            Ok(live) => live,
            Err(e) => {
                log::error!("Session {}: {e}", self.id);
                return JudgeReport::new(
                    &self.id,
                    created_time,
                    Verdict::judge_failure(Culprit::Unknown, e.to_string()),
                );
            }
        };

        self.enter(SessionPhase::Running);
        let deadline = solution_limits.wall_time.max(interactor_limits.wall_time)
            + self.config.grace_period();
        let observed = self.drive(&live, deadline).await;

        self.enter(SessionPhase::Finalizing);
        self.finalize(live, observed, workspace, created_time).await
    }

    fn wire(
        &self,
        mut solution: ProcessHandle,
        mut interactor: ProcessHandle,
        workspace: &Workspace,
        solution_limits: ResourceLimits,
        interactor_limits: ResourceLimits,
    ) -> JudgeResult<LiveSession> {
        let missing = |stream: &str| JudgeError::InvalidSetup(format!("{stream} is not piped"));
        let solution_stdout = solution.take_stdout().ok_or_else(|| missing("solution stdout"))?;
        let solution_stdin = solution.take_stdin().ok_or_else(|| missing("solution stdin"))?;
        let solution_stderr = solution.take_stderr().ok_or_else(|| missing("solution stderr"))?;
        let interactor_stdout = interactor
            .take_stdout()
            .ok_or_else(|| missing("interactor stdout"))?;
        let interactor_stdin = interactor
            .take_stdin()
            .ok_or_else(|| missing("interactor stdin"))?;
        let interactor_stderr = interactor
            .take_stderr()
            .ok_or_else(|| missing("interactor stderr"))?;

        let transcript = match self.config.transcript {
            TranscriptMode::Log => Some(TranscriptLog::new(self.config.transcript_limit_bytes)),
            TranscriptMode::None | TranscriptMode::File => None,
        };
        let mode = match (&transcript, self.config.transcript) {
            (Some(log), _) => BridgeMode::TeeToLog(log.clone()),
            (None, TranscriptMode::File) => BridgeMode::FileBacked(workspace.transcript.clone()),
            (None, _) => BridgeMode::Passthrough,
        };

        let cancel = CancellationToken::new();
        let started_at = self.clock.now();
        let progress = Arc::new(Progress::new(started_at));
        let to_interactor = PipeBridge::connect(
            SOLUTION_TO_INTERACTOR,
            solution_stdout,
            interactor_stdin,
            mode.clone(),
            progress.clone(),
            self.clock.clone(),
            &cancel,
        );
        let to_solution = PipeBridge::connect(
            INTERACTOR_TO_SOLUTION,
            interactor_stdout,
            solution_stdin,
            mode,
            progress.clone(),
            self.clock.clone(),
            &cancel,
        );

        let poll_interval = self.config.poll_interval();
        let limiters = vec![
            ResourceLimiter::new(solution_limits, poll_interval, self.clock.clone()).arm(&solution),
            ResourceLimiter::new(interactor_limits, poll_interval, self.clock.clone())
                .arm(&interactor),
        ];

        Ok(LiveSession {
            solution,
            interactor,
            solution_limits,
            interactor_limits,
            limiters,
            to_interactor,
            to_solution,
            solution_stderr: spawn_capture(solution_stderr, self.config.message_limit_bytes),
            interactor_stderr: spawn_capture(interactor_stderr, self.config.message_limit_bytes),
            progress,
            transcript,
            cancel,
            started_at,
        })
    }

    /// Waits for both processes, enforcing grace, idleness and the session deadline
    async fn drive(&self, live: &LiveSession, deadline: Duration) -> Observed {
        let grace = self.config.grace_period();
        let idleness = self.config.idleness_timeout();
        let mut observed = Observed::default();
        let mut grace_until: Option<Duration> = None;

        while observed.solution.is_none() || observed.interactor.is_none() {
            let now = self.clock.now();
            let elapsed = now.saturating_sub(live.started_at);
            if elapsed >= deadline {
                log::warn!("Session {} hit its deadline after {elapsed:?}", self.id);
                live.terminate_all(TerminationCause::SessionDeadline);
                live.cancel.cancel();
                break;
            }

            let both_running = observed.solution.is_none() && observed.interactor.is_none();
            let idle = live.progress.idle_for(now);
            if both_running && idle >= idleness {
                log::info!("Session {}: no bytes exchanged for {idle:?}", self.id);
                live.terminate_all(TerminationCause::Idleness);
                break;
            }

            if let Some(until) = grace_until {
                if now >= until {
                    log::info!("Session {}: grace period expired", self.id);
                    live.terminate_all(TerminationCause::GraceExpired);
                    break;
                }
            }

            let mut wake = deadline.saturating_sub(elapsed);
            if both_running {
                wake = wake.min(idleness.saturating_sub(idle));
            }
            if let Some(until) = grace_until {
                wake = wake.min(until.saturating_sub(now));
            }

            tokio::select! {
                terminal = live.solution.wait(), if observed.solution.is_none() => {
                    log::debug!("Session {}: solution settled: {terminal:?}", self.id);
                    observed.solution = Some(terminal);
                    if observed.interactor.is_none() {
                        grace_until = Some(self.clock.now() + grace);
                    }
                }
                terminal = live.interactor.wait(), if observed.interactor.is_none() => {
                    log::debug!("Session {}: interactor settled: {terminal:?}", self.id);
                    observed.interactor = Some(terminal);
                    if observed.solution.is_none() {
                        grace_until = Some(self.clock.now() + grace);
                    }
                }
                _ = tokio::time::sleep(wake.max(Duration::from_millis(1))) => {}
            }
        }

        observed
    }

    async fn finalize(
        &self,
        live: LiveSession,
        observed: Observed,
        workspace: &Workspace,
        created_time: String,
    ) -> JudgeReport {
        let LiveSession {
            solution,
            interactor,
            solution_limits,
            interactor_limits,
            limiters,
            to_interactor,
            to_solution,
            solution_stderr,
            interactor_stderr,
            progress,
            transcript,
            cancel,
            started_at,
        } = live;

        // no-ops for whatever already settled
        solution.terminate(TerminationCause::Teardown);
        interactor.terminate(TerminationCause::Teardown);
        let solution_exit = settled(observed.solution, &solution)
            .await
            .map(|terminal| reclassify_by_usage(&solution_limits, terminal));
        let interactor_exit = settled(observed.interactor, &interactor)
            .await
            .map(|terminal| reclassify_by_usage(&interactor_limits, terminal));
        let wall_time = self.clock.now().saturating_sub(started_at);
        drop(limiters);

        let bridges: Vec<BridgeReport> = vec![
            to_interactor.shutdown(BRIDGE_DRAIN).await,
            to_solution.shutdown(BRIDGE_DRAIN).await,
        ];
        cancel.cancel();
        let message = interactor_stderr.collect(COLLECT_TIMEOUT).await;
        let diagnostics = solution_stderr.collect(COLLECT_TIMEOUT).await;
        if diagnostics.total > 0 {
            log::debug!(
                "Session {}: solution wrote {} bytes to stderr",
                self.id,
                diagnostics.total
            );
        }

        let mut verdict = self.resolver.resolve(
            solution_exit.as_ref(),
            interactor_exit.as_ref(),
            &message.text(),
        );
        verdict = apply_stream_faults(verdict, &stream_failures(&bridges), progress.bytes());
        log::info!("Session {} interaction verdict: {verdict}", self.id);

        let mut checker_exit = None;
        if verdict.is_accepted() {
            if let Some(checker) = &self.checker {
                let run = run_checker(
                    checker,
                    workspace,
                    &interactor_limits,
                    self.config,
                    self.clock.clone(),
                    &self.resolver,
                )
                .await;
                verdict = run.verdict;
                checker_exit = run.terminal;
            }
        }

        let mut report =
            JudgeReport::new(&self.id, created_time, verdict).with_solution_exit(solution_exit);
        report.interactor_exit = interactor_exit;
        report.checker_exit = checker_exit;
        report.wall_time_ms = wall_time.as_millis() as u64;
        report.bytes_exchanged = progress.bytes();
        report.auxiliary_output = workspace.read_tout(self.config.message_limit_bytes);
        report.stream_faults = bridges.into_iter().filter_map(|bridge| bridge.fault).collect();
        report.transcript = transcript.map(|log| log.entries()).unwrap_or_default();
        report
    }
}

async fn settled(
    observed: Option<JudgeResult<TerminalState>>,
    handle: &ProcessHandle,
) -> Option<TerminalState> {
    match observed {
        Some(Ok(terminal)) => Some(terminal),
        Some(Err(e)) => {
            log::error!("Terminal state of {} unavailable: {e}", handle.label());
            None
        }
        None => collect_terminal(handle, COLLECT_TIMEOUT).await,
    }
}

/// Attributes each bridge fault to the process owning the failing end
fn stream_failures(bridges: &[BridgeReport]) -> Vec<StreamFailure> {
    bridges
        .iter()
        .filter_map(|bridge| {
            let fault = bridge.fault.as_ref()?;
            let (reader, writer) = if bridge.channel == SOLUTION_TO_INTERACTOR {
                (Culprit::Solution, Culprit::Interactor)
            } else {
                (Culprit::Interactor, Culprit::Solution)
            };
            let owner = match fault.side {
                FaultSide::Read => reader,
                FaultSide::Write => writer,
            };
            Some(StreamFailure {
                owner,
                detail: fault.detail.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::StreamFault;

    #[test]
    fn faults_are_blamed_on_the_owning_end() {
        let fault = |channel: &str, side| BridgeReport {
            channel: channel.to_string(),
            fault: Some(StreamFault {
                channel: channel.to_string(),
                side,
                detail: format!("{channel} broke"),
            }),
            ..Default::default()
        };
        let failures = stream_failures(&[
            fault(SOLUTION_TO_INTERACTOR, FaultSide::Read),
            fault(INTERACTOR_TO_SOLUTION, FaultSide::Read),
            fault(INTERACTOR_TO_SOLUTION, FaultSide::Write),
            BridgeReport::default(),
        ]);
        let owners: Vec<Culprit> = failures.iter().map(|failure| failure.owner).collect();
        assert_eq!(
            owners,
            vec![Culprit::Solution, Culprit::Interactor, Culprit::Solution]
        );
    }

    #[test]
    fn phases_are_ordered() {
        assert!(SessionPhase::Init < SessionPhase::Spawning);
        assert!(SessionPhase::Running < SessionPhase::Finalizing);
        assert!(SessionPhase::Finalizing < SessionPhase::Done);
    }
}
