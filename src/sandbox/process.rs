use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::watch;

use super::clock::{Clock, SharedClock};
use super::limiter::ResourceLimits;
use super::usage::{ResourceUsage, serialize_millis};
use crate::error::{JudgeError, JudgeResult};

const READ_CHUNK: usize = 8192;

/// An executable together with its fixed leading arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProgramSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeLimitKind {
    CpuTime,
    WallTime,
}

/// Why a process ended up in [`ProcessState::Killed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    /// Died from a signal nobody in the judge sent
    Signal(i32),
    Idleness,
    GraceExpired,
    SessionDeadline,
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    ExitedNormally(i32),
    Killed(KillReason),
    TimedOut(TimeLimitKind),
    MemoryExceeded,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Reason passed to [`ProcessHandle::terminate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    TimeLimit(TimeLimitKind),
    MemoryLimit,
    Idleness,
    GraceExpired,
    SessionDeadline,
    Teardown,
}

impl TerminationCause {
    fn into_state(self) -> ProcessState {
        match self {
            Self::TimeLimit(kind) => ProcessState::TimedOut(kind),
            Self::MemoryLimit => ProcessState::MemoryExceeded,
            Self::Idleness => ProcessState::Killed(KillReason::Idleness),
            Self::GraceExpired => ProcessState::Killed(KillReason::GraceExpired),
            Self::SessionDeadline => ProcessState::Killed(KillReason::SessionDeadline),
            Self::Teardown => ProcessState::Killed(KillReason::Teardown),
        }
    }
}

/// Exit status as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl RawExit {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            Self::exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            Self::signaled(libc::WTERMSIG(status))
        } else {
            Self::default()
        }
    }

    fn into_state(self) -> ProcessState {
        match (self.code, self.signal) {
            (Some(code), _) => ProcessState::ExitedNormally(code),
            // RLIMIT_CPU backstop fired before the limiter noticed
            (None, Some(libc::SIGXCPU)) => ProcessState::TimedOut(TimeLimitKind::CpuTime),
            (None, Some(signal)) => ProcessState::Killed(KillReason::Signal(signal)),
            (None, None) => ProcessState::Killed(KillReason::Teardown),
        }
    }
}

/// The record produced when a process leaves `Running`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalState {
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub usage: ResourceUsage,
    #[serde(rename = "wall_time_ms", serialize_with = "serialize_millis")]
    pub wall_time: Duration,
    /// Clock reading at the moment the state was recorded
    #[serde(skip)]
    pub settled_at: Duration,
}

#[derive(Debug, Default)]
struct LatchState {
    requested: Option<TerminationCause>,
    terminal: Option<TerminalState>,
}

/// One-shot guard around the `Running -> terminal` transition
///
/// Whichever of a kill request or an observed exit is recorded first decides
/// the terminal state. Kills are delivered and the pid is reaped under the same
/// lock, so a signal can never reach a recycled pid.
#[derive(Debug, Default)]
pub(crate) struct TerminalLatch {
    inner: Mutex<LatchState>,
}

impl TerminalLatch {
    /// Records a forced termination; `deliver` only runs for the first accepted request
    pub(crate) fn request(&self, cause: TerminationCause, deliver: impl FnOnce()) -> bool {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() || inner.requested.is_some() {
            return false;
        }
        inner.requested = Some(cause);
        deliver();
        true
    }

    /// Records the terminal state exactly once; later calls return the first record
    pub(crate) fn settle<F>(
        &self,
        clock: &dyn Clock,
        started_at: Duration,
        reap: F,
    ) -> io::Result<TerminalState>
    where
        F: FnOnce() -> io::Result<(RawExit, ResourceUsage)>,
    {
        let mut inner = self.inner.lock();
        if let Some(terminal) = inner.terminal {
            return Ok(terminal);
        }

        let (raw, usage) = reap()?;
        let settled_at = clock.now();
        let state = match inner.requested {
            Some(cause) => cause.into_state(),
            None => raw.into_state(),
        };
        let terminal = TerminalState {
            state,
            exit_code: raw.code,
            signal: raw.signal,
            usage,
            wall_time: settled_at.saturating_sub(started_at),
            settled_at,
        };
        inner.terminal = Some(terminal);
        Ok(terminal)
    }

    pub(crate) fn terminal(&self) -> Option<TerminalState> {
        self.inner.lock().terminal
    }
}

#[derive(Debug)]
struct Shared {
    label: String,
    pid: u32,
    started_at: Duration,
    clock: SharedClock,
    latch: TerminalLatch,
    peak: Mutex<ResourceUsage>,
}

/// Cloneable handle that lets a watchdog kill a process it does not own
#[derive(Debug, Clone)]
pub struct Terminator {
    shared: Arc<Shared>,
}

impl Terminator {
    /// Kills the whole process group unless the process already settled.
    ///
    /// Returns `true` only for the call that actually delivered the kill.
    pub fn terminate(&self, cause: TerminationCause) -> bool {
        let pid = self.shared.pid;
        let delivered = self.shared.latch.request(cause, || kill_group(pid));
        if delivered {
            log::info!("Terminating {} (pid {pid}): {cause:?}", self.shared.label);
        }
        delivered
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn started_at(&self) -> Duration {
        self.shared.started_at
    }

    pub fn is_settled(&self) -> bool {
        self.shared.latch.terminal().is_some()
    }

    pub fn record_usage(&self, usage: ResourceUsage) {
        let mut peak = self.shared.peak.lock();
        *peak = peak.merge(usage);
    }

    pub fn peak_usage(&self) -> ResourceUsage {
        *self.shared.peak.lock()
    }
}

#[derive(Debug, Clone)]
enum Settlement {
    Settled(TerminalState),
    Lost(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    Closed,
    TimedOut,
}

/// One spawned subprocess with piped stdio
///
/// The process runs in its own process group. A blocking reaper records its
/// terminal state as soon as it exits; dropping a running handle kills it.
pub struct ProcessHandle {
    shared: Arc<Shared>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    settlement: watch::Receiver<Option<Settlement>>,
}

impl ProcessHandle {
    /// Spawns `program` with `extra_args` appended after its own arguments
    pub fn spawn(
        label: &str,
        program: &ProgramSpec,
        extra_args: &[String],
        limits: &ResourceLimits,
        clock: SharedClock,
        work_dir: &Path,
    ) -> JudgeResult<Self> {
        let mut cmd = Command::new(&program.path);
        cmd.args(&program.args)
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(work_dir)
            .process_group(0);

        let cpu_backstop = cpu_backstop_seconds(limits.cpu_time);
        unsafe {
            cmd.pre_exec(move || apply_rlimits(cpu_backstop));
        }

        log::debug!("Spawning {label}: {}", program.path.display());
        let mut child = cmd.spawn().map_err(|source| JudgeError::Spawn {
            program: program.path.clone(),
            source,
        })?;

        let shared = Arc::new(Shared {
            label: label.to_string(),
            pid: child.id(),
            started_at: clock.now(),
            clock,
            latch: TerminalLatch::default(),
            peak: Mutex::new(ResourceUsage::default()),
        });

        let (tx, settlement) = watch::channel(None);
        let reaper = Arc::clone(&shared);
        tokio::task::spawn_blocking(move || {
            let outcome = match reap(&reaper) {
                Ok(terminal) => {
                    log::debug!(
                        "{} (pid {}) settled as {:?}",
                        reaper.label,
                        reaper.pid,
                        terminal.state
                    );
                    Settlement::Settled(terminal)
                }
                Err(e) => {
                    log::error!("Failed to reap {} (pid {}): {e}", reaper.label, reaper.pid);
                    Settlement::Lost(e.to_string())
                }
            };
            tx.send_replace(Some(outcome));
        });

        // From here on a failure drops `handle`, which kills the child
        let mut handle = Self {
            shared,
            stdin: None,
            stdout: None,
            stderr: None,
            settlement,
        };
        handle.stdin = child.stdin.take().map(ChildStdin::from_std).transpose()?;
        handle.stdout = child.stdout.take().map(ChildStdout::from_std).transpose()?;
        handle.stderr = child.stderr.take().map(ChildStderr::from_std).transpose()?;

        log::info!("Spawned {label} with pid {}", handle.pid());
        Ok(handle)
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn terminator(&self) -> Terminator {
        Terminator {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Idempotent; a no-op once the process has settled
    pub fn terminate(&self, cause: TerminationCause) -> bool {
        self.terminator().terminate(cause)
    }

    pub fn state(&self) -> ProcessState {
        self.shared
            .latch
            .terminal()
            .map_or(ProcessState::Running, |terminal| terminal.state)
    }

    pub fn is_running(&self) -> bool {
        !self.state().is_terminal()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Writes all of `bytes` to the process's stdin
    pub async fn write(&mut self, bytes: &[u8]) -> JudgeResult<usize> {
        let channel = format!("{}.stdin", self.shared.label);
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(JudgeError::Stream {
                channel,
                source: io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed"),
            });
        };
        let result = match stdin.write_all(bytes).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        result.map_err(|source| JudgeError::Stream { channel, source })?;
        Ok(bytes.len())
    }

    /// Closes stdin, which the process observes as end of input
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Returns whatever stdout has produced, waiting at most `timeout` for it
    pub async fn read_available(&mut self, timeout: Duration) -> JudgeResult<ReadOutcome> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(ReadOutcome::Closed);
        };
        let mut buf = vec![0u8; READ_CHUNK];
        match tokio::time::timeout(timeout, stdout.read(&mut buf)).await {
            Err(_) => Ok(ReadOutcome::TimedOut),
            Ok(Ok(0)) => {
                self.stdout = None;
                Ok(ReadOutcome::Closed)
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(ReadOutcome::Data(buf))
            }
            Ok(Err(source)) => Err(JudgeError::Stream {
                channel: format!("{}.stdout", self.shared.label),
                source,
            }),
        }
    }

    /// Suspends until the process has left `Running`
    pub async fn wait(&self) -> JudgeResult<TerminalState> {
        let mut rx = self.settlement.clone();
        let guard = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| JudgeError::ProcessLost(format!("reaper of {} vanished", self.label())))?;
        match &*guard {
            Some(Settlement::Settled(terminal)) => Ok(*terminal),
            Some(Settlement::Lost(msg)) => Err(JudgeError::ProcessLost(msg.clone())),
            None => Err(JudgeError::ProcessLost(format!("{} never settled", self.label()))),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.terminate(TerminationCause::Teardown) {
            log::warn!("{} (pid {}) dropped while running", self.label(), self.pid());
        }
    }
}

fn reap(shared: &Shared) -> io::Result<TerminalState> {
    wait_until_exited(shared.pid)?;
    shared
        .latch
        .settle(shared.clock.as_ref(), shared.started_at, || {
            // sweep anything left in the group while the leader still pins its id
            unsafe {
                libc::kill(-(shared.pid as libc::pid_t), libc::SIGKILL);
            }
            let (raw, usage) = wait4(shared.pid)?;
            Ok((raw, usage.merge(*shared.peak.lock())))
        })
}

/// Blocks until `pid` has exited, leaving it unreaped
fn wait_until_exited(pid: u32) -> io::Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn wait4(pid: u32) -> io::Result<(RawExit, ResourceUsage)> {
    loop {
        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::wait4(pid as libc::pid_t, &mut status, 0, &mut rusage) };
        if rc == pid as libc::pid_t {
            return Ok((RawExit::from_wait_status(status), ResourceUsage::from(rusage)));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn kill_group(pid: u32) {
    let pid = pid as libc::pid_t;
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
        libc::kill(pid, libc::SIGKILL);
    }
}

/// `RLIMIT_CPU` in whole seconds, kept above the polled limit so the limiter fires first
fn cpu_backstop_seconds(cpu_time: Duration) -> u64 {
    cpu_time.as_secs() + u64::from(cpu_time.subsec_nanos() > 0) + 1
}

fn apply_rlimits(cpu_seconds: u64) -> io::Result<()> {
    let cpu = libc::rlimit {
        rlim_cur: cpu_seconds as libc::rlim_t,
        rlim_max: (cpu_seconds + 1) as libc::rlim_t,
    };
    let core = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe {
        if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::sandbox::clock::{ManualClock, MonotonicClock};

    fn reaped(raw: RawExit) -> impl FnOnce() -> io::Result<(RawExit, ResourceUsage)> {
        move || Ok((raw, ResourceUsage::default()))
    }

    #[test]
    fn exit_recorded_first_wins_over_late_limit() {
        let clock = ManualClock::new();
        let latch = TerminalLatch::default();

        clock.set(Duration::from_millis(1000));
        let terminal = latch.settle(&clock, Duration::ZERO, reaped(RawExit::exited(0))).unwrap();
        assert_eq!(terminal.state, ProcessState::ExitedNormally(0));
        assert_eq!(terminal.wall_time, Duration::from_millis(1000));

        // the limiter fires in the same instant, after the exit was recorded
        let delivered = Cell::new(false);
        let accepted = latch.request(TerminationCause::TimeLimit(TimeLimitKind::WallTime), || {
            delivered.set(true)
        });
        assert!(!accepted);
        assert!(!delivered.get());
        assert_eq!(latch.terminal().unwrap().state, ProcessState::ExitedNormally(0));
    }

    #[test]
    fn limit_recorded_first_wins_over_late_exit() {
        let clock = ManualClock::new();
        let latch = TerminalLatch::default();
        clock.set(Duration::from_millis(1000));

        assert!(latch.request(TerminationCause::TimeLimit(TimeLimitKind::WallTime), || {}));
        let terminal = latch.settle(&clock, Duration::ZERO, reaped(RawExit::exited(0))).unwrap();

        assert_eq!(terminal.state, ProcessState::TimedOut(TimeLimitKind::WallTime));
        assert_eq!(terminal.exit_code, Some(0));
        assert_eq!(terminal.settled_at, Duration::from_millis(1000));
    }

    #[test]
    fn only_first_request_delivers() {
        let latch = TerminalLatch::default();
        let deliveries = Cell::new(0);
        assert!(latch.request(TerminationCause::MemoryLimit, || deliveries.set(deliveries.get() + 1)));
        assert!(!latch.request(TerminationCause::Teardown, || deliveries.set(deliveries.get() + 1)));
        assert_eq!(deliveries.get(), 1);

        let clock = ManualClock::new();
        let terminal = latch
            .settle(&clock, Duration::ZERO, reaped(RawExit::signaled(libc::SIGKILL)))
            .unwrap();
        assert_eq!(terminal.state, ProcessState::MemoryExceeded);
    }

    #[test]
    fn settle_runs_reap_once() {
        let clock = ManualClock::new();
        let latch = TerminalLatch::default();
        latch.settle(&clock, Duration::ZERO, reaped(RawExit::exited(3))).unwrap();
        let again = latch
            .settle(&clock, Duration::ZERO, || panic!("reaped twice"))
            .unwrap();
        assert_eq!(again.state, ProcessState::ExitedNormally(3));
    }

    #[test]
    fn wait_status_decoding() {
        assert_eq!(RawExit::from_wait_status(3 << 8), RawExit::exited(3));
        assert_eq!(RawExit::from_wait_status(libc::SIGSEGV), RawExit::signaled(libc::SIGSEGV));
        assert_eq!(
            RawExit::signaled(libc::SIGXCPU).into_state(),
            ProcessState::TimedOut(TimeLimitKind::CpuTime)
        );
        assert_eq!(
            RawExit::signaled(libc::SIGSEGV).into_state(),
            ProcessState::Killed(KillReason::Signal(libc::SIGSEGV))
        );
    }

    #[test]
    fn cpu_backstop_rounds_up() {
        assert_eq!(cpu_backstop_seconds(Duration::from_millis(1000)), 2);
        assert_eq!(cpu_backstop_seconds(Duration::from_millis(1500)), 3);
    }

    fn sh(script: &str) -> ProgramSpec {
        ProgramSpec::new("/bin/sh").arg("-c").arg(script)
    }

    fn limits() -> ResourceLimits {
        ResourceLimits {
            cpu_time: Duration::from_secs(5),
            wall_time: Duration::from_secs(10),
            memory_bytes: 256 * 1024 * 1024,
        }
    }

    fn spawn(program: &ProgramSpec) -> JudgeResult<ProcessHandle> {
        ProcessHandle::spawn(
            "test",
            program,
            &[],
            &limits(),
            MonotonicClock::shared(),
            &std::env::temp_dir(),
        )
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let handle = spawn(&sh("exit 7")).unwrap();
        let terminal = handle.wait().await.unwrap();
        assert_eq!(terminal.state, ProcessState::ExitedNormally(7));
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let handle = spawn(&sh("sleep 30")).unwrap();
        assert!(handle.terminate(TerminationCause::Teardown));
        assert!(!handle.terminate(TerminationCause::Idleness));

        let terminal = handle.wait().await.unwrap();
        assert_eq!(terminal.state, ProcessState::Killed(KillReason::Teardown));
        assert!(terminal.wall_time < Duration::from_secs(5));

        // terminal already: still a no-op
        assert!(!handle.terminate(TerminationCause::Teardown));
        assert_eq!(handle.wait().await.unwrap(), terminal);
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let result = spawn(&ProgramSpec::new("/definitely/not/here"));
        assert!(matches!(result, Err(JudgeError::Spawn { .. })));
    }

    #[tokio::test]
    async fn write_then_read_round_trips_through_cat() {
        let mut handle = spawn(&ProgramSpec::new("/bin/cat")).unwrap();
        assert_eq!(handle.write(b"5 7\n").await.unwrap(), 4);

        let mut received = Vec::new();
        while received.len() < 4 {
            match handle.read_available(Duration::from_secs(5)).await.unwrap() {
                ReadOutcome::Data(bytes) => received.extend(bytes),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(received, b"5 7\n");

        handle.close_stdin();
        assert_eq!(
            handle.read_available(Duration::from_secs(5)).await.unwrap(),
            ReadOutcome::Closed
        );
        assert_eq!(handle.wait().await.unwrap().state, ProcessState::ExitedNormally(0));
        assert!(handle.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn read_available_times_out_on_silence() {
        let mut handle = spawn(&sh("sleep 30")).unwrap();
        let outcome = handle.read_available(Duration::from_millis(50)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::TimedOut);
        drop(handle);
    }
}
