use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{JudgeError, JudgeResult};
use crate::sandbox::{KillReason, ProcessState, TerminalState, TimeLimitKind};

mod report;

pub use report::{ContestantView, JudgeReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Accepted,
    #[serde(rename = "Wrong Answer")]
    WrongAnswer,
    #[serde(rename = "Presentation Error")]
    PresentationError,
    #[serde(rename = "Runtime Error")]
    RuntimeError,
    #[serde(rename = "Time Limit Exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "Memory Limit Exceeded")]
    MemoryLimitExceeded,
    #[serde(rename = "Idleness Limit Exceeded")]
    IdlenessLimitExceeded,
    #[serde(rename = "Security Violation")]
    SecurityViolation,
    #[serde(rename = "Judge Failure")]
    JudgeFailure,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::WrongAnswer => "Wrong Answer",
            Self::PresentationError => "Presentation Error",
            Self::RuntimeError => "Runtime Error",
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::MemoryLimitExceeded => "Memory Limit Exceeded",
            Self::IdlenessLimitExceeded => "Idleness Limit Exceeded",
            Self::SecurityViolation => "Security Violation",
            Self::JudgeFailure => "Judge Failure",
        }
    }

    /// Rank used when several outcomes compete; lower wins
    pub fn precedence(&self) -> u8 {
        match self {
            Self::JudgeFailure => 0,
            Self::MemoryLimitExceeded => 1,
            Self::TimeLimitExceeded => 2,
            Self::IdlenessLimitExceeded => 3,
            Self::SecurityViolation => 4,
            Self::RuntimeError => 5,
            // whatever the interactor or checker declared
            Self::Accepted | Self::WrongAnswer | Self::PresentationError => 6,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Party responsible for a non-accepted verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Culprit {
    Solution,
    Interactor,
    Checker,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub outcome: Outcome,
    pub culprit: Option<Culprit>,
    pub message: String,
}

impl Verdict {
    pub fn new(outcome: Outcome, culprit: Culprit, message: impl Into<String>) -> Self {
        Self {
            outcome,
            culprit: Some(culprit),
            message: message.into(),
        }
    }

    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Accepted,
            culprit: None,
            message: message.into(),
        }
    }

    pub fn judge_failure(culprit: Culprit, message: impl Into<String>) -> Self {
        Self::new(Outcome::JudgeFailure, culprit, message)
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome == Outcome::Accepted
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.culprit {
            Some(culprit) => write!(f, "{} ({culprit:?}): {}", self.outcome, self.message),
            None => write!(f, "{}: {}", self.outcome, self.message),
        }
    }
}

/// What an interactor or checker says through its exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclaredOutcome {
    Ok,
    WrongAnswer,
    PresentationError,
    Fail,
}

/// Mapping from exit code to declared outcome
///
/// Checker toolchains number these differently, so the mapping comes from
/// configuration. The default follows testlib.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExitCodeConvention {
    codes: BTreeMap<i32, DeclaredOutcome>,
}

impl ExitCodeConvention {
    pub fn testlib() -> Self {
        Self::from_codes([
            (0, DeclaredOutcome::Ok),
            (1, DeclaredOutcome::WrongAnswer),
            (2, DeclaredOutcome::PresentationError),
            (3, DeclaredOutcome::Fail),
            // _dirt: trailing garbage in the output
            (4, DeclaredOutcome::PresentationError),
        ])
    }

    pub fn from_codes(codes: impl IntoIterator<Item = (i32, DeclaredOutcome)>) -> Self {
        Self {
            codes: codes.into_iter().collect(),
        }
    }

    pub fn declared(&self, code: i32) -> JudgeResult<DeclaredOutcome> {
        self.codes.get(&code).copied().ok_or_else(|| {
            JudgeError::ProtocolViolation(format!("exit code {code} is not part of the convention"))
        })
    }
}

impl Default for ExitCodeConvention {
    fn default() -> Self {
        Self::testlib()
    }
}

/// A pipe failure other than the normal end-of-stream, attributed to one party
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    pub owner: Culprit,
    pub detail: String,
}

/// Pure classification of terminal states into a verdict
///
/// Precedence, strongest first: judge failure, memory, time, idleness,
/// security violation, runtime error, then whatever the interactor declared.
#[derive(Debug, Clone, Default)]
pub struct VerdictResolver {
    convention: ExitCodeConvention,
}

impl VerdictResolver {
    pub fn new(convention: ExitCodeConvention) -> Self {
        Self { convention }
    }

    pub fn resolve(
        &self,
        solution: Option<&TerminalState>,
        interactor: Option<&TerminalState>,
        interactor_message: &str,
    ) -> Verdict {
        let (solution, interactor) = match (solution, interactor) {
            (Some(solution), Some(interactor)) => (solution, interactor),
            (None, _) => {
                return Verdict::judge_failure(
                    Culprit::Unknown,
                    "terminal state of the solution is unavailable",
                );
            }
            (_, None) => {
                return Verdict::judge_failure(
                    Culprit::Unknown,
                    "terminal state of the interactor is unavailable",
                );
            }
        };

        // a rejection the interactor already reported stands over the crash it provoked
        let rejected_first =
            interactor.settled_at < solution.settled_at && self.declares_rejection(interactor);
        let mut candidates: Vec<Verdict> = Vec::with_capacity(2);
        candidates.extend(
            solution_candidate(solution)
                .filter(|verdict| !(rejected_first && verdict.outcome == Outcome::RuntimeError)),
        );

        // whatever the interactor did after the solution ran out of time follows from it
        let solution_timed_out = matches!(
            solution.state,
            ProcessState::TimedOut(_) | ProcessState::Killed(KillReason::SessionDeadline)
        );
        if !solution_timed_out || interactor.settled_at <= solution.settled_at {
            candidates.extend(self.interactor_candidate(interactor, interactor_message));
        }

        candidates
            .into_iter()
            .min_by_key(|verdict| verdict.outcome.precedence())
            .unwrap_or_else(|| {
                Verdict::judge_failure(
                    Culprit::Unknown,
                    format!(
                        "no verdict derivable from solution {:?} and interactor {:?}",
                        solution.state, interactor.state
                    ),
                )
            })
    }

    /// Classifies a post-interaction checker run with the same exit-code convention
    pub fn resolve_checker(&self, checker: Option<&TerminalState>, message: &str) -> Verdict {
        let Some(checker) = checker else {
            return Verdict::judge_failure(
                Culprit::Checker,
                "terminal state of the checker is unavailable",
            );
        };
        match checker.state {
            ProcessState::ExitedNormally(code) => {
                self.declared_verdict(code, message, Culprit::Checker)
            }
            state => Verdict::judge_failure(
                Culprit::Checker,
                format!("checker terminated abnormally: {state:?}"),
            ),
        }
    }

    fn interactor_candidate(&self, interactor: &TerminalState, message: &str) -> Option<Verdict> {
        let failure = |text: String| Some(Verdict::judge_failure(Culprit::Interactor, text));
        match interactor.state {
            ProcessState::ExitedNormally(code) => {
                Some(self.declared_verdict(code, message, Culprit::Interactor))
            }
            ProcessState::MemoryExceeded => Some(Verdict::new(
                Outcome::MemoryLimitExceeded,
                Culprit::Interactor,
                "interactor exceeded its memory limit",
            )),
            ProcessState::TimedOut(kind) => failure(format!(
                "interactor exceeded its {} limit",
                time_limit_name(kind)
            )),
            ProcessState::Killed(KillReason::Signal(signal)) => {
                failure(format!("interactor crashed with signal {signal}"))
            }
            ProcessState::Killed(KillReason::GraceExpired) => {
                failure("interactor did not exit after the solution finished".to_string())
            }
            ProcessState::Killed(KillReason::SessionDeadline) => {
                failure("interactor was still running at the session deadline".to_string())
            }
            ProcessState::Running => failure("interactor still running at finalization".to_string()),
            ProcessState::Killed(KillReason::Idleness | KillReason::Teardown) => None,
        }
    }

    fn declares_rejection(&self, interactor: &TerminalState) -> bool {
        match interactor.state {
            ProcessState::ExitedNormally(code) => matches!(
                self.convention.declared(code),
                Ok(DeclaredOutcome::WrongAnswer | DeclaredOutcome::PresentationError)
            ),
            _ => false,
        }
    }

    fn declared_verdict(&self, code: i32, message: &str, judge: Culprit) -> Verdict {
        match self.convention.declared(code) {
            Ok(DeclaredOutcome::Ok) => Verdict::accepted(message),
            Ok(DeclaredOutcome::WrongAnswer) => {
                Verdict::new(Outcome::WrongAnswer, Culprit::Solution, message)
            }
            Ok(DeclaredOutcome::PresentationError) => {
                Verdict::new(Outcome::PresentationError, Culprit::Solution, message)
            }
            Ok(DeclaredOutcome::Fail) => Verdict::judge_failure(judge, message),
            Err(e) if message.is_empty() => Verdict::judge_failure(judge, e.to_string()),
            Err(e) => Verdict::judge_failure(judge, format!("{e}; {message}")),
        }
    }
}

fn solution_candidate(solution: &TerminalState) -> Option<Verdict> {
    let verdict = |outcome, message: String| Some(Verdict::new(outcome, Culprit::Solution, message));
    match solution.state {
        ProcessState::ExitedNormally(0) => None,
        ProcessState::ExitedNormally(code) => {
            verdict(Outcome::RuntimeError, format!("exited with code {code}"))
        }
        ProcessState::Killed(KillReason::Signal(libc::SIGSYS)) => verdict(
            Outcome::SecurityViolation,
            "killed for a forbidden system call".to_string(),
        ),
        ProcessState::Killed(KillReason::Signal(signal)) => {
            verdict(Outcome::RuntimeError, format!("killed by signal {signal}"))
        }
        ProcessState::TimedOut(kind) => verdict(
            Outcome::TimeLimitExceeded,
            format!("{} limit exceeded", time_limit_name(kind)),
        ),
        ProcessState::Killed(KillReason::SessionDeadline) => verdict(
            Outcome::TimeLimitExceeded,
            "still running at the session deadline".to_string(),
        ),
        ProcessState::MemoryExceeded => {
            verdict(Outcome::MemoryLimitExceeded, "memory limit exceeded".to_string())
        }
        ProcessState::Killed(KillReason::Idleness) => verdict(
            Outcome::IdlenessLimitExceeded,
            "no bytes were exchanged within the idleness limit".to_string(),
        ),
        ProcessState::Killed(KillReason::GraceExpired) => verdict(
            Outcome::IdlenessLimitExceeded,
            "did not exit after the interactor finished".to_string(),
        ),
        ProcessState::Running => Some(Verdict::judge_failure(
            Culprit::Unknown,
            "solution still running at finalization",
        )),
        ProcessState::Killed(KillReason::Teardown) => None,
    }
}

fn time_limit_name(kind: TimeLimitKind) -> &'static str {
    match kind {
        TimeLimitKind::CpuTime => "CPU time",
        TimeLimitKind::WallTime => "wall time",
    }
}

/// Folds pipe failures into a verdict
///
/// A failure before any byte moved is a setup defect. Otherwise it counts as
/// an abnormal termination of the process owning that end, which only
/// overrides outcomes ranked below a runtime error.
pub fn apply_stream_faults(
    verdict: Verdict,
    failures: &[StreamFailure],
    bytes_exchanged: u64,
) -> Verdict {
    let Some(failure) = failures.first() else {
        return verdict;
    };

    if bytes_exchanged == 0 {
        if verdict.outcome == Outcome::JudgeFailure {
            return verdict;
        }
        return Verdict::judge_failure(
            Culprit::Unknown,
            format!("stream failed before any byte was exchanged: {}", failure.detail),
        );
    }

    if verdict.outcome.precedence() <= Outcome::RuntimeError.precedence() {
        return verdict;
    }
    match failure.owner {
        Culprit::Solution => Verdict::new(
            Outcome::RuntimeError,
            Culprit::Solution,
            format!("stream failure: {}", failure.detail),
        ),
        owner => Verdict::judge_failure(owner, format!("stream failure: {}", failure.detail)),
    }
}
