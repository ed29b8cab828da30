use serde::Serialize;

use super::{Culprit, Outcome, Verdict};
use crate::judge::{StreamFault, TranscriptEntry};
use crate::sandbox::TerminalState;

/// The record produced by one interaction session
#[derive(Debug, Clone, Serialize)]
pub struct JudgeReport {
    pub session_id: String,
    pub created_time: String,
    pub outcome: Outcome,
    pub culprit: Option<Culprit>,
    pub message: String,
    pub solution_exit: Option<TerminalState>,
    pub interactor_exit: Option<TerminalState>,
    pub checker_exit: Option<TerminalState>,
    pub measured_cpu_time_ms: u64,
    pub measured_memory_bytes: u64,
    pub wall_time_ms: u64,
    pub bytes_exchanged: u64,
    pub auxiliary_output: String,
    pub stream_faults: Vec<StreamFault>,
    pub transcript: Vec<TranscriptEntry>,
}

/// The part of a report a contestant may see
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContestantView {
    pub outcome: Outcome,
    pub message: String,
}

impl JudgeReport {
    pub fn new(session_id: &str, created_time: String, verdict: Verdict) -> Self {
        Self {
            session_id: session_id.to_string(),
            created_time,
            outcome: verdict.outcome,
            culprit: verdict.culprit,
            message: verdict.message,
            solution_exit: None,
            interactor_exit: None,
            checker_exit: None,
            measured_cpu_time_ms: 0,
            measured_memory_bytes: 0,
            wall_time_ms: 0,
            bytes_exchanged: 0,
            auxiliary_output: String::new(),
            stream_faults: Vec::new(),
            transcript: Vec::new(),
        }
    }

    /// Attaches the solution's terminal state and copies out its measurements
    pub fn with_solution_exit(mut self, terminal: Option<TerminalState>) -> Self {
        if let Some(terminal) = &terminal {
            self.measured_cpu_time_ms = terminal.usage.cpu_time_ms();
            self.measured_memory_bytes = terminal.usage.peak_memory_bytes;
        }
        self.solution_exit = terminal;
        self
    }

    /// Judge failures surface without the judge-side details
    pub fn contestant_view(&self) -> ContestantView {
        let message = match self.outcome {
            Outcome::JudgeFailure => "the judge failed to evaluate this submission".to_string(),
            _ => self.message.clone(),
        };
        ContestantView {
            outcome: self.outcome,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    use super::*;
    use crate::sandbox::{ProcessState, ResourceUsage};

    #[test]
    fn report_serializes_measurements() {
        let terminal = TerminalState {
            state: ProcessState::ExitedNormally(0),
            exit_code: Some(0),
            signal: None,
            usage: ResourceUsage {
                cpu_time: Duration::from_millis(120),
                peak_memory_bytes: 4096,
            },
            wall_time: Duration::from_millis(300),
            settled_at: Duration::from_millis(310),
        };
        let report = JudgeReport::new(
            "s-1",
            "2026-01-01T00:00:00.000Z".to_string(),
            Verdict::accepted("ok"),
        )
        .with_solution_exit(Some(terminal));

        let value = serde_json::to_value(&report).unwrap();
        assert_json_eq!(
            value["solution_exit"],
            json!({
                "state": {"kind": "exited_normally", "detail": 0},
                "exit_code": 0,
                "signal": null,
                "usage": {"cpu_time_ms": 120, "peak_memory_bytes": 4096},
                "wall_time_ms": 300
            })
        );
        assert_eq!(value["outcome"], "Accepted");
        assert_eq!(value["culprit"], serde_json::Value::Null);
        assert_eq!(report.measured_cpu_time_ms, 120);
    }

    #[test]
    fn contestant_view_hides_judge_failures() {
        let report = JudgeReport::new(
            "s-2",
            String::new(),
            Verdict::judge_failure(Culprit::Interactor, "interactor crashed with signal 11"),
        );
        let view = report.contestant_view();
        assert_eq!(view.outcome, Outcome::JudgeFailure);
        assert!(!view.message.contains("signal"));

        let wrong = JudgeReport::new(
            "s-3",
            String::new(),
            Verdict::new(Outcome::WrongAnswer, Culprit::Solution, "expected 7"),
        );
        assert_eq!(wrong.contestant_view().message, "expected 7");
    }
}
