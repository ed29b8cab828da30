mod bridge;
mod checker;
mod session;
mod workspace;

use std::path::Path;
use std::time::Duration;

use crate::sandbox::{ProcessHandle, ResourceLimits, TerminalState};

// Re-export the session and its plumbing
pub use bridge::{
    BridgeMode, BridgeReport, Capture, CapturedOutput, FaultSide, PipeBridge, Progress,
    StreamFault, TranscriptEntry, TranscriptLog, spawn_capture,
};
pub use checker::{CheckerRun, run_checker};
pub use session::{InteractionSession, SessionPhase};
pub use workspace::Workspace;

/// Upper bound on waiting for a process or stream that was already told to stop
pub(crate) const COLLECT_TIMEOUT: Duration = Duration::from_secs(2);

/// One interactive test; the input and answer are only ever shown to the interactor
#[derive(Debug, Clone)]
pub struct TestCase {
    pub input: Vec<u8>,
    pub expected_output: Vec<u8>,
    pub limits: ResourceLimits,
}

impl TestCase {
    pub fn new(input: impl Into<Vec<u8>>, expected_output: impl Into<Vec<u8>>, limits: ResourceLimits) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            limits,
        }
    }

    pub fn from_files(input: &Path, answer: &Path, limits: ResourceLimits) -> std::io::Result<Self> {
        Ok(Self {
            input: std::fs::read(input)?,
            expected_output: std::fs::read(answer)?,
            limits,
        })
    }
}

/// Waits at most `within` for `handle` to settle
pub(crate) async fn collect_terminal(handle: &ProcessHandle, within: Duration) -> Option<TerminalState> {
    match tokio::time::timeout(within, handle.wait()).await {
        Ok(Ok(terminal)) => Some(terminal),
        Ok(Err(e)) => {
            log::error!("Lost track of {}: {e}", handle.label());
            None
        }
        Err(_) => {
            log::error!("{} (pid {}) did not settle within {within:?}", handle.label(), handle.pid());
            None
        }
    }
}
