use crate::config::JudgeConfig;
use crate::sandbox::{
    ProcessHandle, ProgramSpec, ResourceLimiter, ResourceLimits, SharedClock, TerminalState,
    TerminationCause, reclassify_by_usage,
};
use crate::verdict::{Culprit, Verdict, VerdictResolver};

use super::bridge::spawn_capture;
use super::workspace::Workspace;
use super::{COLLECT_TIMEOUT, collect_terminal};

#[derive(Debug, Clone)]
pub struct CheckerRun {
    pub verdict: Verdict,
    pub terminal: Option<TerminalState>,
}

/// Runs `checker input tout answer` once the interaction is over
pub async fn run_checker(
    program: &ProgramSpec,
    workspace: &Workspace,
    limits: &ResourceLimits,
    config: &JudgeConfig,
    clock: SharedClock,
    resolver: &VerdictResolver,
) -> CheckerRun {
    let spawned = ProcessHandle::spawn(
        "checker",
        program,
        &workspace.judge_args(),
        limits,
        clock.clone(),
        workspace.dir(),
    );
    let mut handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("Checker could not be started: {e}");
            return CheckerRun {
                verdict: Verdict::judge_failure(Culprit::Checker, e.to_string()),
                terminal: None,
            };
        }
    };

    handle.close_stdin();
    let stdout = handle
        .take_stdout()
        .map(|stdout| spawn_capture(stdout, config.message_limit_bytes));
    let stderr = handle
        .take_stderr()
        .map(|stderr| spawn_capture(stderr, config.message_limit_bytes));
    let _limiter = ResourceLimiter::new(*limits, config.poll_interval(), clock).arm(&handle);

    let within = limits.wall_time + config.grace_period();
    let terminal = match tokio::time::timeout(within, handle.wait()).await {
        Ok(Ok(terminal)) => Some(terminal),
        Ok(Err(e)) => {
            log::error!("Checker state lost: {e}");
            None
        }
        Err(_) => {
            handle.terminate(TerminationCause::SessionDeadline);
            collect_terminal(&handle, COLLECT_TIMEOUT).await
        }
    }
    .map(|terminal| reclassify_by_usage(limits, terminal));

    // testlib checkers report on stderr, some others on stdout
    let mut message = String::new();
    if let Some(stderr) = stderr {
        message = stderr.collect(COLLECT_TIMEOUT).await.text();
    }
    if let Some(stdout) = stdout {
        let printed = stdout.collect(COLLECT_TIMEOUT).await.text();
        if message.is_empty() {
            message = printed;
        }
    }

    let verdict = resolver.resolve_checker(terminal.as_ref(), &message);
    log::info!("Checker finished: {verdict}");
    CheckerRun { verdict, terminal }
}
