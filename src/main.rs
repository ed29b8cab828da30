use anyhow::Context;
use clap::Parser;

use interjudge::config::CliArgs;
use interjudge::judge::{InteractionSession, TestCase};
use interjudge::sandbox::MonotonicClock;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config()?;
    let test = TestCase::from_files(&cli.input, &cli.answer, config.solution_limits())
        .context("Failed to read the test case")?;

    let mut session = InteractionSession::new(
        &test,
        cli.solution_program(),
        cli.interactor_program(),
        &config,
        MonotonicClock::shared(),
    );
    if let Some(checker) = cli.checker_program() {
        session = session.with_checker(checker);
    }
    let session_id = session.id().to_string();

    // a dropped session kills whatever it still runs and removes its directories
    let report = tokio::select! {
        report = session.run() => report,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Ctrl-c received, abandoning session {session_id}");
            anyhow::bail!("interrupted");
        }
    };

    let json = serde_json::to_string_pretty(&report)?;
    match &cli.output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            log::info!("Report written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
