use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{JudgeError, JudgeResult};
use crate::sandbox::{ProgramSpec, ResourceLimits};
use crate::verdict::ExitCodeConvention;

#[derive(Parser, Debug)]
#[command(name = "interjudge", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the judge configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    /// Contestant executable
    #[arg(long)]
    pub solution: PathBuf,

    /// Interactor executable, invoked as `interactor <input> <tout> <answer>`
    #[arg(long)]
    pub interactor: PathBuf,

    /// Checker run over the interactor's auxiliary output after an accepted interaction
    #[arg(long)]
    pub checker: Option<PathBuf>,

    /// Test input, readable only by the interactor
    #[arg(long)]
    pub input: PathBuf,

    /// Expected answer, readable only by the interactor and the checker
    #[arg(long)]
    pub answer: PathBuf,

    /// Write the report here instead of stdout
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Extra argument for the solution, repeatable
    #[arg(long = "solution-arg", allow_hyphen_values = true)]
    pub solution_args: Vec<String>,

    /// Extra leading argument for the interactor, repeatable
    #[arg(long = "interactor-arg", allow_hyphen_values = true)]
    pub interactor_args: Vec<String>,
}

impl CliArgs {
    /// Load the configuration from the specified file, or the defaults without one
    pub fn to_config(&self) -> anyhow::Result<JudgeConfig> {
        match &self.config_path {
            Some(path) => JudgeConfig::from_path(path),
            None => Ok(JudgeConfig::default()),
        }
    }

    pub fn solution_program(&self) -> ProgramSpec {
        ProgramSpec::new(resolve_program(&self.solution)).args(self.solution_args.iter().cloned())
    }

    pub fn interactor_program(&self) -> ProgramSpec {
        ProgramSpec::new(resolve_program(&self.interactor))
            .args(self.interactor_args.iter().cloned())
    }

    pub fn checker_program(&self) -> Option<ProgramSpec> {
        self.checker
            .as_deref()
            .map(|checker| ProgramSpec::new(resolve_program(checker)))
    }
}

/// Anchors relative paths at the current directory, since programs run inside the session directory
fn resolve_program(path: &Path) -> PathBuf {
    if path.components().count() > 1 && path.is_relative() {
        std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
    } else {
        path.to_path_buf()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl MilliSecond {
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

/// How the bytes exchanged during a session are recorded
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptMode {
    #[default]
    None,
    /// Bounded in-memory record returned with the report
    Log,
    /// Spooled to `transcript.log` in the session directory
    File,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct JudgeConfig {
    pub cpu_time_limit_ms: MilliSecond,
    pub wall_time_limit_ms: MilliSecond,
    pub memory_limit_bytes: ByteSize,
    pub idleness_timeout_ms: MilliSecond,
    pub interactor_cpu_time_limit_ms: Option<MilliSecond>,
    pub interactor_wall_time_limit_ms: Option<MilliSecond>,
    pub interactor_memory_limit_bytes: Option<ByteSize>,
    pub interactor_limit_multiplier: u32,
    pub grace_period_ms: MilliSecond,
    pub poll_interval_ms: MilliSecond,
    pub exit_codes: ExitCodeConvention,
    pub transcript: TranscriptMode,
    pub transcript_limit_bytes: usize,
    pub message_limit_bytes: usize,
    pub work_dir: Option<PathBuf>,
    pub keep_work_dir: bool,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            cpu_time_limit_ms: MilliSecond(1000),
            wall_time_limit_ms: MilliSecond(3000),
            memory_limit_bytes: ByteSize(256 * 1024 * 1024),
            idleness_timeout_ms: MilliSecond(3000),
            interactor_cpu_time_limit_ms: None,
            interactor_wall_time_limit_ms: None,
            interactor_memory_limit_bytes: None,
            interactor_limit_multiplier: 4,
            grace_period_ms: MilliSecond(500),
            poll_interval_ms: MilliSecond(10),
            exit_codes: ExitCodeConvention::default(),
            transcript: TranscriptMode::None,
            transcript_limit_bytes: 1024 * 1024,
            message_limit_bytes: 64 * 1024,
            work_dir: None,
            keep_work_dir: false,
        }
    }
}

impl JudgeConfig {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open config {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn solution_limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_time: self.cpu_time_limit_ms.as_duration(),
            wall_time: self.wall_time_limit_ms.as_duration(),
            memory_bytes: self.memory_limit_bytes.0,
        }
    }

    /// Explicit interactor limits, falling back to a multiple of the solution's
    pub fn interactor_limits(&self, solution: &ResourceLimits) -> ResourceLimits {
        let scaled = solution.scaled(self.interactor_limit_multiplier);
        ResourceLimits {
            cpu_time: self
                .interactor_cpu_time_limit_ms
                .map_or(scaled.cpu_time, |ms| ms.as_duration()),
            wall_time: self
                .interactor_wall_time_limit_ms
                .map_or(scaled.wall_time, |ms| ms.as_duration()),
            memory_bytes: self
                .interactor_memory_limit_bytes
                .map_or(scaled.memory_bytes, |bytes| bytes.0),
        }
    }

    pub fn idleness_timeout(&self) -> Duration {
        self.idleness_timeout_ms.as_duration()
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period_ms.as_duration()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_ms.as_duration()
    }

    pub fn validate(&self) -> JudgeResult<()> {
        validate_limits(&self.solution_limits())?;
        if self.interactor_limit_multiplier == 0 {
            return Err(JudgeError::InvalidSetup(
                "interactor_limit_multiplier must be at least 1".to_string(),
            ));
        }
        if self.idleness_timeout_ms.0 == 0 || self.poll_interval_ms.0 == 0 {
            return Err(JudgeError::InvalidSetup(
                "idleness_timeout_ms and poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Root under which session directories are created
    pub fn scratch_root(&self) -> JudgeResult<PathBuf> {
        use directories::ProjectDirs;

        if let Some(dir) = &self.work_dir {
            return Ok(dir.clone());
        }
        let proj_dirs = ProjectDirs::from("", "", "interjudge").ok_or_else(|| {
            JudgeError::InvalidSetup("unable to find the user cache directory".to_string())
        })?;
        Ok(proj_dirs.cache_dir().join("sessions"))
    }
}

/// Rejects limits that would make every run fail immediately
pub fn validate_limits(limits: &ResourceLimits) -> JudgeResult<()> {
    if limits.cpu_time.is_zero() || limits.wall_time.is_zero() || limits.memory_bytes == 0 {
        return Err(JudgeError::InvalidSetup(format!(
            "limits must be positive: {limits:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::DeclaredOutcome;

    #[test]
    fn test_config_deserialization() {
        let config = JudgeConfig::from_path("data/example.json".as_ref()).unwrap();
        assert_eq!(config.cpu_time_limit_ms, MilliSecond(1000));
        assert_eq!(config.memory_limit_bytes, ByteSize(268435456));
        assert_eq!(config.transcript, TranscriptMode::Log);
        assert_eq!(config.exit_codes.declared(4).unwrap(), DeclaredOutcome::PresentationError);
        // absent keys keep their defaults
        assert_eq!(config.poll_interval_ms, MilliSecond(10));
    }

    #[test]
    fn interactor_limits_scale_unless_overridden() {
        let config: JudgeConfig = serde_json::from_str(
            r#"{"cpu_time_limit_ms": 500, "interactor_wall_time_limit_ms": 10000}"#,
        )
        .unwrap();
        let solution = config.solution_limits();
        let interactor = config.interactor_limits(&solution);
        assert_eq!(interactor.cpu_time, Duration::from_millis(2000));
        assert_eq!(interactor.wall_time, Duration::from_millis(10000));
        assert_eq!(interactor.memory_bytes, 4 * 256 * 1024 * 1024);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config: JudgeConfig = serde_json::from_str(r#"{"cpu_time_limit_ms": 0}"#).unwrap();
        assert!(matches!(config.validate(), Err(JudgeError::InvalidSetup(_))));
        assert!(JudgeConfig::default().validate().is_ok());
    }

    #[test]
    fn cli_builds_programs() {
        let cli = CliArgs::parse_from([
            "interjudge",
            "--solution",
            "./sol",
            "--interactor",
            "./inter",
            "--input",
            "t.in",
            "--answer",
            "t.ans",
            "--interactor-arg",
            "--strict",
        ]);
        assert!(cli.solution_program().path.is_absolute());
        assert!(cli.solution_program().path.ends_with("sol"));
        assert_eq!(cli.interactor_program().args, vec!["--strict".to_string()]);
        assert!(cli.checker_program().is_none());
        assert_eq!(cli.to_config().unwrap(), JudgeConfig::default());
    }
}
