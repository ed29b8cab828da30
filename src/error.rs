use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised inside the judging core.
///
/// None of these ever leave [`crate::judge::InteractionSession::run`]: the
/// session converts every one of them into a terminal verdict.
#[derive(Error, Debug)]
pub enum JudgeError {
    /// The executable is missing or cannot be executed
    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A pipe broke mid-transfer
    #[error("stream {channel} failed: {source}")]
    Stream {
        channel: String,
        #[source]
        source: io::Error,
    },
    /// The interactor (or checker) did not report a parsable verdict
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Limits, paths or scratch files are unusable
    #[error("invalid setup: {0}")]
    InvalidSetup(String),
    /// The terminal state of a process could not be collected
    #[error("process state lost: {0}")]
    ProcessLost(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type JudgeResult<T> = Result<T, JudgeError>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn spawn_error_names_the_program_and_keeps_the_cause() {
        let error = JudgeError::Spawn {
            program: PathBuf::from("/opt/bin/interactor"),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(
            error.to_string(),
            "failed to spawn /opt/bin/interactor: no such file"
        );
        assert_eq!(error.source().unwrap().to_string(), "no such file");
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn read() -> JudgeResult<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))?;
            Ok(())
        }
        let error = read().unwrap_err();
        assert!(matches!(error, JudgeError::Io(_)));
        assert_eq!(error.to_string(), "i/o error: denied");
        assert!(error.source().is_some());
        assert!(JudgeError::InvalidSetup("x".to_string()).source().is_none());
    }
}
