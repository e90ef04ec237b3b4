use thiserror::Error;

/// Errors surfaced by the low-level process/git/isolation primitives.
///
/// Mirrors the error kinds described for the isolator and git layers: a
/// failure here always carries enough context (path, command, captured
/// stderr) for the engine to decide whether to roll back or propagate.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// `runAs` refused the operation outright (unknown workspace, path escape).
    #[error("isolation refused: {0}")]
    IsolationRefused(String),

    /// A demoted subprocess exited non-zero; stderr is captured for the caller.
    #[error("command `{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("git error: {0}")]
    Git(String),

    #[error("unknown workspace uid: {0}")]
    UnknownWorkspace(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl From<&str> for SessionError {
    fn from(value: &str) -> Self {
        SessionError::Other(value.to_string())
    }
}

impl From<String> for SessionError {
    fn from(value: String) -> Self {
        SessionError::Other(value)
    }
}
