//! Engine-wide error type. One variant per error kind in the error
//! handling design: validation and authorization errors are local and
//! short-circuit at the HTTP/WS adapter; the rest bubble up from deeper
//! components and get mapped to a protocol-level error there.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("authorization failed")]
    Authorization,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("isolation failure: {0}")]
    Isolation(#[from] vibe80_session::SessionError),

    #[error("agent failure: {0}")]
    AgentFailure(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// The `error_type` field of the HTTP/WS error envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::Authorization => "UNAUTHORIZED",
            EngineError::NotFound { kind, .. } => match *kind {
                "session" => "SESSION_NOT_FOUND",
                "worktree" => "WORKTREE_NOT_FOUND",
                "workspace" => "WORKSPACE_NOT_FOUND",
                _ => "NOT_FOUND",
            },
            EngineError::Isolation(_) => "ISOLATION_FAILURE",
            EngineError::AgentFailure(_) => "AGENT_FAILURE",
            EngineError::Storage(_) => "STORAGE_FAILURE",
            EngineError::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::Authorization => 401,
            EngineError::NotFound { .. } => 404,
            EngineError::Isolation(_) | EngineError::AgentFailure(_) | EngineError::Storage(_) => 500,
            EngineError::Other(_) => 500,
        }
    }

    /// Whether this error is expected (routine validation/not-found) and
    /// should be logged below `error` level.
    pub fn is_routine(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_) | EngineError::Authorization | EngineError::NotFound { .. }
        )
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
