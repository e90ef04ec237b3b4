//! Agent Supervisor: for each worktree, owns an opaque agent subprocess
//! client and translates its stream into normalized events (§4.4). The
//! core never parses provider-specific wire protocols — each client is
//! built by a factory keyed by `provider` and exposes only
//! `start`/`stop`/`send`/`events`.

pub mod claude;
pub mod codex;
mod subprocess;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::model::{CommandExecutionPair, Message};

/// Normalized event kinds emitted by any agent client, per the §4.4 table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Ready,
    Status { text: String },
    AssistantDelta { text: String },
    AssistantMessage { item_id: String, message: Message },
    TurnStarted,
    TurnCompleted,
    TurnError { message: String },
    CommandExecutionDelta { text: String },
    CommandExecutionCompleted { pair: CommandExecutionPair },
    ToolResult { message: Message },
    /// Agent switched provider mid-session and handed back a full
    /// replacement message list; the engine replaces its in-memory view
    /// without touching the persisted log (Open Question resolution,
    /// see DESIGN.md).
    ProviderSwitched { messages: Vec<Message> },
}

/// Opaque supervisor of an external agent subprocess. The engine treats
/// every provider identically through this trait; provider-specific
/// wire framing lives entirely behind it.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Completes once the subprocess is ready to accept a turn.
    async fn start(&mut self) -> Result<()>;

    /// Graceful shutdown, falling back to killing the process group.
    async fn stop(&mut self) -> Result<()>;

    /// Submit a user turn. The client owns its own transport and framing.
    async fn send(&mut self, user_message: &str) -> Result<()>;

    /// Take the receiving half of this client's normalized event stream.
    /// Callable once; subsequent calls return `None`.
    fn take_events(&mut self) -> Option<mpsc::Receiver<AgentEvent>>;
}

/// Identifies which concrete client the factory below should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Codex,
    Claude,
}

impl std::str::FromStr for Provider {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "codex" => Ok(Provider::Codex),
            "claude" => Ok(Provider::Claude),
            other => Err(crate::error::EngineError::Validation(format!(
                "unknown provider: {other}"
            ))),
        }
    }
}

/// Build the client for `provider`, rooted at `working_dir` (the
/// worktree's path).
pub fn build_client(
    provider: Provider,
    working_dir: std::path::PathBuf,
    model: Option<String>,
) -> Box<dyn AgentClient> {
    match provider {
        Provider::Codex => Box::new(codex::CodexClient::new(working_dir, model)),
        Provider::Claude => Box::new(claude::ClaudeClient::new(working_dir, model)),
    }
}
