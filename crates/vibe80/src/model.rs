//! The entities described by the data model: workspaces, sessions,
//! worktrees, messages, and the transient turn/event types that flow
//! between components but are never themselves persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A provider's enabled state and auth material, keyed by provider name
/// (`codex`, `claude`) in [`Workspace::providers`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAuth {
    pub enabled: bool,
    pub auth: Option<AuthMaterial>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMaterial {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub workspace_id: String,
    pub uid: u32,
    pub gid: u32,
    pub providers: std::collections::BTreeMap<String, ProviderAuth>,
    /// Salt-less SHA-256 hex digest of the workspace secret.
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// The provider the Session Manager defaults new sessions to: prefer
    /// `codex` if enabled, otherwise the first enabled provider found.
    pub fn default_provider(&self) -> Option<&str> {
        if self
            .providers
            .get("codex")
            .is_some_and(|p| p.enabled)
        {
            return Some("codex");
        }
        self.providers
            .iter()
            .find(|(_, p)| p.enabled)
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLayout {
    pub dir: PathBuf,
    pub repo_dir: PathBuf,
    pub attachments_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub git_dir: PathBuf,
    pub ssh_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub workspace_id: String,
    pub name: String,
    pub repo_url: String,
    pub layout: SessionLayout,
    pub active_provider: String,
    pub default_internet_access: bool,
    pub default_deny_git_credentials_access: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Creating,
    Ready,
    Processing,
    Error,
    Closed,
}

/// Fixed round-robin palette the Worktree Manager assigns colors from.
pub const COLOR_PALETTE: &[&str] = &[
    "blue", "green", "purple", "orange", "teal", "pink", "yellow", "red",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub worktree_id: String,
    pub session_id: String,
    pub name: String,
    pub branch_name: String,
    pub path: PathBuf,
    pub provider: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub parent_worktree_id: Option<String>,
    pub starting_branch: Option<String>,
    pub status: WorktreeStatus,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub thread_id: Option<String>,
}

impl Worktree {
    pub const MAIN: &'static str = "main";

    pub fn is_main(&self) -> bool {
        self.worktree_id == Self::MAIN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub path: PathBuf,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageGroupKind {
    CommandExecution,
    ToolResult,
    BacklogView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandExecutionPair {
    pub command: String,
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Caller-assigned, unique within the worktree.
    pub id: String,
    /// Assigned by the Message Log on append; strictly increasing.
    #[serde(default)]
    pub seq: u64,
    pub role: MessageRole,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub group_kind: Option<MessageGroupKind>,
    pub command_execution: Option<CommandExecutionPair>,
    pub status: Option<String>,
}
