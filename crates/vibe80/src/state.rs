//! Shared application state handed to every HTTP/WS handler, the way the
//! teacher's IPC server threads a single `Arc<IpcState>` through its
//! router. Owns every long-lived component the engine assembles at
//! startup plus the per-worktree runtime state (turn controllers, live
//! agent clients) that doesn't belong to any single component above.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::agent::AgentClient;
use crate::broadcast::BroadcastBus;
use crate::config::EngineConfig;
use crate::diff_coalescer::DiffCoalescer;
use crate::message_log::MessageLog;
use crate::session::SessionManager;
use crate::turn::TurnController;
use crate::worktree::WorktreeManager;
use crate::workspace::WorkspaceRegistry;
use vibe80_session::isolator::Isolator;

/// Identifies one live agent-backed worktree.
pub type WorktreeScope = (String, String);

pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub isolator: Arc<Isolator>,
    pub workspaces: Arc<WorkspaceRegistry>,
    pub sessions: Arc<SessionManager>,
    pub worktrees: Arc<WorktreeManager>,
    pub message_log: Arc<MessageLog>,
    pub broadcast: Arc<BroadcastBus>,
    pub diff_coalescer: Arc<DiffCoalescer>,
    /// One controller per (session, worktree) that has ever seen a turn.
    pub turns: Mutex<HashMap<WorktreeScope, Arc<Mutex<TurnController>>>>,
    /// The live agent subprocess client per (session, worktree), if any.
    pub agents: Mutex<HashMap<WorktreeScope, Arc<Mutex<Box<dyn AgentClient>>>>>,
}

impl AppState {
    pub async fn turn_controller(&self, session_id: &str, worktree_id: &str) -> Arc<Mutex<TurnController>> {
        let key = (session_id.to_string(), worktree_id.to_string());
        let mut turns = self.turns.lock().await;
        turns
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(TurnController::new(worktree_id))))
            .clone()
    }

    pub async fn agent_client(&self, session_id: &str, worktree_id: &str) -> Option<Arc<Mutex<Box<dyn AgentClient>>>> {
        let key = (session_id.to_string(), worktree_id.to_string());
        self.agents.lock().await.get(&key).cloned()
    }

    pub async fn set_agent_client(&self, session_id: &str, worktree_id: &str, client: Box<dyn AgentClient>) -> Arc<Mutex<Box<dyn AgentClient>>> {
        let key = (session_id.to_string(), worktree_id.to_string());
        let handle = Arc::new(Mutex::new(client));
        self.agents.lock().await.insert(key, handle.clone());
        handle
    }

    pub async fn drop_agent_client(&self, session_id: &str, worktree_id: &str) {
        let key = (session_id.to_string(), worktree_id.to_string());
        self.agents.lock().await.remove(&key);
    }

    pub async fn drop_turn_controller(&self, session_id: &str, worktree_id: &str) {
        let key = (session_id.to_string(), worktree_id.to_string());
        self.turns.lock().await.remove(&key);
    }

    /// Full teardown for a session being reclaimed by GC (or closed
    /// directly): stops every worktree's live agent subprocess, drops
    /// their turn controllers, drops the persisted worktree records, and
    /// disconnects every WS subscriber. Does not touch the session
    /// record or its on-disk directory — that's `SessionManager::close`'s
    /// job, which runs right after this per §4.2 `runGC`.
    pub async fn teardown_session(&self, session_id: &str) {
        let worktree_ids: Vec<String> = match self.worktrees.list(session_id).await {
            Ok(worktrees) => worktrees.into_iter().map(|w| w.worktree_id).collect(),
            Err(e) => {
                warn!(session_id, error = %e, "teardown: failed to list worktrees");
                Vec::new()
            }
        };

        for worktree_id in &worktree_ids {
            if let Some(client) = self.agent_client(session_id, worktree_id).await {
                let _ = client.lock().await.stop().await;
            }
            self.drop_agent_client(session_id, worktree_id).await;
            self.drop_turn_controller(session_id, worktree_id).await;
        }

        if let Err(e) = self.worktrees.clear(session_id).await {
            warn!(session_id, error = %e, "teardown: failed to clear worktree records");
        }

        self.broadcast.close_session(session_id);
    }
}
