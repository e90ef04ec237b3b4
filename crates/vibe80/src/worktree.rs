//! Worktree Manager: creates/forks/merges/removes git worktrees and owns
//! per-worktree metadata. Git mechanics are delegated to
//! `vibe80_session::git`; this module owns the `Worktree` entity's
//! lifecycle and the policy decisions spec.md §4.3 describes (branch
//! synthesis, remote-branch adoption, color assignment).

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use vibe80_session::git::{self, GitUtils, MergeOutcome as GitMergeOutcome, WorktreeManager as GitWorktreeManager};

use crate::error::{EngineError, Result};
use crate::model::{Worktree, WorktreeStatus, COLOR_PALETTE};
use crate::storage::Storage;

fn worktree_key(session_id: &str, worktree_id: &str) -> String {
    format!("worktree:{session_id}:{worktree_id}")
}

const ROSTER_FIELD: &str = "__roster__";

/// Result of a merge or cherry-pick, surfaced to WS clients as
/// `worktree_merge_result`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeResult {
    Success { head_commit: String },
    Conflict { conflicts: Vec<String> },
}

impl From<GitMergeOutcome> for MergeResult {
    fn from(outcome: GitMergeOutcome) -> Self {
        match outcome {
            GitMergeOutcome::Merged { head_commit } => MergeResult::Success { head_commit },
            GitMergeOutcome::Conflicted { conflicted_paths } => {
                MergeResult::Conflict { conflicts: conflicted_paths }
            }
        }
    }
}

pub struct NewWorktreeRequest {
    pub provider: String,
    pub name: Option<String>,
    pub parent_worktree_id: Option<String>,
    pub starting_branch: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
}

pub struct WorktreeManager {
    storage: Arc<dyn Storage>,
}

impl WorktreeManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn git_manager(&self, repo_dir: &std::path::Path, uid: u32, gid: u32, mono_user: bool) -> Result<GitWorktreeManager> {
        let manager = if mono_user {
            GitWorktreeManager::new(repo_dir.to_path_buf())
        } else {
            GitWorktreeManager::with_identity(repo_dir.to_path_buf(), uid, gid)
        };
        manager.map_err(EngineError::Isolation)
    }

    /// §4.3 `create`. `worktrees_root` is `{sessionDir}/worktrees`;
    /// `main_worktree` is the session's already-materialized main worktree,
    /// used to resolve `HEAD` when neither `parentWorktreeId` nor
    /// `startingBranch` is given.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        session_id: &str,
        repo_dir: &std::path::Path,
        worktrees_root: &std::path::Path,
        uid: u32,
        gid: u32,
        mono_user: bool,
        request: NewWorktreeRequest,
        main_worktree_path: &std::path::Path,
    ) -> Result<Worktree> {
        let worktree_id = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
        let git_mgr = self.git_manager(repo_dir, uid, gid, mono_user)?;

        let parent = match &request.parent_worktree_id {
            Some(parent_id) => Some(self.get(session_id, parent_id).await?),
            None => None,
        };

        // Resolve the starting ref per §4.3 step 2.
        let (from_ref, adopt_remote) = if let Some(parent) = &parent {
            (parent.branch_name.clone(), false)
        } else if let Some(starting_branch) = &request.starting_branch {
            let remote_ref = format!("refs/remotes/origin/{starting_branch}");
            (remote_ref, true)
        } else {
            ("HEAD".to_string(), false)
        };

        // Reuse an exactly-matching remote branch name when offered and no
        // parent worktree is in play (Open Question resolution, see
        // DESIGN.md): otherwise synthesize a collision-free name.
        let base_name = request.name.clone().unwrap_or_else(|| "agent".to_string());
        let branch_name = if parent.is_none() && request.name.is_some() {
            let candidate = request.name.clone().unwrap();
            let remote_ref = format!("refs/remotes/origin/{candidate}");
            if GitUtils::is_git_repo(repo_dir).await
                && git_mgr.remote_branch_exists(&remote_ref).await.unwrap_or(false)
            {
                candidate
            } else {
                git::synthesize_branch_name(&worktree_id, &base_name)
            }
        } else {
            git::synthesize_branch_name(&worktree_id, &base_name)
        };

        if self.branch_name_taken(session_id, &branch_name).await? {
            return Err(EngineError::Validation(format!(
                "synthesized branch name collided: {branch_name}"
            )));
        }

        let worktree_path = worktrees_root.join(&worktree_id);
        let now = Utc::now();
        let mut worktree = Worktree {
            worktree_id: worktree_id.clone(),
            session_id: session_id.to_string(),
            name: base_name,
            branch_name: branch_name.clone(),
            path: worktree_path.clone(),
            provider: request.provider,
            model: request.model,
            reasoning_effort: request.reasoning_effort,
            parent_worktree_id: request.parent_worktree_id,
            starting_branch: request.starting_branch,
            status: WorktreeStatus::Creating,
            color: self.assign_color(session_id).await?,
            created_at: now,
            last_activity_at: now,
            thread_id: None,
        };
        self.persist(&worktree).await?;

        let created = if let Some(parent) = &parent {
            git_mgr
                .fork_worktree(&worktree_path, &branch_name, &parent.branch_name)
                .await
        } else {
            git_mgr
                .create_worktree(&worktree_path, &branch_name, &from_ref, adopt_remote)
                .await
        };

        match created {
            Ok(_info) => {
                worktree.status = WorktreeStatus::Ready;
                self.persist(&worktree).await?;
                info!(worktree_id, branch_name, "worktree ready");
            }
            Err(e) => {
                worktree.status = WorktreeStatus::Error;
                self.persist(&worktree).await?;
                warn!(worktree_id, error = %e, "worktree creation failed");
                return Err(EngineError::Isolation(e));
            }
        }

        let _ = main_worktree_path; // resolved via from_ref above when applicable
        Ok(worktree)
    }

    /// Persist the session's implicit `main` worktree record, created by
    /// the Session Manager rather than through [`WorktreeManager::create`].
    pub async fn persist_main(&self, main: Worktree) -> Result<()> {
        self.persist(&main).await
    }

    pub async fn get(&self, session_id: &str, worktree_id: &str) -> Result<Worktree> {
        let value = self
            .storage
            .get(&worktree_key(session_id, worktree_id))
            .await?
            .ok_or_else(|| EngineError::not_found("worktree", worktree_id))?;
        Self::deserialize(value)
    }

    pub async fn list(&self, session_id: &str) -> Result<Vec<Worktree>> {
        let ids = self.roster(session_id).await?;
        let mut worktrees = Vec::with_capacity(ids.len());
        for id in ids {
            worktrees.push(self.get(session_id, &id).await?);
        }
        Ok(worktrees)
    }

    /// Drop every worktree record for `session_id` without touching git
    /// or the filesystem — for use when the session's whole directory
    /// is already being torn down (session close/GC), so there is no
    /// working tree left to `git worktree remove`.
    pub async fn clear(&self, session_id: &str) -> Result<()> {
        for worktree_id in self.roster(session_id).await? {
            self.storage.delete(&worktree_key(session_id, &worktree_id)).await?;
        }
        self.storage
            .delete(&format!("worktree-roster:{session_id}"))
            .await
    }

    pub async fn remove(
        &self,
        session_id: &str,
        worktree_id: &str,
        repo_dir: &std::path::Path,
        uid: u32,
        gid: u32,
        mono_user: bool,
        delete_branch: bool,
    ) -> Result<()> {
        if worktree_id == Worktree::MAIN {
            return Err(EngineError::Validation("the main worktree may not be removed".into()));
        }
        let worktree = self.get(session_id, worktree_id).await?;
        let git_mgr = self.git_manager(repo_dir, uid, gid, mono_user)?;

        git_mgr
            .remove_worktree(&worktree.path, true)
            .await
            .map_err(EngineError::Isolation)?;

        if delete_branch {
            git_mgr
                .delete_branch(&worktree.branch_name)
                .await
                .map_err(EngineError::Isolation)?;
        }

        self.storage
            .delete(&worktree_key(session_id, worktree_id))
            .await?;
        self.remove_from_roster(session_id, worktree_id).await?;
        info!(worktree_id, "removed worktree");
        Ok(())
    }

    pub async fn merge(
        &self,
        session_id: &str,
        source_id: &str,
        target_id: &str,
        repo_dir: &std::path::Path,
        uid: u32,
        gid: u32,
        mono_user: bool,
    ) -> Result<MergeResult> {
        let source = self.get(session_id, source_id).await?;
        let target = self.get(session_id, target_id).await?;
        let git_mgr = self.git_manager(repo_dir, uid, gid, mono_user)?;
        let outcome = git_mgr
            .merge(&target.path, &source.branch_name)
            .await
            .map_err(EngineError::Isolation)?;
        Ok(outcome.into())
    }

    pub async fn abort_merge(
        &self,
        session_id: &str,
        worktree_id: &str,
        repo_dir: &std::path::Path,
        uid: u32,
        gid: u32,
        mono_user: bool,
    ) -> Result<()> {
        let worktree = self.get(session_id, worktree_id).await?;
        let git_mgr = self.git_manager(repo_dir, uid, gid, mono_user)?;
        git_mgr
            .abort_merge(&worktree.path)
            .await
            .map_err(EngineError::Isolation)
    }

    pub async fn cherry_pick(
        &self,
        session_id: &str,
        commit_sha: &str,
        target_id: &str,
        repo_dir: &std::path::Path,
        uid: u32,
        gid: u32,
        mono_user: bool,
    ) -> Result<MergeResult> {
        let target = self.get(session_id, target_id).await?;
        let git_mgr = self.git_manager(repo_dir, uid, gid, mono_user)?;
        let outcome = git_mgr
            .cherry_pick(&target.path, commit_sha)
            .await
            .map_err(EngineError::Isolation)?;
        Ok(outcome.into())
    }

    pub async fn get_diff(
        &self,
        session_id: &str,
        worktree_id: &str,
        repo_dir: &std::path::Path,
        uid: u32,
        gid: u32,
        mono_user: bool,
    ) -> Result<(String, String)> {
        let worktree = self.get(session_id, worktree_id).await?;
        let git_mgr = self.git_manager(repo_dir, uid, gid, mono_user)?;
        let diff = git_mgr
            .get_diff(&worktree.path)
            .await
            .map_err(EngineError::Isolation)?;
        Ok((diff.status, diff.diff))
    }

    pub async fn set_status(&self, session_id: &str, worktree_id: &str, status: WorktreeStatus) -> Result<()> {
        let mut worktree = self.get(session_id, worktree_id).await?;
        worktree.status = status;
        worktree.last_activity_at = Utc::now();
        self.persist(&worktree).await
    }

    pub async fn touch(&self, session_id: &str, worktree_id: &str) -> Result<()> {
        let mut worktree = self.get(session_id, worktree_id).await?;
        worktree.last_activity_at = Utc::now();
        self.persist(&worktree).await
    }

    async fn assign_color(&self, session_id: &str) -> Result<String> {
        let count = self.roster(session_id).await?.len();
        Ok(COLOR_PALETTE[count % COLOR_PALETTE.len()].to_string())
    }

    async fn branch_name_taken(&self, session_id: &str, branch_name: &str) -> Result<bool> {
        for worktree in self.list(session_id).await.unwrap_or_default() {
            if worktree.branch_name == branch_name {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn roster(&self, session_id: &str) -> Result<Vec<String>> {
        let key = format!("worktree-roster:{session_id}");
        let value = self.storage.hget(&key, ROSTER_FIELD).await?;
        Ok(match value {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        })
    }

    async fn remove_from_roster(&self, session_id: &str, worktree_id: &str) -> Result<()> {
        let mut ids = self.roster(session_id).await?;
        ids.retain(|id| id != worktree_id);
        self.save_roster(session_id, &ids).await
    }

    async fn save_roster(&self, session_id: &str, ids: &[String]) -> Result<()> {
        let key = format!("worktree-roster:{session_id}");
        self.storage
            .hset(&key, ROSTER_FIELD, serde_json::to_value(ids).unwrap())
            .await
    }

    async fn persist(&self, worktree: &Worktree) -> Result<()> {
        let value = serde_json::to_value(worktree)
            .map_err(|e| EngineError::Storage(format!("serialize worktree: {e}")))?;
        self.storage
            .set(&worktree_key(&worktree.session_id, &worktree.worktree_id), value)
            .await?;

        let mut ids = self.roster(&worktree.session_id).await?;
        if !ids.contains(&worktree.worktree_id) {
            ids.push(worktree.worktree_id.clone());
            self.save_roster(&worktree.session_id, &ids).await?;
        }
        Ok(())
    }

    fn deserialize(value: Value) -> Result<Worktree> {
        serde_json::from_value(value)
            .map_err(|e| EngineError::Storage(format!("corrupt worktree record: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DashMapStorage;
    use tempfile::TempDir;
    use tokio::process::Command;

    async fn init_repo(dir: &std::path::Path) {
        vibe80_session::git::shell::ShellWorktreeManager::init_if_needed(dir)
            .await
            .unwrap();
        for args in [
            vec!["config", "user.email", "t@example.com"],
            vec!["config", "user.name", "T"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
        tokio::fs::write(dir.join("README.md"), "hi\n").await.unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir).output().await.unwrap();
        Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_assigns_ready_status_and_synthesized_branch() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path()).await;
        let worktrees_root = TempDir::new().unwrap();

        let manager = WorktreeManager::new(Arc::new(DashMapStorage::new()));
        let worktree = manager
            .create(
                "s1",
                repo.path(),
                worktrees_root.path(),
                0,
                0,
                true,
                NewWorktreeRequest {
                    provider: "codex".into(),
                    name: Some("feature-a".into()),
                    parent_worktree_id: None,
                    starting_branch: None,
                    model: None,
                    reasoning_effort: None,
                },
                repo.path(),
            )
            .await
            .unwrap();

        assert_eq!(worktree.status, WorktreeStatus::Ready);
        assert!(worktree.branch_name.starts_with("wt-"));
        assert!(worktree.branch_name.ends_with("feature-a"));
    }

    #[tokio::test]
    async fn main_worktree_cannot_be_removed() {
        let manager = WorktreeManager::new(Arc::new(DashMapStorage::new()));
        let repo = TempDir::new().unwrap();
        let err = manager
            .remove("s1", Worktree::MAIN, repo.path(), 0, 0, true, true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
