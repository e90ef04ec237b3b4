//! Session Manager: creates sessions (clone, git configuration, on-disk
//! layout), resumes/lists/touches them, and garbage-collects by idle/max
//! TTL. Every filesystem action here goes through
//! `vibe80_session::Isolator` so it runs as the workspace's uid.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use vibe80_session::isolator::{Isolator, RunOpts, WorkspaceIdentity};

use crate::config::{EngineConfig, GitIdentityConfig};
use crate::error::{EngineError, Result};
use crate::model::{Session, SessionLayout, Workspace};
use crate::storage::Storage;
use crate::worktree::WorktreeManager;

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

fn workspace_sessions_key(workspace_id: &str) -> String {
    format!("workspace-sessions:{workspace_id}")
}

const ROSTER_FIELD: &str = "__roster__";

pub struct CreateSessionRequest {
    pub workspace_id: String,
    pub repo_url: String,
    pub ssh_key: Option<String>,
    pub http_user: Option<String>,
    pub http_password: Option<String>,
    pub name: Option<String>,
    pub default_internet_access: bool,
    pub default_deny_git_credentials_access: bool,
}

pub struct SessionManager {
    storage: Arc<dyn Storage>,
    isolator: Arc<Isolator>,
    worktrees: Arc<WorktreeManager>,
    git_identity: GitIdentityConfig,
    sessions_root: PathBuf,
}

impl SessionManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        isolator: Arc<Isolator>,
        worktrees: Arc<WorktreeManager>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            storage,
            isolator,
            worktrees,
            git_identity: config.git_identity.clone(),
            sessions_root: config.workspace.root_directory.join("sessions"),
        }
    }

    fn id_pattern() -> regex::Regex {
        regex::Regex::new(r"^s[0-9a-f]{24}$").expect("static regex")
    }

    fn fresh_session_id() -> String {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        format!("s{}", &uuid[..24])
    }

    /// §4.2 `createSession`. Rolls back any partial state (directory,
    /// persisted record) if any step fails.
    pub async fn create(
        &self,
        workspace: &Workspace,
        request: CreateSessionRequest,
    ) -> Result<Session> {
        if request.repo_url.trim().is_empty() {
            return Err(EngineError::Validation("REPO_URL_REQUIRED".into()));
        }
        let provider = workspace
            .default_provider()
            .ok_or_else(|| EngineError::Validation("PROVIDER_INVALID".into()))?
            .to_string();

        // Retry on session-id collision (vanishingly unlikely with a v4
        // UUID body, kept for parity with the source behavior).
        let mut session_id = Self::fresh_session_id();
        for _ in 0..5 {
            if self.storage.get(&session_key(&session_id)).await?.is_none() {
                break;
            }
            session_id = Self::fresh_session_id();
        }

        let identity = self.workspace_identity(workspace);
        let session_dir = self.sessions_root.join(&session_id);
        let layout = SessionLayout {
            dir: session_dir.clone(),
            repo_dir: session_dir.join("repository"),
            attachments_dir: session_dir.join("attachments"),
            tmp_dir: session_dir.join("tmp"),
            git_dir: session_dir.join("git"),
            ssh_key_path: None,
        };

        if let Err(e) = self.provision(&identity, &layout, &request).await {
            warn!(session_id, error = %e, "session creation failed, rolling back");
            let _ = self.rollback(&identity, &layout, &session_id).await;
            return Err(e);
        }

        let now = Utc::now();
        let session = Session {
            session_id: session_id.clone(),
            workspace_id: workspace.workspace_id.clone(),
            name: request.name.unwrap_or_else(|| session_id.clone()),
            repo_url: request.repo_url,
            layout,
            active_provider: provider,
            default_internet_access: request.default_internet_access,
            default_deny_git_credentials_access: request.default_deny_git_credentials_access,
            created_at: now,
            last_activity_at: now,
        };

        if let Err(e) = self.persist(&session).await {
            let _ = self.rollback(&identity, &session.layout, &session_id).await;
            return Err(e);
        }

        self.init_main_worktree(&session).await?;
        info!(session_id, workspace_id = %workspace.workspace_id, "created session");
        Ok(session)
    }

    async fn provision(
        &self,
        identity: &WorkspaceIdentity,
        layout: &SessionLayout,
        request: &CreateSessionRequest,
    ) -> Result<()> {
        let root = &identity.home;
        self.isolator
            .ensure_dir(identity, root, &layout.dir, 0o2750)
            .await?;
        self.isolator
            .ensure_dir(identity, root, &layout.attachments_dir, 0o2750)
            .await?;
        self.isolator
            .ensure_dir(identity, root, &layout.tmp_dir, 0o2750)
            .await?;
        self.isolator
            .ensure_dir(identity, root, &layout.git_dir, 0o2750)
            .await?;

        if let Some(ssh_key) = &request.ssh_key {
            let key_path = layout.git_dir.join(format!("ssh-key-{}", uuid::Uuid::new_v4().simple()));
            self.isolator
                .write_file(identity, root, &key_path, ssh_key.as_bytes(), 0o600)
                .await?;
        }

        if let (Some(user), Some(password)) = (&request.http_user, &request.http_password) {
            let creds_path = layout.git_dir.join("git-credentials");
            let line = format!("https://{user}:{password}@\n");
            self.isolator
                .write_file(identity, root, &creds_path, line.as_bytes(), 0o600)
                .await?;
        }

        // `git clone` itself, plus the per-session config the invariant
        // requires, run through the isolator's demoted `runAs`.
        self.isolator
            .run_as(
                identity,
                &[
                    "git".into(),
                    "clone".into(),
                    request.repo_url.clone(),
                    layout.repo_dir.display().to_string(),
                ],
                RunOpts {
                    cwd: Some(layout.dir.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let mut settings = vec![
            ("extensions.worktreeConfig", "true".to_string()),
            ("user.name", self.git_identity.author_name.clone()),
            ("user.email", self.git_identity.author_email.clone()),
        ];
        // Pin hooks to an engine-controlled directory so a cloned repo's
        // own `.git/hooks` (e.g. a malicious `post-checkout`) never runs.
        if let Some(hooks_dir) = &self.git_identity.hooks_dir {
            settings.push(("core.hooksPath", hooks_dir.display().to_string()));
        }

        for (key, value) in settings {
            self.isolator
                .run_as(
                    identity,
                    &["git".into(), "config".into(), key.into(), value],
                    RunOpts {
                        cwd: Some(layout.repo_dir.clone()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        Ok(())
    }

    async fn init_main_worktree(&self, session: &Session) -> Result<()> {
        // The main worktree is implicit: it *is* `repository/`, stamped
        // with `vibe80.workspaceId`/`vibe80.sessionId` rather than created
        // via `git worktree add`.
        let main = crate::model::Worktree {
            worktree_id: "main".to_string(),
            session_id: session.session_id.clone(),
            name: "main".to_string(),
            branch_name: "main".to_string(),
            path: session.layout.repo_dir.clone(),
            provider: session.active_provider.clone(),
            model: None,
            reasoning_effort: None,
            parent_worktree_id: None,
            starting_branch: None,
            status: crate::model::WorktreeStatus::Ready,
            color: crate::model::COLOR_PALETTE[0].to_string(),
            created_at: session.created_at,
            last_activity_at: session.created_at,
            thread_id: None,
        };
        self.worktrees.persist_main(main).await
    }

    async fn rollback(&self, identity: &WorkspaceIdentity, layout: &SessionLayout, session_id: &str) -> Result<()> {
        self.storage.delete(&session_key(session_id)).await?;
        let _ = self
            .isolator
            .run_as(
                identity,
                &["rm".into(), "-rf".into(), layout.dir.display().to_string()],
                RunOpts::default(),
            )
            .await;
        Ok(())
    }

    pub async fn get(&self, session_id: &str, workspace_id: Option<&str>) -> Result<Session> {
        if !Self::id_pattern().is_match(session_id) {
            return Err(EngineError::not_found("session", session_id));
        }
        let value = self
            .storage
            .get(&session_key(session_id))
            .await?
            .ok_or_else(|| EngineError::not_found("session", session_id))?;
        let session = Self::deserialize(value)?;
        if let Some(workspace_id) = workspace_id {
            if session.workspace_id != workspace_id {
                // Cross-tenant access is a 404, never a 403 (no leak of existence).
                return Err(EngineError::not_found("session", session_id));
            }
        }
        Ok(session)
    }

    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let mut session = self.get(session_id, None).await?;
        session.last_activity_at = Utc::now();
        self.persist(&session).await
    }

    pub async fn list(&self, workspace_id: &str) -> Result<Vec<Session>> {
        let ids = self.roster(workspace_id).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(session) = self.get(&id, None).await {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// §4.2 `runGC`: reclaim sessions past idle or max TTL. `before_close`
    /// runs for each expired session before its directory/record is torn
    /// down — the caller's hook to stop agent subprocesses, close WS
    /// subscribers, and drop worktree records, none of which this manager
    /// knows about.
    pub async fn run_gc<F, Fut>(
        &self,
        workspace: &Workspace,
        idle_ttl_secs: i64,
        max_ttl_secs: i64,
        mut before_close: F,
    ) -> Result<Vec<String>>
    where
        F: FnMut(&str) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for session in self.list(&workspace.workspace_id).await? {
            let idle_for = (now - session.last_activity_at).num_seconds();
            let age = (now - session.created_at).num_seconds();
            let idle_expired = idle_ttl_secs > 0 && idle_for > idle_ttl_secs;
            let max_expired = max_ttl_secs > 0 && age > max_ttl_secs;
            if idle_expired || max_expired {
                before_close(&session.session_id).await;
                self.close(workspace, &session.session_id).await?;
                reclaimed.push(session.session_id);
            }
        }
        Ok(reclaimed)
    }

    pub async fn close(&self, workspace: &Workspace, session_id: &str) -> Result<()> {
        let session = self.get(session_id, None).await?;
        let identity = self.workspace_identity(workspace);
        let _ = self
            .isolator
            .run_as(
                &identity,
                &["rm".into(), "-rf".into(), session.layout.dir.display().to_string()],
                RunOpts::default(),
            )
            .await;
        self.storage.delete(&session_key(session_id)).await?;
        self.remove_from_roster(&session.workspace_id, session_id).await?;
        info!(session_id, "closed session");
        Ok(())
    }

    pub fn workspace_identity(&self, workspace: &Workspace) -> WorkspaceIdentity {
        WorkspaceIdentity {
            workspace_id: workspace.workspace_id.clone(),
            uid: workspace.uid,
            gid: workspace.gid,
            home: self.sessions_root.join(&workspace.workspace_id),
        }
    }

    async fn roster(&self, workspace_id: &str) -> Result<Vec<String>> {
        let key = workspace_sessions_key(workspace_id);
        let value = self.storage.hget(&key, ROSTER_FIELD).await?;
        Ok(match value {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        })
    }

    async fn remove_from_roster(&self, workspace_id: &str, session_id: &str) -> Result<()> {
        let mut ids = self.roster(workspace_id).await?;
        ids.retain(|id| id != session_id);
        self.save_roster(workspace_id, &ids).await
    }

    async fn save_roster(&self, workspace_id: &str, ids: &[String]) -> Result<()> {
        self.storage
            .hset(&workspace_sessions_key(workspace_id), ROSTER_FIELD, serde_json::to_value(ids).unwrap())
            .await
    }

    async fn persist(&self, session: &Session) -> Result<()> {
        let value = serde_json::to_value(session)
            .map_err(|e| EngineError::Storage(format!("serialize session: {e}")))?;
        self.storage.set(&session_key(&session.session_id), value).await?;

        let mut ids = self.roster(&session.workspace_id).await?;
        if !ids.contains(&session.session_id) {
            ids.push(session.session_id.clone());
            self.save_roster(&session.workspace_id, &ids).await?;
        }
        Ok(())
    }

    fn deserialize(value: Value) -> Result<Session> {
        serde_json::from_value(value)
            .map_err(|e| EngineError::Storage(format!("corrupt session record: {e}")))
    }
}
