//! Shell command-based Git worktree management. We shell out to the `git`
//! binary rather than linking libgit2: worktree/merge/cherry-pick plumbing
//! is a thin wrapper over porcelain commands and the system `git` is always
//! available wherever the server runs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellWorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub head_commit: String,
    pub is_locked: bool,
    pub is_bare: bool,
}

/// Outcome of a merge attempt: either it landed cleanly, or it left the
/// worktree in a conflicted state that the caller must resolve or abort.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Merged { head_commit: String },
    Conflicted { conflicted_paths: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct DiffResult {
    pub status: String,
    pub diff: String,
}

#[derive(Debug)]
pub struct ShellWorktreeManager {
    repo_path: PathBuf,
    /// `(uid, gid)` every spawned `git` process is demoted to, when set.
    /// `None` means "run as the current process identity" (mono-user mode).
    run_as: Option<(u32, u32)>,
}

impl ShellWorktreeManager {
    pub fn new(repo_path: PathBuf) -> Result<Self> {
        Ok(Self {
            repo_path,
            run_as: None,
        })
    }

    /// Every `git` subprocess this manager spawns is demoted to `uid`/`gid`,
    /// keeping worktree mutation on the same privilege boundary as the rest
    /// of the isolator's filesystem operations.
    pub fn with_identity(repo_path: PathBuf, uid: u32, gid: u32) -> Result<Self> {
        Ok(Self {
            repo_path,
            run_as: Some((uid, gid)),
        })
    }

    pub fn is_git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<std::process::Output> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(cwd);
        if let Some((uid, gid)) = self.run_as {
            use std::os::unix::process::CommandExt;
            cmd.uid(uid).gid(gid);
        }
        cmd.output().await.map_err(SessionError::Io)
    }

    fn ok(output: &std::process::Output, what: &str) -> Result<()> {
        if !output.status.success() {
            return Err(SessionError::Git(format!(
                "{what}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    pub async fn init_if_needed(path: &Path) -> Result<()> {
        if path.join(".git").exists() {
            return Ok(());
        }
        info!(path = %path.display(), "initializing git repository");
        let output = Command::new("git")
            .args(["init"])
            .current_dir(path)
            .output()
            .await?;
        Self::ok(&output, "git init")?;
        Ok(())
    }

    /// List worktrees known to this repository.
    pub async fn list_worktrees(&self) -> Result<Vec<ShellWorktreeInfo>> {
        let output = self
            .run(&self.repo_path, &["worktree", "list", "--porcelain"])
            .await?;
        Self::ok(&output, "git worktree list")?;
        Ok(Self::parse_worktree_list(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    pub async fn prune_worktrees(&self) -> Result<()> {
        let output = self.run(&self.repo_path, &["worktree", "prune"]).await?;
        Self::ok(&output, "git worktree prune")?;
        Ok(())
    }

    /// Create a worktree rooted at `worktree_path` on `branch_name`.
    ///
    /// When `from_ref` names a remote-tracking branch and `adopt_remote` is
    /// set (only true when the worktree has no `parentWorktreeId`, i.e. it
    /// is the session's root worktree), the local branch is created to track
    /// it instead of branching from `HEAD`.
    pub async fn create_worktree(
        &self,
        worktree_path: &Path,
        branch_name: &str,
        from_ref: &str,
        adopt_remote: bool,
    ) -> Result<ShellWorktreeInfo> {
        let branch_exists = self.branch_exists(branch_name).await?;
        let path_str = worktree_path
            .to_str()
            .ok_or_else(|| SessionError::Git(format!("non-utf8 worktree path {worktree_path:?}")))?;

        let args: Vec<String> = if branch_exists {
            vec!["worktree".into(), "add".into(), path_str.into(), branch_name.into()]
        } else if adopt_remote && self.remote_branch_exists(from_ref).await? {
            vec![
                "worktree".into(),
                "add".into(),
                "-b".into(),
                branch_name.into(),
                "--track".into(),
                path_str.into(),
                from_ref.into(),
            ]
        } else {
            vec![
                "worktree".into(),
                "add".into(),
                "-b".into(),
                branch_name.into(),
                path_str.into(),
                from_ref.into(),
            ]
        };

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&self.repo_path, &arg_refs).await?;
        Self::ok(&output, "git worktree add")?;

        let head_commit = self.get_head_commit(worktree_path).await?;
        info!(branch = branch_name, path = %worktree_path.display(), "created worktree");
        Ok(ShellWorktreeInfo {
            path: worktree_path.to_path_buf(),
            branch: branch_name.to_string(),
            head_commit,
            is_locked: false,
            is_bare: false,
        })
    }

    /// Fork a worktree from an existing worktree's current `HEAD`, used when
    /// a worktree has a `parentWorktreeId` (a sub-agent branching off a
    /// parent agent's in-progress work).
    pub async fn fork_worktree(
        &self,
        worktree_path: &Path,
        branch_name: &str,
        parent_head: &str,
    ) -> Result<ShellWorktreeInfo> {
        self.create_worktree(worktree_path, branch_name, parent_head, false)
            .await
    }

    pub async fn remove_worktree(&self, worktree_path: &Path, force: bool) -> Result<()> {
        let path_str = worktree_path
            .to_str()
            .ok_or_else(|| SessionError::Git(format!("non-utf8 worktree path {worktree_path:?}")))?;
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str);
        let output = self.run(&self.repo_path, &args).await?;
        Self::ok(&output, "git worktree remove")?;
        info!(path = %worktree_path.display(), "removed worktree");
        Ok(())
    }

    /// Delete a local branch. "branch not found" is swallowed so callers
    /// can call this unconditionally during worktree teardown.
    pub async fn delete_branch(&self, branch_name: &str) -> Result<()> {
        let output = self
            .run(&self.repo_path, &["branch", "-D", branch_name])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(SessionError::Git(format!("git branch -D: {stderr}")));
        }
        Ok(())
    }

    /// Stage and commit whatever changes exist in `worktree_path`. No-op
    /// (returns `Ok(None)`) when the tree is clean.
    pub async fn commit_worktree_changes(
        &self,
        worktree_path: &Path,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<Option<String>> {
        let status = self.run(worktree_path, &["status", "--porcelain"]).await?;
        Self::ok(&status, "git status")?;
        if status.stdout.is_empty() {
            return Ok(None);
        }

        let add = self.run(worktree_path, &["add", "."]).await?;
        Self::ok(&add, "git add")?;

        let author = format!("{author_name} <{author_email}>");
        let commit = self
            .run(
                worktree_path,
                &["commit", "--author", &author, "-m", message],
            )
            .await?;
        Self::ok(&commit, "git commit")?;

        Ok(Some(self.get_head_commit(worktree_path).await?))
    }

    /// Merge `source_branch` into the branch currently checked out at
    /// `worktree_path`. On conflict the merge is left in progress (not
    /// aborted) so the caller can surface conflicted paths to the agent.
    pub async fn merge(&self, worktree_path: &Path, source_branch: &str) -> Result<MergeOutcome> {
        let output = self
            .run(worktree_path, &["merge", "--no-edit", source_branch])
            .await?;

        if output.status.success() {
            return Ok(MergeOutcome::Merged {
                head_commit: self.get_head_commit(worktree_path).await?,
            });
        }

        let conflicted_paths = self.conflicted_paths(worktree_path).await?;
        if conflicted_paths.is_empty() {
            return Err(SessionError::Git(format!(
                "merge failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        warn!(paths = ?conflicted_paths, "merge produced conflicts");
        Ok(MergeOutcome::Conflicted { conflicted_paths })
    }

    pub async fn abort_merge(&self, worktree_path: &Path) -> Result<()> {
        let output = self.run(worktree_path, &["merge", "--abort"]).await?;
        Self::ok(&output, "git merge --abort")?;
        Ok(())
    }

    pub async fn cherry_pick(&self, worktree_path: &Path, commit: &str) -> Result<MergeOutcome> {
        let output = self
            .run(worktree_path, &["cherry-pick", "--no-commit", commit])
            .await?;

        if output.status.success() {
            return Ok(MergeOutcome::Merged {
                head_commit: self.get_head_commit(worktree_path).await?,
            });
        }

        let conflicted_paths = self.conflicted_paths(worktree_path).await?;
        if conflicted_paths.is_empty() {
            return Err(SessionError::Git(format!(
                "cherry-pick failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(MergeOutcome::Conflicted { conflicted_paths })
    }

    /// `git status --porcelain` plus `git diff HEAD`, the pair the diff
    /// coalescer polls for each scope.
    pub async fn get_diff(&self, worktree_path: &Path) -> Result<DiffResult> {
        let status = self.run(worktree_path, &["status", "--porcelain"]).await?;
        Self::ok(&status, "git status")?;

        let diff = self
            .run(worktree_path, &["diff", "HEAD", "--no-color"])
            .await?;
        Self::ok(&diff, "git diff")?;

        Ok(DiffResult {
            status: String::from_utf8_lossy(&status.stdout).into_owned(),
            diff: String::from_utf8_lossy(&diff.stdout).into_owned(),
        })
    }

    /// Paths with unresolved conflict markers (`UU`, `AA`, `DD`, `AU`, `UA`,
    /// `UD`, `DU`) per `git status --porcelain` index/worktree codes.
    async fn conflicted_paths(&self, worktree_path: &Path) -> Result<Vec<String>> {
        let output = self.run(worktree_path, &["status", "--porcelain"]).await?;
        Self::ok(&output, "git status")?;
        let text = String::from_utf8_lossy(&output.stdout);
        const CONFLICT_CODES: [&str; 7] = ["UU", "AA", "DD", "AU", "UA", "UD", "DU"];
        Ok(text
            .lines()
            .filter_map(|line| {
                let (code, path) = line.split_at(2.min(line.len()));
                if CONFLICT_CODES.contains(&code) {
                    Some(path.trim().to_string())
                } else {
                    None
                }
            })
            .collect())
    }

    async fn branch_exists(&self, branch_name: &str) -> Result<bool> {
        let output = self
            .run(&self.repo_path, &["branch", "--list", branch_name])
            .await?;
        Ok(output.status.success() && !output.stdout.is_empty())
    }

    /// Whether `ref_name` (e.g. `refs/remotes/origin/main`) resolves,
    /// run as this manager's demoted identity — the only path callers
    /// outside this module should use to check remote refs.
    pub async fn remote_branch_exists(&self, ref_name: &str) -> Result<bool> {
        let output = self
            .run(&self.repo_path, &["show-ref", "--verify", "--quiet", ref_name])
            .await?;
        Ok(output.status.success())
    }

    async fn get_head_commit(&self, worktree_path: &Path) -> Result<String> {
        let output = self.run(worktree_path, &["rev-parse", "HEAD"]).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Ok("unknown".to_string())
        }
    }

    fn parse_worktree_list(output: &str) -> Vec<ShellWorktreeInfo> {
        let mut worktrees = Vec::new();
        let mut current: Option<ShellWorktreeInfo> = None;

        for line in output.lines() {
            if let Some(path_str) = line.strip_prefix("worktree ") {
                if let Some(wt) = current.take() {
                    worktrees.push(wt);
                }
                current = Some(ShellWorktreeInfo {
                    path: PathBuf::from(path_str),
                    branch: String::new(),
                    head_commit: String::new(),
                    is_locked: false,
                    is_bare: false,
                });
            } else if let Some(ref mut wt) = current {
                if let Some(commit) = line.strip_prefix("HEAD ") {
                    wt.head_commit = commit.to_string();
                } else if let Some(branch) = line
                    .strip_prefix("branch refs/heads/")
                    .or_else(|| line.strip_prefix("branch "))
                {
                    wt.branch = branch.to_string();
                } else if line == "bare" {
                    wt.is_bare = true;
                } else if line == "locked" {
                    wt.is_locked = true;
                }
            }
        }

        if let Some(wt) = current {
            worktrees.push(wt);
        }
        worktrees
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::process::Command as TokioCommand;

    async fn init_repo_with_commit(dir: &Path) {
        ShellWorktreeManager::init_if_needed(dir).await.unwrap();
        TokioCommand::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        TokioCommand::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        tokio::fs::write(dir.join("README.md"), "root\n").await.unwrap();
        TokioCommand::new("git")
            .args(["add", "."])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        TokioCommand::new("git")
            .args(["commit", "-m", "initial"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_and_remove_worktree() {
        let repo = TempDir::new().unwrap();
        init_repo_with_commit(repo.path()).await;
        let manager = ShellWorktreeManager::new(repo.path().to_path_buf()).unwrap();

        let wt_dir = TempDir::new().unwrap();
        let wt_path = wt_dir.path().join("wt1");
        let info = manager
            .create_worktree(&wt_path, "wt-abc123-feature", "HEAD", false)
            .await
            .unwrap();
        assert_eq!(info.branch, "wt-abc123-feature");
        assert!(wt_path.join("README.md").exists());

        manager.remove_worktree(&wt_path, false).await.unwrap();
        let remaining = manager.list_worktrees().await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn merge_detects_conflict() {
        let repo = TempDir::new().unwrap();
        init_repo_with_commit(repo.path()).await;
        let manager = ShellWorktreeManager::new(repo.path().to_path_buf()).unwrap();

        let wt_dir = TempDir::new().unwrap();
        let wt_path = wt_dir.path().join("wt1");
        manager
            .create_worktree(&wt_path, "wt-conflict", "HEAD", false)
            .await
            .unwrap();

        tokio::fs::write(wt_path.join("README.md"), "branch change\n")
            .await
            .unwrap();
        manager
            .commit_worktree_changes(&wt_path, "branch edit", "Test", "test@example.com")
            .await
            .unwrap();

        tokio::fs::write(repo.path().join("README.md"), "main change\n")
            .await
            .unwrap();
        manager
            .commit_worktree_changes(repo.path(), "main edit", "Test", "test@example.com")
            .await
            .unwrap();

        let outcome = manager.merge(repo.path(), "wt-conflict").await.unwrap();
        match outcome {
            MergeOutcome::Conflicted { conflicted_paths } => {
                assert_eq!(conflicted_paths, vec!["README.md".to_string()]);
                manager.abort_merge(repo.path()).await.unwrap();
            }
            MergeOutcome::Merged { .. } => panic!("expected a conflict"),
        }
    }
}
