pub mod shell;

pub use shell::{
    DiffResult, MergeOutcome, ShellWorktreeInfo as WorktreeInfo, ShellWorktreeManager as WorktreeManager,
};

use regex::Regex;

/// Git utilities that don't belong to a single worktree.
pub struct GitUtils;

impl GitUtils {
    pub async fn is_git_repo(path: &std::path::Path) -> bool {
        path.join(".git").exists()
    }

    pub async fn get_current_branch(repo_path: &std::path::Path) -> anyhow::Result<String> {
        let output = tokio::process::Command::new("git")
            .args(["branch", "--show-current"])
            .current_dir(repo_path)
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(anyhow::anyhow!("failed to get current branch"))
        }
    }

    pub async fn get_head_commit(repo_path: &std::path::Path) -> anyhow::Result<String> {
        let output = tokio::process::Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(repo_path)
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(anyhow::anyhow!("failed to get HEAD commit"))
        }
    }
}

/// Synthesize the branch name a new worktree gets: `wt-{first6(id)}-{baseName}`,
/// with `baseName` slugified down to characters git and the filesystem both
/// tolerate.
pub fn synthesize_branch_name(worktree_id: &str, base_name: &str) -> String {
    let short_id: String = worktree_id.chars().take(6).collect();
    let slug = slugify(base_name);
    format!("wt-{short_id}-{slug}")
}

fn slugify(input: &str) -> String {
    let non_word = Regex::new(r"[^a-zA-Z0-9._-]+").expect("static regex");
    let slug = non_word.replace_all(input, "-").to_lowercase();
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "branch".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn is_git_repo_reflects_init_state() {
        let temp_dir = TempDir::new().unwrap();
        let repo_path = temp_dir.path();

        assert!(!GitUtils::is_git_repo(repo_path).await);
        shell::ShellWorktreeManager::init_if_needed(repo_path)
            .await
            .unwrap();
        assert!(GitUtils::is_git_repo(repo_path).await);
    }

    #[test]
    fn synthesizes_stable_branch_names() {
        let name = synthesize_branch_name("0123456789abcdef", "Fix Login Bug!!");
        assert_eq!(name, "wt-012345-fix-login-bug");
    }

    #[test]
    fn slugify_falls_back_when_empty() {
        assert_eq!(slugify("!!!"), "branch");
    }
}
