//! The privilege boundary: every filesystem and process action that touches
//! workspace-owned state funnels through here so it runs as the workspace's
//! POSIX uid/gid, never as the server's own user.
//!
//! In `mono_user` deployments there is only ever one identity (the server's
//! own uid), so the demotion collapses to a no-op; the call surface stays
//! identical either way so callers never special-case the deployment mode.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::process::run_to_completion;

/// The POSIX identity a workspace's filesystem/process actions run as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceIdentity {
    pub workspace_id: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl WorkspaceIdentity {
    fn env(&self) -> Vec<(String, String)> {
        vec![
            ("HOME".to_string(), self.home.display().to_string()),
            ("USER".to_string(), self.workspace_id.clone()),
            ("LOGNAME".to_string(), self.workspace_id.clone()),
        ]
    }
}

/// Deployment mode, read from `DEPLOYMENT_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    MonoUser,
    MultiUser,
}

/// Options accepted by [`Isolator::run_as`] and friends.
#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub input: Option<Vec<u8>>,
}

/// The single chokepoint for `run-as`.
///
/// Holds no per-workspace state; every call is handed the workspace's
/// [`WorkspaceIdentity`] and a root directory every touched path must be a
/// canonical subpath of.
pub struct Isolator {
    mode: DeploymentMode,
    mono_user_uid: u32,
    mono_user_gid: u32,
}

impl Isolator {
    pub fn new(mode: DeploymentMode) -> Self {
        Self {
            mode,
            mono_user_uid: nix::unistd::getuid().as_raw(),
            mono_user_gid: nix::unistd::getgid().as_raw(),
        }
    }

    fn uid_gid(&self, identity: &WorkspaceIdentity) -> (u32, u32) {
        match self.mode {
            DeploymentMode::MonoUser => (self.mono_user_uid, self.mono_user_gid),
            DeploymentMode::MultiUser => (identity.uid, identity.gid),
        }
    }

    /// Refuse any path that is not a canonical subpath of `root`.
    fn check_contained(root: &Path, path: &Path) -> Result<()> {
        let root = root
            .canonicalize()
            .map_err(|e| SessionError::IsolationRefused(format!("bad root {root:?}: {e}")))?;
        // The target may not exist yet (e.g. a file we're about to create);
        // canonicalize its existing parent instead.
        let probe = if path.exists() {
            path.to_path_buf()
        } else {
            path.parent().map(Path::to_path_buf).unwrap_or_default()
        };
        let probe = probe
            .canonicalize()
            .map_err(|e| SessionError::IsolationRefused(format!("bad path {path:?}: {e}")))?;
        if !probe.starts_with(&root) {
            return Err(SessionError::IsolationRefused(format!(
                "{path:?} escapes workspace root {root:?}"
            )));
        }
        Ok(())
    }

    /// Run `argv[0] argv[1..]` to completion as the workspace's identity.
    /// Non-zero exit is a typed error carrying stderr.
    pub async fn run_as(
        &self,
        identity: &WorkspaceIdentity,
        argv: &[String],
        opts: RunOpts,
    ) -> Result<()> {
        let (_stdout, stderr, status) = self.run_inner(identity, argv, opts).await?;
        if !status.success() {
            return Err(SessionError::CommandFailed {
                command: argv.join(" "),
                exit_code: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        Ok(())
    }

    /// As [`Isolator::run_as`] but returns captured stdout.
    pub async fn run_as_output(
        &self,
        identity: &WorkspaceIdentity,
        argv: &[String],
        opts: RunOpts,
    ) -> Result<Vec<u8>> {
        let (stdout, stderr, status) = self.run_inner(identity, argv, opts).await?;
        if !status.success() {
            return Err(SessionError::CommandFailed {
                command: argv.join(" "),
                exit_code: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        Ok(stdout)
    }

    /// Never throws on non-zero; returns `(stdout, exitCode)` verbatim.
    pub async fn run_as_output_with_status(
        &self,
        identity: &WorkspaceIdentity,
        argv: &[String],
        opts: RunOpts,
    ) -> Result<(Vec<u8>, i32)> {
        let (stdout, _stderr, status) = self.run_inner(identity, argv, opts).await?;
        Ok((stdout, status.code().unwrap_or(-1)))
    }

    async fn run_inner(
        &self,
        identity: &WorkspaceIdentity,
        argv: &[String],
        opts: RunOpts,
    ) -> Result<(Vec<u8>, Vec<u8>, std::process::ExitStatus)> {
        let (command, rest) = argv
            .split_first()
            .ok_or_else(|| SessionError::Other("empty argv passed to run_as".into()))?;

        let cwd = opts.cwd.unwrap_or_else(|| identity.home.clone());
        let mut env = identity.env();
        env.extend(opts.env);

        debug!(workspace = %identity.workspace_id, %command, "run_as");

        let out = run_to_completion(
            command,
            rest,
            &cwd,
            &env,
            Some(self.uid_gid(identity)),
            opts.input.as_deref(),
        )
        .await?;
        Ok((out.stdout, out.stderr, out.status))
    }

    /// `mkdir -p` with an explicit mode, as the workspace's identity.
    pub async fn ensure_dir(
        &self,
        identity: &WorkspaceIdentity,
        root: &Path,
        path: &Path,
        mode: u32,
    ) -> Result<()> {
        Self::check_contained(root, path)?;
        self.run_as(
            identity,
            &[
                "sh".into(),
                "-c".into(),
                format!(
                    "umask 0; mkdir -p '{}' && chmod {:o} '{}'",
                    path.display(),
                    mode,
                    path.display()
                ),
            ],
            RunOpts::default(),
        )
        .await
    }

    pub async fn write_file(
        &self,
        identity: &WorkspaceIdentity,
        root: &Path,
        path: &Path,
        content: &[u8],
        mode: u32,
    ) -> Result<()> {
        Self::check_contained(root, path)?;
        self.run_as(
            identity,
            &[
                "sh".into(),
                "-c".into(),
                format!("cat > '{}' && chmod {:o} '{}'", path.display(), mode, path.display()),
            ],
            RunOpts {
                input: Some(content.to_vec()),
                ..Default::default()
            },
        )
        .await
    }

    /// Write without touching the file's existing mode bits.
    pub async fn write_file_preserve_mode(
        &self,
        identity: &WorkspaceIdentity,
        root: &Path,
        path: &Path,
        content: &[u8],
    ) -> Result<()> {
        Self::check_contained(root, path)?;
        self.run_as(
            identity,
            &["sh".into(), "-c".into(), format!("cat > '{}'", path.display())],
            RunOpts {
                input: Some(content.to_vec()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn append_file(
        &self,
        identity: &WorkspaceIdentity,
        root: &Path,
        path: &Path,
        content: &[u8],
    ) -> Result<()> {
        Self::check_contained(root, path)?;
        self.run_as(
            identity,
            &["sh".into(), "-c".into(), format!("cat >> '{}'", path.display())],
            RunOpts {
                input: Some(content.to_vec()),
                ..Default::default()
            },
        )
        .await
    }

    /// Truncating read: at most `max_bytes` bytes of `path`.
    pub async fn read_file_buffer(
        &self,
        identity: &WorkspaceIdentity,
        root: &Path,
        path: &Path,
        max_bytes: usize,
    ) -> Result<Vec<u8>> {
        Self::check_contained(root, path)?;
        self.run_as_output(
            identity,
            &[
                "head".into(),
                "-c".into(),
                max_bytes.to_string(),
                path.display().to_string(),
            ],
            RunOpts::default(),
        )
        .await
    }

    pub async fn stat(
        &self,
        identity: &WorkspaceIdentity,
        root: &Path,
        path: &Path,
    ) -> Result<Option<FileStat>> {
        Self::check_contained(root, path)?;
        let (out, code) = self
            .run_as_output_with_status(
                identity,
                &[
                    "stat".into(),
                    "-c".into(),
                    "%s\t%f\t%Y".into(),
                    path.display().to_string(),
                ],
                RunOpts::default(),
            )
            .await?;
        if code != 0 {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&out);
        let mut parts = text.trim().split('\t');
        let size: u64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
        let raw_mode = parts.next().unwrap_or("0");
        let is_dir = raw_mode.starts_with("4") || raw_mode.starts_with('4');
        let mtime: i64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
        Ok(Some(FileStat { size, is_dir, mtime }))
    }

    /// One-level directory listing; entries come back `name\ttype`
    /// separated by NUL so arbitrary filenames round-trip safely.
    pub async fn list_entries(
        &self,
        identity: &WorkspaceIdentity,
        root: &Path,
        path: &Path,
    ) -> Result<Vec<DirEntry>> {
        Self::check_contained(root, path)?;
        let script = format!(
            "cd '{}' && for f in .* *; do \
               [ \"$f\" = '.' ] && continue; [ \"$f\" = '..' ] && continue; \
               [ -e \"$f\" ] || continue; \
               if [ -d \"$f\" ]; then t=dir; else t=file; fi; \
               printf '%s\\t%s\\0' \"$f\" \"$t\"; \
             done",
            path.display()
        );
        let out = self
            .run_as_output(identity, &["sh".into(), "-c".into(), script], RunOpts::default())
            .await?;
        let mut entries = Vec::new();
        for record in out.split(|b| *b == 0).filter(|r| !r.is_empty()) {
            let text = String::from_utf8_lossy(record);
            if let Some((name, kind)) = text.split_once('\t') {
                entries.push(DirEntry {
                    name: name.to_string(),
                    is_dir: kind == "dir",
                });
            } else {
                warn!(record = %text, "malformed list_entries record");
            }
        }
        Ok(entries)
    }
}

#[derive(Debug, Clone)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
    pub mtime: i64,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mono_identity(home: &Path) -> WorkspaceIdentity {
        WorkspaceIdentity {
            workspace_id: "default".into(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            home: home.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = TempDir::new().unwrap();
        let identity = mono_identity(dir.path());
        let isolator = Isolator::new(DeploymentMode::MonoUser);
        let file = dir.path().join("hello.txt");

        isolator
            .write_file(&identity, dir.path(), &file, b"hello world", 0o600)
            .await
            .unwrap();

        let content = isolator
            .read_file_buffer(&identity, dir.path(), &file, 1024)
            .await
            .unwrap();
        assert_eq!(content, b"hello world");
    }

    #[tokio::test]
    async fn refuses_path_outside_root() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let identity = mono_identity(dir.path());
        let isolator = Isolator::new(DeploymentMode::MonoUser);

        let escape = other.path().join("evil.txt");
        let err = isolator
            .write_file(&identity, dir.path(), &escape, b"x", 0o600)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::IsolationRefused(_)));
    }

    #[tokio::test]
    async fn list_entries_roundtrips_names() {
        let dir = TempDir::new().unwrap();
        let identity = mono_identity(dir.path());
        let isolator = Isolator::new(DeploymentMode::MonoUser);

        isolator
            .ensure_dir(&identity, dir.path(), &dir.path().join("sub"), 0o750)
            .await
            .unwrap();
        isolator
            .write_file(&identity, dir.path(), &dir.path().join("a.txt"), b"x", 0o600)
            .await
            .unwrap();

        let entries = isolator
            .list_entries(&identity, dir.path(), dir.path())
            .await
            .unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"sub"));
        assert!(names.contains(&"a.txt"));
    }
}
