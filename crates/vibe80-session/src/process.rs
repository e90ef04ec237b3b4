//! Subprocess primitives shared by the agent supervisor and the workspace
//! isolator: a long-lived handle for streaming agent processes, and a
//! one-shot runner for `runAs`-style commands that run to completion.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{Result, SessionError};

/// Handle to a long-lived managed process (an agent subprocess).
///
/// The agent client owns this handle for the lifetime of a worktree; the
/// supervisor only starts, stops, and waits on it, and never otherwise pokes
/// at the child.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
}

impl ProcessHandle {
    /// Spawn `command` with `args` in `working_dir`, piping stdin/stdout so
    /// the caller can frame a JSON-RPC-like protocol over them. Stderr is
    /// piped too so supervisors can log it on crash.
    pub fn spawn(
        command: &str,
        args: &[String],
        working_dir: &Path,
        env: &[(String, String)],
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| SessionError::Other("spawned child has no pid".into()))?;

        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take ownership of the child's stdin, for feeding it turn input.
    pub fn stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Take ownership of the child's stdout, for reading its event stream.
    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn stderr_reader(&mut self) -> Option<impl AsyncRead + Unpin> {
        self.child.stderr.take()
    }

    /// `Some(status)` once the process has exited; `None` while still running.
    pub async fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Best-effort graceful stop: SIGTERM the process group, then hard-kill
    /// if it hasn't exited within `grace`.
    pub async fn stop(&mut self, grace: std::time::Duration) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Some(id) = self.child.id() {
                let _ = kill(Pid::from_raw(id as i32), Signal::SIGTERM);
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                self.child.kill().await?;
                Ok(())
            }
        }
    }
}

/// Output of a one-shot command run to completion.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run `command` to completion as the given uid/gid (when provided), return
/// captured stdout/stderr and the exit status without interpreting it. This
/// is the primitive `runAsOutputWithStatus` builds on.
pub async fn run_to_completion(
    command: &str,
    args: &[String],
    working_dir: &Path,
    env: &[(String, String)],
    uid_gid: Option<(u32, u32)>,
    stdin_data: Option<&[u8]>,
) -> Result<CommandOutput> {
    use std::os::unix::process::CommandExt;
    use tokio::io::AsyncWriteExt;

    let mut cmd = Command::new(command);
    cmd.args(args)
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for (key, value) in env {
        cmd.env(key, value);
    }

    if let Some((uid, gid)) = uid_gid {
        cmd.uid(uid).gid(gid);
    }

    let mut child = cmd.spawn()?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await?;
        }
    } else {
        // Close stdin immediately so commands that read from it don't hang.
        drop(child.stdin.take());
    }

    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        status: output.status,
    })
}

/// Marker trait bound used by callers that need a duplex byte stream
/// (the agent client's transport) without committing to a concrete type.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}
