//! Low-level process, git worktree, and privilege-drop primitives.
//!
//! Everything here is a thin, testable wrapper over the OS and the `git`
//! binary. The engine crate composes these into the Workspace Isolator,
//! Session Manager, and Worktree Manager described by the higher-level
//! design; this crate has no notion of sessions, turns, or agents.

pub mod error;
pub mod git;
pub mod isolator;
pub mod process;

pub use error::{Result, SessionError};
pub use isolator::{DeploymentMode, DirEntry, FileStat, Isolator, RunOpts, WorkspaceIdentity};
pub use process::{CommandOutput, ProcessHandle};
