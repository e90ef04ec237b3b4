//! Multi-tenant session and worktree orchestration engine for AI coding
//! agents: the Workspace Isolator's higher-level collaborators (Session
//! Manager, Worktree Manager, Turn Controller, Message Log, Broadcast
//! Bus, Diff Coalescer) plus the HTTP/WS surface that fronts them.
//!
//! `vibe80-session` owns the privilege boundary and git/process
//! primitives; everything here composes those into the orchestration
//! engine and is agnostic to which agent provider or deployment mode is
//! in play.

pub mod agent;
pub mod broadcast;
pub mod config;
pub mod diff_coalescer;
pub mod error;
pub mod http;
pub mod message_log;
pub mod model;
pub mod session;
pub mod state;
pub mod storage;
pub mod turn;
pub mod workspace;
pub mod worktree;
pub mod ws;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use state::AppState;
