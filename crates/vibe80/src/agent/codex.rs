//! Codex app-server client. A thin wrapper over [`SubprocessAgentClient`]
//! that only knows how to invoke the `codex` binary and pick its model
//! flag; the wire protocol itself is opaque to the engine.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::subprocess::SubprocessAgentClient;
use super::{AgentClient, AgentEvent};
use crate::error::Result;

pub struct CodexClient {
    inner: SubprocessAgentClient,
}

impl CodexClient {
    pub fn new(working_dir: PathBuf, model: Option<String>) -> Self {
        let mut args = vec!["app-server".to_string()];
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model);
        }
        Self {
            inner: SubprocessAgentClient::new("codex", args, working_dir),
        }
    }
}

#[async_trait]
impl AgentClient for CodexClient {
    async fn start(&mut self) -> Result<()> {
        self.inner.start().await
    }

    async fn stop(&mut self) -> Result<()> {
        self.inner.stop().await
    }

    async fn send(&mut self, user_message: &str) -> Result<()> {
        self.inner.send(user_message).await
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.inner.take_events()
    }
}
