//! Claude CLI client. A thin wrapper over [`SubprocessAgentClient`] that
//! only knows how to invoke the `claude` binary; the wire protocol itself
//! is opaque to the engine.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::subprocess::SubprocessAgentClient;
use super::{AgentClient, AgentEvent};
use crate::error::Result;

pub struct ClaudeClient {
    inner: SubprocessAgentClient,
}

impl ClaudeClient {
    pub fn new(working_dir: PathBuf, model: Option<String>) -> Self {
        let mut args = vec!["--print".to_string(), "--output-format".to_string(), "stream-json".to_string()];
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model);
        }
        Self {
            inner: SubprocessAgentClient::new("claude", args, working_dir),
        }
    }
}

#[async_trait]
impl AgentClient for ClaudeClient {
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
