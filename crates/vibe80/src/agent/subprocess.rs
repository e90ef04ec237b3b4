//! Shared plumbing behind the Codex and Claude clients: spawn the
//! provider binary, write turns to its stdin as line-delimited JSON, and
//! pump its stdout into normalized [`AgentEvent`]s. The exact wire shape
//! each binary speaks is provider-specific and deliberately not modeled
//! here beyond "one JSON object per line" — per spec, the core never
//! parses agent-specific JSON-RPC; this layer's job is only to turn
//! *whatever* the binary emits into the uniform event enum.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vibe80_session::ProcessHandle;

use super::{AgentClient, AgentEvent};
use crate::error::{EngineError, Result};
use crate::model::{Message, MessageRole};

pub struct SubprocessAgentClient {
    binary: String,
    args: Vec<String>,
    working_dir: PathBuf,
    handle: Option<ProcessHandle>,
    stdin: Option<ChildStdin>,
    events_tx: Option<mpsc::Sender<AgentEvent>>,
    events_rx: Option<mpsc::Receiver<AgentEvent>>,
}

impl SubprocessAgentClient {
    pub fn new(binary: impl Into<String>, args: Vec<String>, working_dir: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            binary: binary.into(),
            args,
            working_dir,
            handle: None,
            stdin: None,
            events_tx: Some(tx),
            events_rx: Some(rx),
        }
    }

    fn parse_line(line: &str) -> Option<AgentEvent> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let kind = value.get("type")?.as_str()?;
        match kind {
            "ready" => Some(AgentEvent::Ready),
            "status" => Some(AgentEvent::Status {
                text: value.get("text")?.as_str()?.to_string(),
            }),
            "assistant_delta" => Some(AgentEvent::AssistantDelta {
                text: value.get("text")?.as_str()?.to_string(),
            }),
            "assistant_message" => {
                let text = value.get("text")?.as_str()?.to_string();
                let item_id = value
                    .get("itemId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Some(AgentEvent::AssistantMessage {
                    item_id: item_id.clone(),
                    message: Message {
                        id: item_id,
                        seq: 0,
                        role: MessageRole::Assistant,
                        text,
                        attachments: vec![],
                        created_at: chrono::Utc::now(),
                        group_kind: None,
                        command_execution: None,
                        status: None,
                    },
                })
            }
            "turn_started" => Some(AgentEvent::TurnStarted),
            "turn_completed" => Some(AgentEvent::TurnCompleted),
            "turn_error" => Some(AgentEvent::TurnError {
                message: value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("agent reported an error")
                    .to_string(),
            }),
            other => {
                debug!(kind = other, "unrecognized agent event kind, dropping");
                None
            }
        }
    }
}

#[async_trait]
impl AgentClient for SubprocessAgentClient {
    async fn start(&mut self) -> Result<()> {
        let mut handle = ProcessHandle::spawn(&self.binary, &self.args, &self.working_dir, &[])
            .map_err(EngineError::Isolation)?;

        let stdout = handle
            .stdout()
            .ok_or_else(|| EngineError::AgentFailure("agent has no stdout".into()))?;
        self.stdin = handle.stdin();
        let tx = self
            .events_tx
            .clone()
            .ok_or_else(|| EngineError::AgentFailure("event sender already taken".into()))?;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = SubprocessAgentClient::parse_line(&line) {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "agent stdout read failed");
                        break;
                    }
                }
            }
        });

        self.handle = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            handle
                .stop(std::time::Duration::from_secs(5))
                .await
                .map_err(EngineError::Isolation)?;
        }
        Ok(())
    }

    async fn send(&mut self, user_message: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EngineError::AgentFailure("agent not started".into()))?;
        let frame = serde_json::json!({ "type": "user_message", "text": user_message });
        let line = format!("{}\n", frame);
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(vibe80_session::SessionError::Io)
            .map_err(EngineError::Isolation)
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.events_rx.take()
    }
}
