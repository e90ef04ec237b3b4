//! WebSocket protocol (§4.7/§6). One socket per connected client; each
//! socket joins a session's [`BroadcastBus`] subscriber set and pumps
//! server-originated JSON frames out while dispatching client-originated
//! frames to the relevant component. The Turn Controller per (session,
//! worktree) is what actually serializes concurrent `user_message`s —
//! this handler is just the transport.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agent::{self, AgentEvent};
use crate::error::EngineError;
use crate::model::{Message, MessageRole};
use crate::state::AppState;
use crate::worktree::NewWorktreeRequest;

#[derive(Deserialize)]
pub struct WsQuery {
    session: String,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.session))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (sub_id, mut outbound) = state.broadcast.subscribe(&session_id);

    if let Err(e) = send_initial_sync(&state, &session_id, &mut sender).await {
        warn!(session_id, error = %e, "failed to send initial messages_sync");
        state.broadcast.unsubscribe(&session_id, sub_id);
        return;
    }

    let mut ping_interval = tokio::time::interval(state.config.ws_ping_interval);
    ping_interval.tick().await; // first tick is immediate; skip it

    loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(envelope) => {
                        if sender.send(WsMessage::Text(envelope.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break, // dropped by the bus (backpressure or session close)
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(e) = dispatch(&state, &session_id, &text, &mut sender).await {
                            let _ = sender
                                .send(WsMessage::Text(json!({"type": "error", "message": e.to_string()}).to_string()))
                                .await;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session_id, error = %e, "ws receive error");
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if sender.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.broadcast.unsubscribe(&session_id, sub_id);
}

async fn send_initial_sync(
    state: &AppState,
    session_id: &str,
    sender: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
) -> Result<(), EngineError> {
    let session = state.sessions.get(session_id, None).await?;
    let worktrees = state.worktrees.list(session_id).await?;
    let messages = state.message_log.read(session_id, "main", Some(50), None).await?;
    let envelope = json!({
        "type": "messages_sync",
        "provider": session.active_provider,
        "worktreeId": "main",
        "messages": messages,
        "worktrees": worktrees,
    });
    sender
        .send(WsMessage::Text(envelope.to_string()))
        .await
        .map_err(|e| EngineError::Other(anyhow::anyhow!("ws send failed: {e}")))?;
    Ok(())
}

/// Client-to-server frame, keyed by `type` per §4.7.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    UserMessage { worktree_id: Option<String>, text: String, id: Option<String> },
    WorktreeMessage { worktree_id: String, text: String, id: Option<String> },
    SwitchProvider { worktree_id: Option<String>, provider: String },
    CreateWorktree {
        provider: String,
        name: Option<String>,
        parent_worktree_id: Option<String>,
        starting_branch: Option<String>,
        model: Option<String>,
        reasoning_effort: Option<String>,
    },
    CloseWorktree { worktree_id: String },
    MergeWorktree { worktree_id: String, target: Option<String> },
    ListWorktrees,
    SyncMessages { worktree_id: String, before_message_id: Option<String> },
    Ping,
    Interrupt { worktree_id: Option<String> },
}

async fn dispatch(
    state: &Arc<AppState>,
    session_id: &str,
    text: &str,
    sender: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
) -> Result<(), EngineError> {
    let frame: ClientFrame = serde_json::from_str(text)
        .map_err(|e| EngineError::Validation(format!("malformed frame: {e}")))?;

    match frame {
        ClientFrame::Ping => {
            let _ = sender.send(WsMessage::Text(json!({"type": "pong"}).to_string())).await;
        }
        ClientFrame::UserMessage { worktree_id, text, id } => {
            let worktree_id = worktree_id.unwrap_or_else(|| "main".to_string());
            accept_user_turn(state, session_id, &worktree_id, text, id, sender).await?;
        }
        ClientFrame::WorktreeMessage { worktree_id, text, id } => {
            accept_user_turn(state, session_id, &worktree_id, text, id, sender).await?;
        }
        ClientFrame::Interrupt { worktree_id } => {
            let worktree_id = worktree_id.unwrap_or_else(|| "main".to_string());
            let turn = state.turn_controller(session_id, &worktree_id).await;
            turn.lock().await.accept_interrupt()?;
            if let Some(client) = state.agent_client(session_id, &worktree_id).await {
                // Best-effort: the agent client itself owns how an
                // interrupt is expressed over its own wire protocol.
                let _ = client.lock().await.send("\u{3}").await;
            }
        }
        ClientFrame::SwitchProvider { worktree_id, provider } => {
            let worktree_id = worktree_id.unwrap_or_else(|| "main".to_string());
            switch_provider(state, session_id, &worktree_id, &provider).await?;
        }
        ClientFrame::CreateWorktree {
            provider,
            name,
            parent_worktree_id,
            starting_branch,
            model,
            reasoning_effort,
        } => {
            create_worktree(state, session_id, NewWorktreeRequest {
                provider,
                name,
                parent_worktree_id,
                starting_branch,
                model,
                reasoning_effort,
            }).await?;
        }
        ClientFrame::CloseWorktree { worktree_id } => {
            close_worktree(state, session_id, &worktree_id).await?;
        }
        ClientFrame::MergeWorktree { worktree_id, target } => {
            merge_worktree(state, session_id, &worktree_id, target).await?;
        }
        ClientFrame::ListWorktrees => {
            let worktrees = state.worktrees.list(session_id).await?;
            state.broadcast.broadcast(session_id, json!({"type": "worktrees_list", "worktrees": worktrees}));
        }
        ClientFrame::SyncMessages { worktree_id, before_message_id } => {
            // Reconnection catch-up: replies only to the requesting
            // socket, per §4.7, not the whole subscriber set.
            let messages = state
                .message_log
                .read(session_id, &worktree_id, Some(50), before_message_id.as_deref())
                .await?;
            let envelope = json!({
                "type": "messages_sync",
                "worktreeId": worktree_id,
                "messages": messages,
            });
            let _ = sender.send(WsMessage::Text(envelope.to_string())).await;
        }
    }
    Ok(())
}

async fn accept_user_turn(
    state: &Arc<AppState>,
    session_id: &str,
    worktree_id: &str,
    text: String,
    id: Option<String>,
    sender: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
) -> Result<(), EngineError> {
    let turn = state.turn_controller(session_id, worktree_id).await;
    {
        let mut guard = turn.lock().await;
        if let Err(e) = guard.accept_user_message() {
            // `busy` goes only to the socket that tried to start a
            // second concurrent turn, per §4.5.
            let envelope = json!({
                "type": "error", "worktreeId": worktree_id, "message": e.to_string(),
            });
            let _ = sender.send(WsMessage::Text(envelope.to_string())).await;
            return Ok(());
        }
    }

    let worktree = state.worktrees.get(session_id, worktree_id).await?;
    let user_message = Message {
        id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        seq: 0,
        role: MessageRole::User,
        text: text.clone(),
        attachments: Vec::new(),
        created_at: Utc::now(),
        group_kind: None,
        command_execution: None,
        status: None,
    };
    let persisted = state.message_log.append(session_id, worktree_id, user_message).await?;
    state.broadcast.broadcast(session_id, json!({
        "type": "worktree_message", "worktreeId": worktree_id, "message": persisted,
    }));

    let client = match state.agent_client(session_id, worktree_id).await {
        Some(client) => client,
        None => spawn_agent(state, session_id, &worktree).await?,
    };

    let send_result = client.lock().await.send(&text).await;
    if let Err(e) = send_result {
        turn.lock().await.error();
        return Err(EngineError::AgentFailure(e.to_string()));
    }
    turn.lock().await.mark_streaming();
    state.broadcast.broadcast(session_id, json!({"type": "turn_started", "worktreeId": worktree_id}));
    state.worktrees.touch(session_id, worktree_id).await?;
    Ok(())
}

async fn spawn_agent(
    state: &Arc<AppState>,
    session_id: &str,
    worktree: &crate::model::Worktree,
) -> Result<Arc<tokio::sync::Mutex<Box<dyn agent::AgentClient>>>, EngineError> {
    let provider: agent::Provider = worktree.provider.parse()?;
    let mut client = agent::build_client(provider, worktree.path.clone(), worktree.model.clone());
    client.start().await?;
    let events = client.take_events().ok_or_else(|| {
        EngineError::AgentFailure("agent client did not expose an event stream".into())
    })?;
    let handle = state.set_agent_client(session_id, &worktree.worktree_id, client).await;
    pump_agent_events(state.clone(), session_id.to_string(), worktree.worktree_id.clone(), events);
    Ok(handle)
}

fn pump_agent_events(
    state: Arc<AppState>,
    session_id: String,
    worktree_id: String,
    mut events: tokio::sync::mpsc::Receiver<AgentEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Err(e) = handle_agent_event(&state, &session_id, &worktree_id, event).await {
                warn!(session_id, worktree_id, error = %e, "failed to handle agent event");
            }
        }
        // The event stream ended without an explicit turn_error — the
        // subprocess exited. Surface it and drop the terminal state.
        let turn = state.turn_controller(&session_id, &worktree_id).await;
        if !turn.lock().await.is_idle() {
            turn.lock().await.error();
            state.broadcast.broadcast(&session_id, json!({
                "type": "turn_error", "worktreeId": worktree_id, "message": "agent process exited",
            }));
        }
        let _ = state.worktrees.set_status(&session_id, &worktree_id, crate::model::WorktreeStatus::Error).await;
        state.drop_agent_client(&session_id, &worktree_id).await;
    });
}

async fn handle_agent_event(
    state: &Arc<AppState>,
    session_id: &str,
    worktree_id: &str,
    event: AgentEvent,
) -> Result<(), EngineError> {
    let turn = state.turn_controller(session_id, worktree_id).await;
    match event {
        AgentEvent::Ready => {
            state.broadcast.broadcast(session_id, json!({"type": "ready", "worktreeId": worktree_id}));
        }
        AgentEvent::Status { text } => {
            state.broadcast.broadcast(session_id, json!({"type": "status", "worktreeId": worktree_id, "text": text}));
        }
        AgentEvent::AssistantDelta { text } => {
            state.broadcast.broadcast(session_id, json!({
                "type": "assistant_delta", "worktreeId": worktree_id, "text": text,
            }));
        }
        AgentEvent::AssistantMessage { item_id, message } => {
            let persisted = state.message_log.append(session_id, worktree_id, message).await?;
            state.broadcast.broadcast(session_id, json!({
                "type": "assistant_message", "worktreeId": worktree_id, "itemId": item_id, "message": persisted,
            }));
        }
        AgentEvent::TurnStarted => {
            turn.lock().await.mark_streaming();
            state.broadcast.broadcast(session_id, json!({"type": "worktree_turn_started", "worktreeId": worktree_id}));
        }
        AgentEvent::TurnCompleted => {
            turn.lock().await.complete();
            state.broadcast.broadcast(session_id, json!({"type": "worktree_turn_completed", "worktreeId": worktree_id}));
            request_diff(state, session_id, worktree_id).await;
        }
        AgentEvent::TurnError { message } => {
            turn.lock().await.error();
            state.broadcast.broadcast(session_id, json!({
                "type": "turn_error", "worktreeId": worktree_id, "message": message,
            }));
        }
        AgentEvent::CommandExecutionDelta { text } => {
            state.broadcast.broadcast(session_id, json!({
                "type": "command_execution_delta", "worktreeId": worktree_id, "text": text,
            }));
        }
        AgentEvent::CommandExecutionCompleted { pair } => {
            state.broadcast.broadcast(session_id, json!({
                "type": "command_execution_completed", "worktreeId": worktree_id, "pair": pair,
            }));
            request_diff(state, session_id, worktree_id).await;
        }
        AgentEvent::ToolResult { message } => {
            let persisted = state.message_log.append(session_id, worktree_id, message).await?;
            state.broadcast.broadcast(session_id, json!({
                "type": "worktree_message", "worktreeId": worktree_id, "message": persisted,
            }));
        }
        AgentEvent::ProviderSwitched { messages } => {
            // Replaces the in-memory view only; the persisted log is left
            // untouched (Open Question resolution, see DESIGN.md).
            state.broadcast.broadcast(session_id, json!({
                "type": "provider_switched", "worktreeId": worktree_id, "messages": messages,
            }));
        }
    }
    Ok(())
}

/// Debounced `repo_diff`/`worktree_diff` recompute after a file-mutating
/// event, per §4.8.
async fn request_diff(state: &Arc<AppState>, session_id: &str, worktree_id: &str) {
    let state = state.clone();
    let session_id_owned = session_id.to_string();
    let worktree_id_owned = worktree_id.to_string();
    state
        .diff_coalescer
        .request(&format!("{session_id}:{worktree_id}"), move || {
            let state = state.clone();
            let session_id = session_id_owned.clone();
            let worktree_id = worktree_id_owned.clone();
            Box::pin(async move {
                let Ok(session) = state.sessions.get(&session_id, None).await else { return };
                let Ok(workspace) = state.workspaces.get(&session.workspace_id).await else { return };
                let identity = state.sessions.workspace_identity(&workspace);
                let mono_user = matches!(
                    state.config.workspace.deployment_mode,
                    crate::config::DeploymentModeConfig::MonoUser
                );
                if let Ok((status, diff)) = state
                    .worktrees
                    .get_diff(&session_id, &worktree_id, &session.layout.repo_dir, identity.uid, identity.gid, mono_user)
                    .await
                {
                    state.broadcast.broadcast(&session_id, json!({
                        "type": "repo_diff", "worktreeId": worktree_id, "status": status, "diff": diff,
                    }));
                }
            })
        })
        .await;
}

async fn switch_provider(
    state: &Arc<AppState>,
    session_id: &str,
    worktree_id: &str,
    provider: &str,
) -> Result<(), EngineError> {
    let _provider: agent::Provider = provider.parse()?;
    if let Some(client) = state.agent_client(session_id, worktree_id).await {
        let _ = client.lock().await.stop().await;
    }
    state.drop_agent_client(session_id, worktree_id).await;

    let mut worktree = state.worktrees.get(session_id, worktree_id).await?;
    worktree.provider = provider.to_string();
    state.worktrees.touch(session_id, worktree_id).await?;

    let messages = state.message_log.read(session_id, worktree_id, None, None).await?;
    state.broadcast.broadcast(session_id, json!({
        "type": "provider_switched", "worktreeId": worktree_id, "messages": messages,
    }));
    Ok(())
}

async fn create_worktree(
    state: &Arc<AppState>,
    session_id: &str,
    request: NewWorktreeRequest,
) -> Result<(), EngineError> {
    let session = state.sessions.get(session_id, None).await?;
    let workspace = state.workspaces.get(&session.workspace_id).await?;
    let identity = state.sessions.workspace_identity(&workspace);
    let mono_user = matches!(
        state.config.workspace.deployment_mode,
        crate::config::DeploymentModeConfig::MonoUser
    );
    let worktree = state
        .worktrees
        .create(
            session_id,
            &session.layout.repo_dir,
            &session.layout.dir.join("worktrees"),
            identity.uid,
            identity.gid,
            mono_user,
            request,
            &session.layout.repo_dir,
        )
        .await?;
    info!(session_id, worktree_id = %worktree.worktree_id, "created worktree via ws");
    state.broadcast.broadcast(session_id, json!({"type": "worktree_created", "worktree": worktree}));
    Ok(())
}

async fn close_worktree(state: &Arc<AppState>, session_id: &str, worktree_id: &str) -> Result<(), EngineError> {
    let session = state.sessions.get(session_id, None).await?;
    let workspace = state.workspaces.get(&session.workspace_id).await?;
    let identity = state.sessions.workspace_identity(&workspace);
    let mono_user = matches!(
        state.config.workspace.deployment_mode,
        crate::config::DeploymentModeConfig::MonoUser
    );

    if let Some(client) = state.agent_client(session_id, worktree_id).await {
        let _ = client.lock().await.stop().await;
    }
    state.drop_agent_client(session_id, worktree_id).await;

    state
        .worktrees
        .remove(session_id, worktree_id, &session.layout.repo_dir, identity.uid, identity.gid, mono_user, true)
        .await?;
    state.broadcast.broadcast(session_id, json!({"type": "worktree_closed", "worktreeId": worktree_id}));
    Ok(())
}

async fn merge_worktree(
    state: &Arc<AppState>,
    session_id: &str,
    worktree_id: &str,
    target: Option<String>,
) -> Result<(), EngineError> {
    let session = state.sessions.get(session_id, None).await?;
    let workspace = state.workspaces.get(&session.workspace_id).await?;
    let identity = state.sessions.workspace_identity(&workspace);
    let mono_user = matches!(
        state.config.workspace.deployment_mode,
        crate::config::DeploymentModeConfig::MonoUser
    );
    let target = target.unwrap_or_else(|| "main".to_string());
    let result = state
        .worktrees
        .merge(session_id, worktree_id, &target, &session.layout.repo_dir, identity.uid, identity.gid, mono_user)
        .await?;
    state.broadcast.broadcast(session_id, json!({
        "type": "worktree_merge_result", "worktreeId": worktree_id, "result": result,
    }));
    request_diff(state, session_id, &target).await;
    Ok(())
}
