//! `vibe80d`: the orchestration engine's HTTP/WS daemon. Assembles the
//! components — Storage, Isolator, Workspace/Session/Worktree managers,
//! Message Log, Broadcast Bus, Diff Coalescer — into one `AppState` and
//! serves the HTTP and WebSocket surfaces over it.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vibe80::broadcast::BroadcastBus;
use vibe80::config::EngineConfig;
use vibe80::diff_coalescer::DiffCoalescer;
use vibe80::message_log::MessageLog;
use vibe80::session::SessionManager;
use vibe80::state::AppState;
use vibe80::storage::DashMapStorage;
use vibe80::workspace::WorkspaceRegistry;
use vibe80::worktree::WorktreeManager;
use vibe80_session::isolator::Isolator;

/// Command line arguments. Everything else — storage backend, workspace
/// uid range, session TTLs — is environment-driven per `EngineConfig`,
/// the way the rest of this engine is configured.
#[derive(Parser)]
#[command(name = "vibe80d")]
#[command(about = "Multi-tenant session and worktree orchestration engine for AI coding agents")]
struct Args {
    /// Host to bind to.
    #[arg(long, env = "VIBE80_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "VIBE80_PORT", default_value = "8080")]
    port: u16,

    /// Emit debug-level logs.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).compact();
    let filter_layer = tracing_subscriber::EnvFilter::from_default_env().add_directive(log_level.into());
    tracing_subscriber::registry().with(filter_layer).with(fmt_layer).init();

    let config = Arc::new(EngineConfig::from_env()?);
    let storage = Arc::new(DashMapStorage::new());
    let isolator = Arc::new(Isolator::new(config.workspace.deployment_mode.into()));
    let workspaces = Arc::new(WorkspaceRegistry::new(storage.clone(), config.workspace.clone()));
    let worktrees = Arc::new(WorktreeManager::new(storage.clone()));
    let sessions = Arc::new(SessionManager::new(
        storage.clone(),
        isolator.clone(),
        worktrees.clone(),
        &config,
    ));
    let message_log = Arc::new(MessageLog::new(storage.clone()));
    let broadcast = Arc::new(BroadcastBus::new(config.ws_outbound_buffer));
    let diff_coalescer = Arc::new(DiffCoalescer::new(config.diff_debounce));

    let state = Arc::new(AppState {
        config: config.clone(),
        isolator,
        workspaces,
        sessions,
        worktrees,
        message_log,
        broadcast,
        diff_coalescer,
        turns: Mutex::new(std::collections::HashMap::new()),
        agents: Mutex::new(std::collections::HashMap::new()),
    });

    spawn_session_gc(state.clone());

    // `http::router` already applies its own state, so the `/ws` route
    // is built and stated separately, then merged — two fully-built
    // `Router<()>`s, not one shared partially-applied router.
    let ws_router = axum::Router::new()
        .route("/ws", axum::routing::get(vibe80::ws::upgrade))
        .with_state(state.clone());
    let app = vibe80::http::router(state).merge(ws_router);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "vibe80d listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically reclaims idle/expired sessions across every known
/// workspace, per §4.2 `runGC`: stops every reclaimed session's agent
/// subprocesses, drops its worktree records, and disconnects its WS
/// subscribers before the session record/directory itself is deleted.
/// Never fatal: a single workspace's sweep failing (e.g. a stale uid no
/// longer resolvable) just gets logged and skipped so the rest of the
/// sweep still runs.
fn spawn_session_gc(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(state.config.session_gc.gc_interval);
        loop {
            tick.tick().await;
            let ids = match state.workspaces.list_ids().await {
                Ok(ids) => ids,
                Err(e) => {
                    error!(error = %e, "session GC: failed to list workspaces");
                    continue;
                }
            };
            for workspace_id in ids {
                let workspace = match state.workspaces.get(&workspace_id).await {
                    Ok(w) => w,
                    Err(e) => {
                        error!(workspace_id, error = %e, "session GC: failed to load workspace");
                        continue;
                    }
                };
                let state_for_hook = state.clone();
                let result = state
                    .sessions
                    .run_gc(
                        &workspace,
                        state.config.session_gc.idle_ttl.as_secs() as i64,
                        state.config.session_gc.max_ttl.as_secs() as i64,
                        |session_id| {
                            let state = state_for_hook.clone();
                            let session_id = session_id.to_string();
                            async move { state.teardown_session(&session_id).await }
                        },
                    )
                    .await;
                match result {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        info!(workspace_id, count = reclaimed.len(), "session GC reclaimed sessions");
                    }
                    Ok(_) => {}
                    Err(e) => error!(workspace_id, error = %e, "session GC sweep failed"),
                }
            }
        }
    });
}
