//! MCPL host binary: the WebSocket control plane a fleet of delegate
//! processes connects to. Owns the transport (axum) and the collaborator
//! implementations this deployment supplies; every protocol behavior lives
//! in `mcpl-core`.

pub mod args;
pub mod collaborators;
pub mod ui;
pub mod ws;

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::extract::FromRef;
use axum::routing::get;
use mcpl_core::Config;
use mcpl_core::ConfigOverrides;
use mcpl_core::ConversationModelResolver;
use mcpl_core::DelegateHandler;
use mcpl_core::DelegateManager;
use mcpl_core::EventLog;
use mcpl_core::EventQueue;
use mcpl_core::EventQueueConfig;
use mcpl_core::HookManager;
use mcpl_core::InferenceBroker;
use mcpl_core::InferenceEngine;
use mcpl_core::InferenceRouter;
use mcpl_core::ServerAdminState;
use mcpl_core::ScopeSubsystem;
use mcpl_core::SessionManager;
use mcpl_core::StateManager;
use mcpl_core::StateManagerConfig;
use mcpl_core::ToolRegistry;
use mcpl_core::UiEventLog;
use mcpl_core::management;

use crate::args::Args;
use crate::collaborators::InferenceBridge;
use crate::collaborators::NoneModelResolver;
use crate::collaborators::PassthroughAuthResolver;
use crate::collaborators::UnconfiguredInferenceEngine;
use crate::ui::UiRoomBroadcaster;

/// The two pieces of axum state the router's routes pull from: the
/// delegate-connection orchestrator, and the UI broadcast fan-out.
#[derive(Clone)]
struct AppState {
    handler: Arc<DelegateHandler>,
    broadcaster: Arc<UiRoomBroadcaster>,
}

impl FromRef<AppState> for Arc<DelegateHandler> {
    fn from_ref(state: &AppState) -> Self {
        state.handler.clone()
    }
}

impl FromRef<AppState> for Arc<UiRoomBroadcaster> {
    fn from_ref(state: &AppState) -> Self {
        state.broadcaster.clone()
    }
}

/// Builds every manager, wires the collaborator implementations, binds the
/// listener, and serves until `SIGINT`/`SIGTERM`.
pub async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::load_with_overrides(ConfigOverrides { mcpl_home: args.home.mcpl_home.clone() })?;
    tokio::fs::create_dir_all(&config.mcpl_home).await?;

    let broadcaster = UiRoomBroadcaster::new();
    let sessions = SessionManager::new();
    let delegates = DelegateManager::new(broadcaster.clone());
    let tools = ToolRegistry::new();
    let hooks = HookManager::new(sessions.clone(), delegates.clone(), config.before_inference_timeout, config.hook_rate_limit_per_minute);

    let event_log = Arc::new(EventLog::new(config.mcpl_home.join("events")));
    let ui_event_log = UiEventLog::new(config.mcpl_home.join("ui"));

    let engine: Arc<dyn InferenceEngine> = Arc::new(UnconfiguredInferenceEngine);
    let model_resolver: Arc<dyn ConversationModelResolver> = Arc::new(NoneModelResolver);
    let bridge = InferenceBridge::new(engine.clone(), model_resolver.clone(), broadcaster.clone());

    let events = EventQueue::new(
        EventQueueConfig {
            max_pushes_per_hour: config.max_pushes_per_hour,
            idempotency_window: config.idempotency_window,
            max_queue_size: config.max_queue_size,
        },
        event_log.clone(),
        broadcaster.clone(),
        bridge.clone(),
    );

    let router = InferenceRouter::spawn(&config.mcpl_home).await;
    let inference = InferenceBroker::new(config.max_inferences_per_hour, router, delegates.clone(), engine.clone(), model_resolver.clone(), broadcaster.clone());

    let state = StateManager::new(
        StateManagerConfig {
            max_nodes: config.max_checkpoint_nodes,
            max_tombstones: config.max_tombstones,
            max_state_bytes: config.max_state_bytes,
            checkpoint_interval: config.checkpoint_interval,
        },
        event_log.clone(),
        broadcaster.clone(),
        ui_event_log,
    );
    let scope = ScopeSubsystem::new(delegates.clone(), broadcaster.clone(), event_log.clone(), config.scope_change_timeout, config.scope_elevate_default_timeout);
    let admin = ServerAdminState::new();
    management::register_builtins(&tools, delegates.clone(), scope.clone(), admin).await?;

    for user_id in discover_known_users(&config.mcpl_home.join("events").join("users")).await {
        scope.replay_user(&user_id).await;
        state.replay_user(&user_id).await;
    }

    let handler = DelegateHandler::new(
        sessions,
        delegates,
        tools,
        hooks,
        events,
        inference,
        engine,
        state,
        scope,
        Arc::new(PassthroughAuthResolver),
        bridge,
        config,
    );

    let app_state = AppState { handler, broadcaster };
    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/ui/{user_id}", get(ui::ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(addr = %args.bind, "mcpl-host listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

/// Scans the event log's per-user shard directory for ids to replay scope
/// policy and checkpoint-tree history for on startup. Returns an empty list
/// (a fresh `MCPL_HOME`) rather than erroring.
async fn discover_known_users(users_dir: &Path) -> Vec<String> {
    let mut ids = Vec::new();
    let mut entries = match tokio::fs::read_dir(users_dir).await {
        Ok(entries) => entries,
        Err(_) => return ids,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(id) = entry.path().file_stem().and_then(|s| s.to_str()) {
            ids.push(id.to_string());
        }
    }
    ids
}
