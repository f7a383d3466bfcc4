//! Runtime managers behind the MCPL host: session identity, delegate
//! connections, tool namespacing, hooks, push events, inference, routing,
//! conversation state, scope changes, and the connection lifecycle that
//! wires them all together. `mcpl-host` owns the transport (axum
//! WebSocket); everything here is transport-agnostic.

pub mod collaborators;
pub mod config;
pub mod delegate_handler;
pub mod delegate_manager;
pub mod error;
pub mod event_log;
pub mod event_queue;
pub mod hook_manager;
pub mod inference_broker;
pub mod inference_router;
pub mod management;
pub mod scope;
pub mod session;
pub mod state_manager;
pub mod tool_registry;
pub mod ui_event_log;

pub use collaborators::AuthResolver;
pub use collaborators::ConversationModelResolver;
pub use collaborators::InferenceChunk;
pub use collaborators::InferenceEngine;
pub use collaborators::InferenceOutcome;
pub use collaborators::RoomBroadcaster;
pub use collaborators::TriggerInferenceHandler;
pub use config::Config;
pub use config::ConfigOverrides;
pub use delegate_handler::DelegateHandler;
pub use delegate_manager::ConnectedDelegate;
pub use delegate_manager::DelegateManager;
pub use error::CoreError;
pub use error::Result;
pub use event_log::EventLog;
pub use event_log::EventLogScope;
pub use event_queue::EventQueue;
pub use event_queue::EventQueueConfig;
pub use event_queue::IncomingPushEvent;
pub use event_queue::PushEventEntry;
pub use event_queue::PushEventHandler;
pub use hook_manager::HookManager;
pub use inference_broker::InferenceBroker;
pub use inference_broker::InferenceRequestPayload;
pub use inference_router::InferenceRouter;
pub use management::ServerAdminState;
pub use scope::ScopeSubsystem;
pub use session::Session;
pub use session::SessionManager;
pub use state_manager::StateManager;
pub use state_manager::StateManagerConfig;
pub use tool_registry::ToolEntry;
pub use tool_registry::ToolExecutor;
pub use tool_registry::ToolPolicy;
pub use tool_registry::ToolRegistry;
pub use ui_event_log::ActiveBranchChanged;
pub use ui_event_log::UiEventLog;
