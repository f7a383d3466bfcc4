//! Delegate Handler (§4.10): the seam where one physical delegate
//! connection's raw JSON messages meet every other manager in this crate.
//!
//! This module knows nothing about the transport. `mcpl-host` owns the
//! actual WebSocket; it hands every inbound frame to
//! [`DelegateConnection::handle_message`] and every outbound frame comes
//! back out through the `mpsc::UnboundedSender` passed to
//! [`DelegateHandler::begin_connection`]. That keeps this crate's only
//! transport dependency at `mcpl-channel`, not `axum`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mcpl_channel::ReliableChannel;
use mcpl_types::CloseCode;
use mcpl_types::DelegateToHost;
use mcpl_types::HostToDelegate;
use mcpl_types::ToolCallResult;
use mcpl_types::ToolInvocation;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::collaborators::AuthResolver;
use crate::collaborators::InferenceEngine;
use crate::collaborators::TriggerInferenceHandler;
use crate::config::Config;
use crate::delegate_manager::ConnectedDelegate;
use crate::delegate_manager::DelegateManager;
use crate::error::CoreError;
use crate::event_queue::EventQueue;
use crate::event_queue::IncomingPushEvent;
use crate::hook_manager::HookManager;
use crate::inference_broker::InferenceBroker;
use crate::inference_broker::InferenceRequestPayload;
use crate::scope::ScopeSubsystem;
use crate::scope::parse_capabilities;
use crate::session::SessionManager;
use crate::session::expand_feature_sets;
use crate::state_manager::RollbackCheck;
use crate::state_manager::StateManager;
use crate::tool_registry::NAMESPACE_SEPARATOR;
use crate::tool_registry::ToolExecutor;
use crate::tool_registry::ToolRegistry;

type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Delegate ids a real server/tool namespace could never legitimately use.
const RESERVED_DELEGATE_IDS: [&str; 4] = ["server", "system", "internal", "admin"];

/// Checks a delegate-supplied id against every naming rule the rest of the
/// host depends on: short enough to be a sane tool-name prefix, free of the
/// namespace separator, and not a name the host reserves for itself.
pub fn validate_delegate_id(delegate_id: &str) -> Result<(), CoreError> {
    if delegate_id.is_empty() || delegate_id.len() > 32 {
        return Err(CoreError::InvalidDelegateId(format!(
            "delegate id must be 1-32 characters, got {}",
            delegate_id.len()
        )));
    }
    if !delegate_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(CoreError::InvalidDelegateId(
            "delegate id may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    if delegate_id.contains(NAMESPACE_SEPARATOR) {
        return Err(CoreError::InvalidDelegateId(format!(
            "delegate id must not contain '{NAMESPACE_SEPARATOR}'"
        )));
    }
    if RESERVED_DELEGATE_IDS.contains(&delegate_id.to_ascii_lowercase().as_str()) {
        return Err(CoreError::InvalidDelegateId(format!("{delegate_id} is a reserved name")));
    }
    Ok(())
}

/// What `mcpl-host` should do with the underlying socket after a message is
/// handled: `None` means keep reading, `Some` means close with this code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseConnection {
    pub code: u16,
    pub reason: String,
}

fn auth_required() -> Option<CloseConnection> {
    Some(CloseConnection {
        code: CloseCode::AUTH_OR_VALIDATION,
        reason: "message received before authentication".to_string(),
    })
}

/// Executes tool calls by forwarding them to one delegate's connection.
/// Installed once per `tool_manifest`, shared by every tool that delegate
/// advertises.
struct DelegateToolExecutor {
    delegates: Arc<DelegateManager>,
    delegate_id: String,
    timeout: Duration,
}

impl ToolExecutor for DelegateToolExecutor {
    fn execute<'a>(
        &'a self,
        user_id: &'a str,
        conversation_id: Option<&'a str>,
        original_name: &'a str,
        input: Value,
    ) -> BoxFuture<'a, ToolCallResult> {
        Box::pin(async move {
            let conversation_id = conversation_id.unwrap_or_default();
            let tool = ToolInvocation {
                id: Uuid::new_v4().to_string(),
                name: original_name.to_string(),
                input,
            };
            self.delegates
                .execute_tool_on_delegate(user_id, &self.delegate_id, conversation_id, None, tool, self.timeout, None)
                .await
        })
    }
}

/// Owns every manager a delegate connection needs and mints a
/// [`DelegateConnection`] per physical socket. One instance is shared across
/// the whole host process.
pub struct DelegateHandler {
    sessions: Arc<SessionManager>,
    delegates: Arc<DelegateManager>,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookManager>,
    events: Arc<EventQueue>,
    inference: Arc<InferenceBroker>,
    engine: Arc<dyn InferenceEngine>,
    state: Arc<StateManager>,
    scope: Arc<ScopeSubsystem>,
    auth: Arc<dyn AuthResolver>,
    trigger_inference: Arc<dyn TriggerInferenceHandler>,
    config: Config,
    /// `(userId, delegateId)` pairs that have passed `delegate_auth` but have
    /// not yet sent `mcpl/hello`. `DelegateManager::is_connected` only knows
    /// about channel-backed connections registered at hello time, so this is
    /// the only place a second concurrent auth for the same pair is visible.
    reserved: Mutex<HashSet<(String, String)>>,
}

impl DelegateHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionManager>,
        delegates: Arc<DelegateManager>,
        tools: Arc<ToolRegistry>,
        hooks: Arc<HookManager>,
        events: Arc<EventQueue>,
        inference: Arc<InferenceBroker>,
        engine: Arc<dyn InferenceEngine>,
        state: Arc<StateManager>,
        scope: Arc<ScopeSubsystem>,
        auth: Arc<dyn AuthResolver>,
        trigger_inference: Arc<dyn TriggerInferenceHandler>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            delegates,
            tools,
            hooks,
            events,
            inference,
            engine,
            state,
            scope,
            auth,
            trigger_inference,
            config,
            reserved: Mutex::new(HashSet::new()),
        })
    }

    /// Starts tracking a new physical connection. Call
    /// [`DelegateConnection::handle_message`] for every frame the transport
    /// receives and [`DelegateConnection::on_close`] once it disconnects.
    pub fn begin_connection(self: &Arc<Self>, outbound: mpsc::UnboundedSender<Value>) -> Arc<DelegateConnection> {
        Arc::new(DelegateConnection {
            handler: self.clone(),
            outbound,
            user_id: RwLock::new(None),
            delegate_id: RwLock::new(None),
            session_id: RwLock::new(None),
            channel: RwLock::new(None),
            last_conversation_id: RwLock::new(None),
        })
    }
}

/// Per-socket state: who this connection claims to be, and the Reliable
/// Channel wrapping it once `mcpl/hello` has run.
pub struct DelegateConnection {
    handler: Arc<DelegateHandler>,
    outbound: mpsc::UnboundedSender<Value>,
    user_id: RwLock<Option<String>>,
    delegate_id: RwLock<Option<String>>,
    session_id: RwLock<Option<String>>,
    channel: RwLock<Option<ReliableChannel>>,
    /// Best-effort context for messages (`mcpl/model_info_request`) that
    /// carry no `conversationId` of their own, updated opportunistically
    /// from every other inbound message that does.
    last_conversation_id: RwLock<Option<String>>,
}

impl DelegateConnection {
    /// Feeds one raw inbound transport message through the Reliable Channel
    /// (once installed) and dispatches every resulting payload. Returns
    /// `Some` if the transport should close the socket.
    pub async fn handle_message(self: &Arc<Self>, raw: Value) -> Option<CloseConnection> {
        let channel = self.channel.read().await.clone();
        let payloads = match channel {
            Some(channel) => channel.handle_incoming(raw).await,
            None => vec![raw],
        };
        for payload in payloads {
            if let Some(close) = self.dispatch(payload).await {
                return Some(close);
            }
        }
        None
    }

    async fn send_legacy(&self, message: HostToDelegate) {
        match serde_json::to_value(&message) {
            Ok(payload) => {
                let _ = self.outbound.send(payload);
            }
            Err(error) => tracing::warn!(%error, "failed to serialize outbound message"),
        }
    }

    async fn send_framed(&self, message: HostToDelegate) {
        let Some(channel) = self.channel.read().await.clone() else {
            tracing::warn!("attempted to send a framed message before the reliable channel was installed");
            return;
        };
        match serde_json::to_value(&message) {
            Ok(payload) => {
                if let Err(error) = channel.send(payload).await {
                    tracing::warn!(%error, "failed to send framed message");
                }
            }
            Err(error) => tracing::warn!(%error, "failed to serialize outbound message"),
        }
    }

    async fn dispatch(self: &Arc<Self>, payload: Value) -> Option<CloseConnection> {
        let message: DelegateToHost = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "ignoring unrecognized delegate message");
                return None;
            }
        };

        match message {
            DelegateToHost::DelegateAuth { version: _, token, delegate_id, capabilities: _ } => {
                self.handle_delegate_auth(token, delegate_id).await
            }
            DelegateToHost::Hello {
                protocol_version,
                capabilities,
                delegate_id,
                delegate_name: _,
                session_id,
                last_received_seq,
            } => {
                self.handle_hello(protocol_version, capabilities, delegate_id, session_id, last_received_seq)
                    .await
            }
            DelegateToHost::ToolManifest { delegate_id, tools } => self.handle_tool_manifest(delegate_id, tools).await,
            DelegateToHost::ToolCallResponse { request_id, tool_use_id: _, result } => {
                self.handler.delegates.complete_tool_call(&request_id, result).await;
                None
            }
            DelegateToHost::TriggerInference { trigger_id, source: _, conversation_id, participant_id, context, system_message } => {
                self.handle_trigger_inference(trigger_id, conversation_id, participant_id, context, system_message).await
            }
            DelegateToHost::Ping { timestamp } => {
                self.send_legacy(HostToDelegate::Pong { timestamp }).await;
                None
            }
            DelegateToHost::BeforeInferenceResponse { request_id, injections } => {
                self.handler.hooks.complete(&request_id, injections).await;
                None
            }
            DelegateToHost::AfterInferenceAck { request_id } => {
                tracing::debug!(request_id, "afterInference acknowledged");
                None
            }
            DelegateToHost::PushEvent { id, source, conversation_id, event_type, payload, system_message, idempotency_key, timestamp } => {
                self.handle_push_event(id, source, conversation_id, event_type, payload, system_message, idempotency_key, timestamp)
                    .await
            }
            DelegateToHost::InferenceRequest { request_id, server_id, conversation_id, system_message, user_message, max_tokens, stream } => {
                self.handle_inference_request(request_id, server_id, conversation_id, system_message, user_message, max_tokens, stream)
                    .await
            }
            DelegateToHost::ScopeChangeRequest { request_id, server_id, url, server_name, requested_capabilities, reason, conversation_id } => {
                self.handle_scope_change_request(request_id, server_id, url, server_name, requested_capabilities, reason, conversation_id)
                    .await
            }
            DelegateToHost::ScopeElevateRequest {
                request_id,
                delegate_id,
                server_id,
                conversation_id,
                feature_set,
                label,
                requested_capabilities,
                reason,
                timeout_ms,
            } => {
                self.handle_scope_elevate_request(
                    request_id,
                    delegate_id,
                    server_id,
                    conversation_id,
                    feature_set,
                    label,
                    requested_capabilities,
                    reason,
                    timeout_ms,
                )
                .await
            }
            DelegateToHost::ConnectServerResult { request_id, url: _, success, server_id, tools: _, error } => {
                let Some(user_id) = self.user_id.read().await.clone() else { return auth_required() };
                self.handler
                    .scope
                    .complete_scope_change_connect(&user_id, &request_id, server_id.as_deref(), success, error.as_deref())
                    .await;
                None
            }
            DelegateToHost::FeatureSetsChanged { feature_sets } => self.handle_feature_sets_changed(feature_sets).await,
            DelegateToHost::StateSet { request_id: _, conversation_id, state } => {
                let Some(user_id) = self.user_id.read().await.clone() else { return auth_required() };
                *self.last_conversation_id.write().await = Some(conversation_id.clone());
                self.handler.state.set_state(&user_id, &conversation_id, state).await;
                None
            }
            DelegateToHost::StatePatch { request_id, conversation_id, patch } => self.handle_state_patch(request_id, conversation_id, patch).await,
            DelegateToHost::StateRollback { request_id, conversation_id, checkpoint_id } => {
                self.handle_state_rollback(request_id, conversation_id, checkpoint_id).await
            }
            DelegateToHost::StateGet { request_id, conversation_id } => {
                let state = self.handler.state.get_state(&conversation_id).await;
                *self.last_conversation_id.write().await = Some(conversation_id);
                self.send_framed(HostToDelegate::StateResponse { request_id, state, rolled_back: None, checkpoint_id: None, error: None })
                    .await;
                None
            }
            DelegateToHost::CheckpointList { request_id, conversation_id } => self.handle_checkpoint_list(request_id, conversation_id).await,
            DelegateToHost::ModelInfoRequest { request_id } => {
                self.handle_model_info_request(request_id).await;
                None
            }
            _ => {
                tracing::warn!("ignoring delegate message of an unknown variant");
                None
            }
        }
    }

    async fn handle_delegate_auth(self: &Arc<Self>, token: Option<String>, delegate_id: String) -> Option<CloseConnection> {
        self.authenticate(token.unwrap_or_default(), delegate_id).await
    }

    /// §4.10 steps 1-2 / §6: authenticates a connection from the
    /// `token`/`apiKey` query parameters parsed off the WebSocket upgrade
    /// URL, before any message has been received on the socket. The
    /// API-key path is preferred whenever both are present. On success the
    /// connection's `user_id`/`delegate_id` are seeded directly, so the
    /// `mcpl/hello` that follows succeeds without a legacy `delegate_auth`
    /// message ever being sent.
    pub async fn authenticate_from_query(self: &Arc<Self>, token: Option<String>, api_key: Option<String>, delegate_id: String) -> Option<CloseConnection> {
        let credential = api_key.filter(|key| !key.is_empty()).or(token).unwrap_or_default();
        self.authenticate(credential, delegate_id).await
    }

    /// Shared body of §4.10 steps 1-2: validate `delegateId`, resolve the
    /// credential to a `userId`, reject a duplicate `(userId, delegateId)`
    /// connection, and (on success) seed this connection's identity. Used
    /// by both the legacy `delegate_auth` message and query-string auth at
    /// upgrade time.
    async fn authenticate(self: &Arc<Self>, credential: String, delegate_id: String) -> Option<CloseConnection> {
        if let Err(error) = validate_delegate_id(&delegate_id) {
            self.send_legacy(HostToDelegate::DelegateAuthResult { success: false, user_id: None, session_id: None, error: Some(error.to_string()) })
                .await;
            return Some(CloseConnection { code: CloseCode::AUTH_OR_VALIDATION, reason: error.to_string() });
        }

        let user_id = match self.handler.auth.resolve(&credential).await {
            Ok(user_id) => user_id,
            Err(error) => {
                self.send_legacy(HostToDelegate::DelegateAuthResult { success: false, user_id: None, session_id: None, error: Some(error.to_string()) })
                    .await;
                return Some(CloseConnection { code: CloseCode::AUTH_OR_VALIDATION, reason: error.to_string() });
            }
        };

        let key = (user_id.clone(), delegate_id.clone());
        {
            let mut reserved = self.handler.reserved.lock().await;
            if reserved.contains(&key) || self.handler.delegates.is_connected(&user_id, &delegate_id).await {
                self.send_legacy(HostToDelegate::DelegateAuthResult {
                    success: false,
                    user_id: None,
                    session_id: None,
                    error: Some("delegate already connected".to_string()),
                })
                .await;
                return Some(CloseConnection { code: CloseCode::NAME_COLLISION, reason: "duplicate delegate connection".to_string() });
            }
            reserved.insert(key);
        }

        *self.user_id.write().await = Some(user_id.clone());
        *self.delegate_id.write().await = Some(delegate_id);

        self.send_legacy(HostToDelegate::DelegateAuthResult {
            success: true,
            user_id: Some(user_id),
            session_id: Some(Uuid::new_v4().to_string()),
            error: None,
        })
        .await;
        None
    }

    async fn handle_hello(
        self: &Arc<Self>,
        protocol_version: String,
        capabilities: Vec<String>,
        delegate_id: String,
        requested_session_id: Option<String>,
        last_received_seq: Option<u64>,
    ) -> Option<CloseConnection> {
        if let Err(error) = validate_delegate_id(&delegate_id) {
            return Some(CloseConnection { code: CloseCode::AUTH_OR_VALIDATION, reason: error.to_string() });
        }
        let Some(user_id) = self.user_id.read().await.clone() else { return auth_required() };

        let requested_capabilities = parse_capabilities(&capabilities);
        let session = if let Some(id) = requested_session_id.as_deref() {
            match self.handler.sessions.resume_session(id, &user_id).await {
                Some(existing) => existing,
                None => {
                    self.handler
                        .sessions
                        .create_session(user_id.clone(), delegate_id.clone(), &requested_capabilities, protocol_version)
                        .await
                }
            }
        } else {
            self.handler
                .sessions
                .create_session(user_id.clone(), delegate_id.clone(), &requested_capabilities, protocol_version)
                .await
        };

        if self.handler.delegates.is_connected(&user_id, &delegate_id).await {
            return Some(CloseConnection { code: CloseCode::NAME_COLLISION, reason: "delegate already connected".to_string() });
        }

        let channel = ReliableChannel::new(self.outbound.clone());
        if requested_session_id.as_deref() == Some(session.id.as_str())
            && let Some(snapshot) = self.handler.sessions.get_reliable_state(&session.id).await
        {
            channel.restore_state(snapshot).await;
        }

        *self.channel.write().await = Some(channel.clone());
        *self.session_id.write().await = Some(session.id.clone());
        *self.delegate_id.write().await = Some(delegate_id.clone());
        self.handler.reserved.lock().await.remove(&(user_id.clone(), delegate_id.clone()));

        self.handler
            .delegates
            .register(ConnectedDelegate { user_id, delegate_id, session_id: session.id.clone(), channel: channel.clone(), tool_count: 0 })
            .await;

        self.send_framed(HostToDelegate::Ack {
            session_id: session.id,
            negotiated_capabilities: session.capabilities.into_iter().collect(),
            feature_sets: session.feature_sets,
            resumed_from_seq: last_received_seq,
        })
        .await;

        if let Some(last_seq) = last_received_seq
            && let Err(error) = channel.resend_buffered_after(last_seq).await
        {
            tracing::warn!(%error, "failed to resend buffered frames after resume");
        }

        None
    }

    async fn handle_tool_manifest(self: &Arc<Self>, delegate_id: String, tools: Vec<mcpl_types::ToolManifestEntry>) -> Option<CloseConnection> {
        let Some(user_id) = self.user_id.read().await.clone() else { return auth_required() };

        let mut server_ids = std::collections::HashMap::new();
        for tool in &tools {
            if let Some(server_name) = &tool.server_name {
                let server_id = self.handler.delegates.get_or_create_server_id(&delegate_id, server_name).await;
                server_ids.insert(server_name.clone(), server_id);
            }
        }

        let executor = Arc::new(DelegateToolExecutor {
            delegates: self.handler.delegates.clone(),
            delegate_id: delegate_id.clone(),
            timeout: self.handler.config.default_tool_call_timeout,
        });
        let tool_count = tools.len();
        match self
            .handler
            .tools
            .install_delegate_tools(&user_id, &delegate_id, move |name| server_ids.get(name).cloned(), tools, executor)
            .await
        {
            Ok(installed) => {
                self.handler.delegates.update_tool_count(&user_id, &delegate_id, tool_count).await;
                self.send_legacy(HostToDelegate::ToolManifestAck { tool_count, tools: installed }).await;
            }
            Err(error) => tracing::warn!(%error, delegate_id, "rejected tool_manifest"),
        }
        None
    }

    async fn handle_trigger_inference(
        self: &Arc<Self>,
        trigger_id: String,
        conversation_id: Option<String>,
        participant_id: Option<String>,
        context: Value,
        system_message: Option<String>,
    ) -> Option<CloseConnection> {
        let Some(user_id) = self.user_id.read().await.clone() else { return auth_required() };
        if let Some(conversation_id) = &conversation_id {
            *self.last_conversation_id.write().await = Some(conversation_id.clone());
        }

        let outcome = self
            .handler
            .trigger_inference
            .handle(&user_id, conversation_id.as_deref(), participant_id.as_deref(), &context, system_message.as_deref())
            .await;

        let message = match outcome {
            Ok(response) => HostToDelegate::TriggerInferenceResult {
                trigger_id,
                success: true,
                conversation_id,
                message_id: None,
                response: Some(response),
                error: None,
            },
            Err(error) => HostToDelegate::TriggerInferenceResult {
                trigger_id,
                success: false,
                conversation_id,
                message_id: None,
                response: None,
                error: Some(error),
            },
        };
        self.send_legacy(message).await;
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_push_event(
        self: &Arc<Self>,
        id: String,
        source: String,
        conversation_id: String,
        event_type: String,
        payload: Value,
        system_message: Option<String>,
        idempotency_key: Option<String>,
        timestamp: u64,
    ) -> Option<CloseConnection> {
        let Some(user_id) = self.user_id.read().await.clone() else { return auth_required() };
        let Some(delegate_id) = self.delegate_id.read().await.clone() else { return auth_required() };
        *self.last_conversation_id.write().await = Some(conversation_id.clone());

        self.handler
            .events
            .push(IncomingPushEvent { id, source, conversation_id, event_type, payload, system_message, idempotency_key, timestamp, delegate_id, user_id })
            .await;
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_inference_request(
        self: &Arc<Self>,
        request_id: String,
        server_id: String,
        conversation_id: String,
        system_message: Option<String>,
        user_message: String,
        max_tokens: Option<u32>,
        stream: bool,
    ) -> Option<CloseConnection> {
        let Some(user_id) = self.user_id.read().await.clone() else { return auth_required() };
        let Some(delegate_id) = self.delegate_id.read().await.clone() else { return auth_required() };
        *self.last_conversation_id.write().await = Some(conversation_id.clone());

        let broker = self.handler.inference.clone();
        let payload = InferenceRequestPayload { request_id, server_id, conversation_id, system_message, user_message, max_tokens, stream };
        tokio::spawn(async move { broker.handle_request(&user_id, &delegate_id, payload).await });
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_scope_change_request(
        self: &Arc<Self>,
        request_id: String,
        server_id: String,
        url: Option<String>,
        server_name: Option<String>,
        requested_capabilities: Vec<String>,
        reason: String,
        conversation_id: Option<String>,
    ) -> Option<CloseConnection> {
        let Some(user_id) = self.user_id.read().await.clone() else { return auth_required() };
        let Some(delegate_id) = self.delegate_id.read().await.clone() else { return auth_required() };
        if let Some(conversation_id) = &conversation_id {
            *self.last_conversation_id.write().await = Some(conversation_id.clone());
        }
        let capabilities = parse_capabilities(&requested_capabilities);
        self.handler
            .scope
            .request_scope_change(request_id, user_id, delegate_id, server_id, conversation_id, url, server_name, capabilities, reason)
            .await;
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_scope_elevate_request(
        self: &Arc<Self>,
        request_id: String,
        delegate_id: String,
        server_id: String,
        conversation_id: String,
        feature_set: String,
        label: String,
        requested_capabilities: Vec<String>,
        reason: String,
        timeout_ms: Option<u64>,
    ) -> Option<CloseConnection> {
        let Some(user_id) = self.user_id.read().await.clone() else { return auth_required() };
        *self.last_conversation_id.write().await = Some(conversation_id.clone());
        let capabilities = parse_capabilities(&requested_capabilities);
        self.handler
            .scope
            .request_scope_elevate(
                request_id,
                user_id,
                delegate_id,
                server_id,
                conversation_id,
                feature_set,
                label,
                capabilities,
                reason,
                timeout_ms.map(Duration::from_millis),
            )
            .await;
        None
    }

    async fn handle_feature_sets_changed(self: &Arc<Self>, feature_sets: mcpl_types::FeatureSetMap) -> Option<CloseConnection> {
        let Some(delegate_id) = self.delegate_id.read().await.clone() else { return auth_required() };
        let Some(session_id) = self.session_id.read().await.clone() else { return auth_required() };
        let server_ids: Vec<String> = self
            .handler
            .delegates
            .server_ids_for_delegate(&delegate_id)
            .await
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        let expanded = expand_feature_sets(&feature_sets, &server_ids);
        self.handler.sessions.set_feature_sets(&session_id, expanded).await;
        None
    }

    async fn handle_state_patch(self: &Arc<Self>, request_id: String, conversation_id: String, patch: mcpl_types::JsonPatch) -> Option<CloseConnection> {
        let Some(user_id) = self.user_id.read().await.clone() else { return auth_required() };
        *self.last_conversation_id.write().await = Some(conversation_id.clone());
        let message = match self.handler.state.apply_patch(&user_id, &conversation_id, &patch).await {
            Ok(()) => HostToDelegate::StatePatchResult { request_id, success: true, error: None },
            Err(error) => HostToDelegate::StatePatchResult { request_id, success: false, error: Some(error.to_string()) },
        };
        self.send_framed(message).await;
        None
    }

    async fn handle_state_rollback(
        self: &Arc<Self>,
        request_id: String,
        conversation_id: String,
        checkpoint_id: Option<String>,
    ) -> Option<CloseConnection> {
        let Some(user_id) = self.user_id.read().await.clone() else { return auth_required() };
        *self.last_conversation_id.write().await = Some(conversation_id.clone());

        let message = if let Some(requested_id) = checkpoint_id {
            match self.handler.state.can_rollback(&user_id, &conversation_id, Some(&requested_id)).await {
                RollbackCheck::Exists { checkpoint_id } => match self.handler.state.commit_rollback(&user_id, &conversation_id, &checkpoint_id).await {
                    Ok(outcome) => HostToDelegate::StateResponse {
                        request_id,
                        state: outcome.state,
                        rolled_back: Some(true),
                        checkpoint_id: Some(outcome.checkpoint_id),
                        error: None,
                    },
                    Err(error) => HostToDelegate::StateResponse { request_id, state: None, rolled_back: Some(false), checkpoint_id: None, error: Some(error.to_string()) },
                },
                RollbackCheck::NoCheckpoints => HostToDelegate::StateResponse {
                    request_id,
                    state: None,
                    rolled_back: Some(false),
                    checkpoint_id: None,
                    error: Some(CoreError::NoCheckpoints.to_string()),
                },
                RollbackCheck::Expired => HostToDelegate::StateResponse {
                    request_id,
                    state: None,
                    rolled_back: Some(false),
                    checkpoint_id: None,
                    error: Some(CoreError::CheckpointExpired(requested_id).to_string()),
                },
                RollbackCheck::Unknown => HostToDelegate::StateResponse {
                    request_id,
                    state: None,
                    rolled_back: Some(false),
                    checkpoint_id: None,
                    error: Some(CoreError::CheckpointUnknown(requested_id).to_string()),
                },
            }
        } else {
            match self.handler.state.rollback_to_parent(&user_id, &conversation_id).await {
                Ok(outcome) => HostToDelegate::StateResponse {
                    request_id,
                    state: outcome.state,
                    rolled_back: Some(true),
                    checkpoint_id: Some(outcome.checkpoint_id),
                    error: None,
                },
                Err(error) => HostToDelegate::StateResponse { request_id, state: None, rolled_back: Some(false), checkpoint_id: None, error: Some(error.to_string()) },
            }
        };
        self.send_framed(message).await;
        None
    }

    async fn handle_checkpoint_list(self: &Arc<Self>, request_id: String, conversation_id: String) -> Option<CloseConnection> {
        *self.last_conversation_id.write().await = Some(conversation_id.clone());
        let (current, summaries) = self.handler.state.get_checkpoints(&conversation_id).await;
        let checkpoints = summaries
            .into_iter()
            .map(|summary| mcpl_types::CheckpointSummary {
                id: summary.id,
                parent: summary.parent,
                children: summary.children,
                created_at: summary.created_at,
                is_current: summary.is_current,
                label: summary.label,
                mutation_count: summary.mutation_count,
            })
            .collect();
        self.send_framed(HostToDelegate::CheckpointListResponse { request_id, current, checkpoints }).await;
        None
    }

    async fn handle_model_info_request(self: &Arc<Self>, request_id: String) {
        let conversation_id = self.last_conversation_id.read().await.clone().unwrap_or_default();
        let info = match self.handler.engine.model_info(&conversation_id).await {
            Ok(info) => info,
            Err(error) => {
                tracing::warn!(%error, "model_info lookup failed");
                return;
            }
        };
        let message = HostToDelegate::ModelInfoResponse {
            request_id,
            model_id: info.get("modelId").or_else(|| info.get("model")).and_then(Value::as_str).unwrap_or("unknown").to_string(),
            provider: info.get("provider").and_then(Value::as_str).unwrap_or("unknown").to_string(),
            context_window: info.get("contextWindow").and_then(Value::as_u64).unwrap_or(0),
            output_token_limit: info.get("outputTokenLimit").and_then(Value::as_u64).unwrap_or(0),
            supports_thinking: info.get("supportsThinking").and_then(Value::as_bool).unwrap_or(false),
            supports_prefill: info.get("supportsPrefill").and_then(Value::as_bool).unwrap_or(false),
            capabilities: info
                .get("capabilities")
                .and_then(Value::as_array)
                .map(|values| values.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default(),
        };
        self.send_framed(message).await;
    }

    /// Tears down this connection's registration. Safe to call exactly once,
    /// after the transport has actually closed.
    pub async fn on_close(&self) {
        let Some(session_id) = self.session_id.read().await.clone() else {
            if let (Some(user_id), Some(delegate_id)) = (self.user_id.read().await.clone(), self.delegate_id.read().await.clone()) {
                self.handler.reserved.lock().await.remove(&(user_id, delegate_id));
            }
            return;
        };

        if let Some(channel) = self.channel.read().await.clone() {
            let snapshot = channel.get_state().await;
            self.handler.sessions.save_reliable_state(&session_id, snapshot).await;
        }

        if let Some((user_id, delegate_id)) = self.handler.delegates.unregister_session(&session_id).await
            && !self.handler.delegates.is_connected(&user_id, &delegate_id).await
        {
            self.handler.tools.remove_delegate_tools(&user_id, &delegate_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::collaborators::test_support::EchoInferenceEngine;
    use crate::collaborators::test_support::FixedModelResolver;
    use crate::collaborators::test_support::RecordingBroadcaster;
    use crate::collaborators::test_support::StaticAuthResolver;
    use crate::config::Config;
    use crate::event_log::EventLog;
    use crate::event_queue::EventQueueConfig;
    use crate::event_queue::PushEventEntry;
    use crate::event_queue::PushEventHandler;
    use crate::inference_router::InferenceRouter;
    use crate::state_manager::StateManagerConfig;

    struct NoopPushHandler;

    impl PushEventHandler for NoopPushHandler {
        fn handle<'a>(&'a self, _entry: &'a PushEventEntry) -> BoxFuture<'a, std::result::Result<String, String>> {
            Box::pin(async move { Ok("ok".to_string()) })
        }
    }

    struct EchoTriggerInference;

    impl TriggerInferenceHandler for EchoTriggerInference {
        fn handle<'a>(
            &'a self,
            _user_id: &'a str,
            _conversation_id: Option<&'a str>,
            _participant_id: Option<&'a str>,
            _context: &'a Value,
            _system_message: Option<&'a str>,
        ) -> BoxFuture<'a, std::result::Result<String, String>> {
            Box::pin(async move { Ok("reply".to_string()) })
        }
    }

    async fn build_handler() -> Arc<DelegateHandler> {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let sessions = SessionManager::new();
        let delegates = DelegateManager::new(broadcaster.clone());
        let tools = ToolRegistry::new();
        let hooks = HookManager::new(sessions.clone(), delegates.clone(), Duration::from_millis(200), 10);

        let dir = tempfile::tempdir().expect("tempdir");
        let event_log = Arc::new(EventLog::new(dir.path().join("events")));
        let events = EventQueue::new(
            EventQueueConfig { max_pushes_per_hour: 60, idempotency_window: Duration::from_secs(1800), max_queue_size: 100 },
            event_log.clone(),
            broadcaster.clone(),
            Arc::new(NoopPushHandler),
        );

        let router = InferenceRouter::spawn(dir.path()).await;
        let inference = InferenceBroker::new(
            30,
            router,
            delegates.clone(),
            Arc::new(EchoInferenceEngine),
            Arc::new(FixedModelResolver(None)),
            broadcaster.clone(),
        );

        let state = StateManager::new(
            StateManagerConfig { max_nodes: 50, max_tombstones: 200, max_state_bytes: 256 * 1024, checkpoint_interval: 10 },
            event_log.clone(),
            broadcaster.clone(),
            crate::ui_event_log::UiEventLog::new(dir.path().join("ui")),
        );
        let scope = ScopeSubsystem::new(delegates.clone(), broadcaster.clone(), event_log, Duration::from_secs(300), Duration::from_secs(60));

        DelegateHandler::new(
            sessions,
            delegates,
            tools,
            hooks,
            events,
            inference,
            Arc::new(EchoInferenceEngine),
            state,
            scope,
            Arc::new(StaticAuthResolver("user-1".to_string())),
            Arc::new(EchoTriggerInference),
            Config::default(),
        )
    }

    fn hello_message(delegate_id: &str) -> Value {
        serde_json::json!({
            "type": "mcpl/hello",
            "protocolVersion": "1",
            "capabilities": ["context_hooks"],
            "delegateId": delegate_id,
            "delegateName": "Alpha Delegate",
        })
    }

    async fn authenticate(conn: &Arc<DelegateConnection>, rx: &mut mpsc::UnboundedReceiver<Value>, delegate_id: &str) {
        let close = conn
            .handle_message(serde_json::json!({
                "type": "delegate_auth",
                "version": "1",
                "token": "secret",
                "delegateId": delegate_id,
                "capabilities": [],
            }))
            .await;
        assert!(close.is_none());
        let frame = rx.recv().await.expect("auth result sent");
        assert_eq!(frame["type"], "delegate_auth_result");
        assert_eq!(frame["success"], true);
    }

    #[tokio::test]
    async fn hello_after_auth_yields_ack() {
        let handler = build_handler().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = handler.begin_connection(tx);
        authenticate(&conn, &mut rx, "alpha").await;

        let close = conn.handle_message(hello_message("alpha")).await;
        assert!(close.is_none());
        let frame = rx.recv().await.expect("ack sent");
        assert_eq!(frame["payload"]["type"], "mcpl/ack");
    }

    #[tokio::test]
    async fn duplicate_connection_is_rejected_with_name_collision() {
        let handler = build_handler().await;

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let conn1 = handler.begin_connection(tx1);
        authenticate(&conn1, &mut rx1, "alpha").await;
        assert!(conn1.handle_message(hello_message("alpha")).await.is_none());
        let _ = rx1.recv().await.expect("first ack");

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let conn2 = handler.begin_connection(tx2);
        let close = conn2
            .handle_message(serde_json::json!({
                "type": "delegate_auth",
                "version": "1",
                "token": "secret",
                "delegateId": "alpha",
                "capabilities": [],
            }))
            .await;
        let close = close.expect("duplicate auth rejected");
        assert_eq!(close.code, CloseCode::NAME_COLLISION);
        let _ = rx2;
    }

    #[tokio::test]
    async fn tool_manifest_round_trips_through_installed_executor() {
        let handler = build_handler().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = handler.begin_connection(tx);
        authenticate(&conn, &mut rx, "alpha").await;
        conn.handle_message(hello_message("alpha")).await;
        let _ = rx.recv().await.expect("ack");

        conn.handle_message(serde_json::json!({
            "type": "tool_manifest",
            "delegateId": "alpha",
            "tools": [{
                "name": "read_file",
                "inputSchema": {"type": "object"},
            }],
        }))
        .await;
        let ack = rx.recv().await.expect("manifest ack");
        assert_eq!(ack["type"], "tool_manifest_ack");
        assert_eq!(ack["toolCount"], 1);

        let resolved = handler.tools.resolve("alpha__read_file", "user-1").await.expect("tool resolves");
        assert_eq!(resolved.original_name, "read_file");
    }

    #[tokio::test]
    async fn disconnect_without_replacement_drops_installed_tools() {
        let handler = build_handler().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = handler.begin_connection(tx);
        authenticate(&conn, &mut rx, "alpha").await;
        conn.handle_message(hello_message("alpha")).await;
        let _ = rx.recv().await.expect("ack");
        conn.handle_message(serde_json::json!({
            "type": "tool_manifest",
            "delegateId": "alpha",
            "tools": [{"name": "read_file", "inputSchema": {"type": "object"}}],
        }))
        .await;
        let _ = rx.recv().await.expect("manifest ack");

        conn.on_close().await;

        assert!(handler.tools.resolve("alpha__read_file", "user-1").await.is_err());
    }

    #[test]
    fn validate_delegate_id_rejects_reserved_and_malformed_ids() {
        assert!(validate_delegate_id("alpha").is_ok());
        assert!(validate_delegate_id("").is_err());
        assert!(validate_delegate_id("server").is_err());
        assert!(validate_delegate_id("has__separator").is_err());
        assert!(validate_delegate_id("has space").is_err());
    }

    #[tokio::test]
    async fn query_string_auth_lets_hello_succeed_without_legacy_auth_message() {
        let handler = build_handler().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = handler.begin_connection(tx);

        let close = conn.authenticate_from_query(Some("secret".to_string()), None, "alpha".to_string()).await;
        assert!(close.is_none());
        let frame = rx.recv().await.expect("auth result sent");
        assert_eq!(frame["type"], "delegate_auth_result");
        assert_eq!(frame["success"], true);

        let close = conn.handle_message(hello_message("alpha")).await;
        assert!(close.is_none());
        let frame = rx.recv().await.expect("ack sent");
        assert_eq!(frame["payload"]["type"], "mcpl/ack");
    }

    #[tokio::test]
    async fn query_string_auth_prefers_api_key_over_token() {
        let handler = build_handler().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = handler.begin_connection(tx);

        // An empty token would be rejected by `StaticAuthResolver`; a non-empty
        // apiKey alongside it must still win.
        let close = conn.authenticate_from_query(Some(String::new()), Some("secret".to_string()), "alpha".to_string()).await;
        assert!(close.is_none());
        let frame = rx.recv().await.expect("auth result sent");
        assert_eq!(frame["success"], true);
    }

    #[tokio::test]
    async fn query_string_auth_rejects_invalid_delegate_id() {
        let handler = build_handler().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = handler.begin_connection(tx);

        let close = conn.authenticate_from_query(Some("secret".to_string()), None, "server".to_string()).await;
        let close = close.expect("reserved delegate id rejected");
        assert_eq!(close.code, CloseCode::AUTH_OR_VALIDATION);
        let _ = rx;
    }

    #[tokio::test]
    async fn query_string_auth_rejects_duplicate_connection() {
        let handler = build_handler().await;
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let conn1 = handler.begin_connection(tx1);
        assert!(conn1.authenticate_from_query(Some("secret".to_string()), None, "alpha".to_string()).await.is_none());
        let _ = rx1.recv().await.expect("first auth result");
        assert!(conn1.handle_message(hello_message("alpha")).await.is_none());
        let _ = rx1.recv().await.expect("first ack");

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let conn2 = handler.begin_connection(tx2);
        let close = conn2.authenticate_from_query(Some("secret".to_string()), None, "alpha".to_string()).await;
        let close = close.expect("duplicate connection rejected");
        assert_eq!(close.code, CloseCode::NAME_COLLISION);
        let _ = rx2;
    }
}
