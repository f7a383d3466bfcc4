//! Delegate Manager (§4.3): tracks connected delegates, issues tool-call
//! requests over their Reliable Channel, correlates responses by
//! `requestId`, and mints stable per-`(delegate, server)` ids.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcpl_channel::ReliableChannel;
use mcpl_types::HostToDelegate;
use mcpl_types::ScopeContext;
use mcpl_types::ToolCallContent;
use mcpl_types::ToolCallResult;
use mcpl_types::ToolInvocation;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::collaborators::RoomBroadcaster;

/// A currently-connected delegate: its reliable channel and the tool
/// manifest it last advertised.
pub struct ConnectedDelegate {
    pub user_id: String,
    pub delegate_id: String,
    pub session_id: String,
    pub channel: ReliableChannel,
    pub tool_count: usize,
}

/// Read-only view of a connected delegate, for status-reporting tools.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateSummary {
    pub delegate_id: String,
    pub tool_count: usize,
}

struct PendingCall {
    delegate_key: String,
    sender: oneshot::Sender<ToolCallResult>,
}

fn delegate_key(user_id: &str, delegate_id: &str) -> String {
    format!("{user_id}:{delegate_id}")
}

pub struct DelegateManager {
    delegates: RwLock<HashMap<String, ConnectedDelegate>>,
    session_index: RwLock<HashMap<String, String>>,
    server_ids: Mutex<HashMap<(String, String), String>>,
    pending: Mutex<HashMap<String, PendingCall>>,
    broadcaster: Arc<dyn RoomBroadcaster>,
}

impl DelegateManager {
    pub fn new(broadcaster: Arc<dyn RoomBroadcaster>) -> Arc<Self> {
        Arc::new(Self {
            delegates: RwLock::new(HashMap::new()),
            session_index: RwLock::new(HashMap::new()),
            server_ids: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            broadcaster,
        })
    }

    /// Registers a newly-authenticated, channel-backed delegate connection
    /// and broadcasts `connected` to the owning user's UI rooms.
    pub async fn register(&self, delegate: ConnectedDelegate) {
        let key = delegate_key(&delegate.user_id, &delegate.delegate_id);
        let user_id = delegate.user_id.clone();
        let session_id = delegate.session_id.clone();
        self.delegates.write().await.insert(key.clone(), delegate);
        self.session_index.write().await.insert(session_id, key);
        self.broadcast_status(&user_id, "connected").await;
    }

    pub async fn is_connected(&self, user_id: &str, delegate_id: &str) -> bool {
        self.delegates.read().await.contains_key(&delegate_key(user_id, delegate_id))
    }

    /// Removes the connection identified by `session_id` and fails every
    /// pending tool call addressed to it. Returns the `(user_id,
    /// delegate_id)` pair so the caller can apply the tool-registry
    /// reconnect-race guard before deciding whether to drop its tools.
    pub async fn unregister_session(&self, session_id: &str) -> Option<(String, String)> {
        let key = self.session_index.write().await.remove(session_id)?;
        let delegate = self.delegates.write().await.remove(&key)?;

        let mut pending = self.pending.lock().await;
        let stale: Vec<String> = pending
            .iter()
            .filter(|(_, call)| call.delegate_key == key)
            .map(|(request_id, _)| request_id.clone())
            .collect();
        for request_id in stale {
            if let Some(call) = pending.remove(&request_id) {
                let _ = call.sender.send(error_result("delegate disconnected before responding"));
            }
        }
        drop(pending);

        self.broadcast_status(&delegate.user_id, "disconnected").await;
        Some((delegate.user_id, delegate.delegate_id))
    }

    /// Replaces the advertised tool count for a delegate and broadcasts
    /// `tools_updated`.
    pub async fn update_tool_count(&self, user_id: &str, delegate_id: &str, tool_count: usize) {
        let key = delegate_key(user_id, delegate_id);
        if let Some(entry) = self.delegates.write().await.get_mut(&key) {
            entry.tool_count = tool_count;
        }
        self.broadcast_status(user_id, "tools_updated").await;
    }

    /// Stable for the process lifetime: the same `(delegate_id,
    /// server_name)` pair always maps to the same id, including across
    /// reconnects while the process stays up. Durable persistence across
    /// process restarts is left unimplemented (§9 Open Questions).
    pub async fn get_or_create_server_id(&self, delegate_id: &str, server_name: &str) -> String {
        let mut server_ids = self.server_ids.lock().await;
        server_ids
            .entry((delegate_id.to_string(), server_name.to_string()))
            .or_insert_with(|| format!("{delegate_id}.{server_name}"))
            .clone()
    }

    /// Sends a framed `tool_call_request` and awaits the matching
    /// `tool_call_response`, racing a per-call timeout. If the delegate
    /// isn't connected, synchronously returns an error result rather than
    /// ever registering a pending call.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_tool_on_delegate(
        &self,
        user_id: &str,
        delegate_id: &str,
        conversation_id: &str,
        message_id: Option<String>,
        tool: ToolInvocation,
        timeout: Duration,
        scope_context: Option<ScopeContext>,
    ) -> ToolCallResult {
        let key = delegate_key(user_id, delegate_id);
        let channel = {
            let delegates = self.delegates.read().await;
            match delegates.get(&key) {
                Some(d) => d.channel.clone(),
                None => return error_result(&format!("delegate {delegate_id} is not connected")),
            }
        };

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            request_id.clone(),
            PendingCall {
                delegate_key: key.clone(),
                sender: tx,
            },
        );

        let message = HostToDelegate::ToolCallRequest {
            request_id: request_id.clone(),
            conversation_id: conversation_id.to_string(),
            message_id,
            tool,
            timeout: timeout.as_millis() as u64,
            scope_context,
        };
        let payload = match serde_json::to_value(&message) {
            Ok(value) => value,
            Err(error) => {
                self.pending.lock().await.remove(&request_id);
                return error_result(&format!("failed to encode tool_call_request: {error}"));
            }
        };
        if let Err(error) = channel.send(payload).await {
            self.pending.lock().await.remove(&request_id);
            return error_result(&format!("failed to send tool_call_request: {error}"));
        }

        tokio::select! {
            result = rx => result.unwrap_or_else(|_| error_result("delegate disconnected before responding")),
            () = tokio::time::sleep(timeout) => {
                self.pending.lock().await.remove(&request_id);
                error_result(&format!("tool call timed out after {}ms", timeout.as_millis()))
            }
        }
    }

    /// Completes a pending tool call on receipt of a `tool_call_response`.
    /// A response with no matching pending entry (already timed out, or
    /// never ours) is logged and dropped.
    pub async fn complete_tool_call(&self, request_id: &str, result: ToolCallResult) {
        let entry = self.pending.lock().await.remove(request_id);
        match entry {
            Some(call) => {
                let _ = call.sender.send(result);
            }
            None => tracing::warn!(request_id, "tool_call_response for unknown or expired request"),
        }
    }

    /// A snapshot of every delegate currently connected for `user_id`, for
    /// the `list_mcp_servers`/`get_server_status` built-ins.
    pub async fn summaries_for_user(&self, user_id: &str) -> Vec<DelegateSummary> {
        self.delegates
            .read()
            .await
            .values()
            .filter(|d| d.user_id == user_id)
            .map(|d| DelegateSummary {
                delegate_id: d.delegate_id.clone(),
                tool_count: d.tool_count,
            })
            .collect()
    }

    /// Every `(serverName, serverId)` pair minted for `delegate_id`.
    pub async fn server_ids_for_delegate(&self, delegate_id: &str) -> Vec<(String, String)> {
        self.server_ids
            .lock()
            .await
            .iter()
            .filter(|((d, _), _)| d == delegate_id)
            .map(|((_, name), id)| (name.clone(), id.clone()))
            .collect()
    }

    pub async fn channel_for(&self, user_id: &str, delegate_id: &str) -> Option<ReliableChannel> {
        self.delegates
            .read()
            .await
            .get(&delegate_key(user_id, delegate_id))
            .map(|d| d.channel.clone())
    }

    async fn broadcast_status(&self, user_id: &str, status: &str) {
        let delegates: Vec<Value> = self
            .delegates
            .read()
            .await
            .values()
            .filter(|d| d.user_id == user_id)
            .map(|d| {
                serde_json::json!({
                    "delegateId": d.delegate_id,
                    "toolCount": d.tool_count,
                })
            })
            .collect();
        self.broadcaster
            .broadcast(
                user_id,
                serde_json::json!({"type": "delegate_status", "status": status, "delegates": delegates}),
            )
            .await;
    }
}

fn error_result(message: &str) -> ToolCallResult {
    ToolCallResult {
        content: ToolCallContent::Text(message.to_string()),
        is_error: true,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use std::time::Duration;

    use mcpl_channel::ReliableChannel;
    use tokio::sync::mpsc;

    use super::*;
    use crate::collaborators::test_support::RecordingBroadcaster;

    fn invocation(name: &str) -> ToolInvocation {
        ToolInvocation {
            id: "call-1".to_string(),
            name: name.to_string(),
            input: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn not_connected_returns_error_without_registering_pending() {
        let manager = DelegateManager::new(Arc::new(RecordingBroadcaster::default()));
        let result = manager
            .execute_tool_on_delegate(
                "user-1",
                "alpha",
                "conv-1",
                None,
                invocation("read"),
                Duration::from_millis(50),
                None,
            )
            .await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn response_completes_pending_call() {
        let manager = DelegateManager::new(Arc::new(RecordingBroadcaster::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = ReliableChannel::new(tx);
        manager
            .register(ConnectedDelegate {
                user_id: "user-1".to_string(),
                delegate_id: "alpha".to_string(),
                session_id: "sess-1".to_string(),
                channel,
                tool_count: 1,
            })
            .await;

        let manager_clone = manager.clone();
        let call = tokio::spawn(async move {
            manager_clone
                .execute_tool_on_delegate(
                    "user-1",
                    "alpha",
                    "conv-1",
                    None,
                    invocation("read"),
                    Duration::from_secs(5),
                    None,
                )
                .await
        });

        // Drain the outbound frame to recover the request id the manager
        // minted, then complete it as if the delegate had responded.
        let sent = rx.recv().await.expect("tool_call_request sent");
        let request_id = sent["payload"]["requestId"].as_str().expect("requestId present").to_string();
        manager
            .complete_tool_call(
                &request_id,
                ToolCallResult {
                    content: ToolCallContent::Text("ok".to_string()),
                    is_error: false,
                },
            )
            .await;

        let result = call.await.expect("join");
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn disconnect_fails_pending_calls() {
        let manager = DelegateManager::new(Arc::new(RecordingBroadcaster::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = ReliableChannel::new(tx);
        manager
            .register(ConnectedDelegate {
                user_id: "user-1".to_string(),
                delegate_id: "alpha".to_string(),
                session_id: "sess-1".to_string(),
                channel,
                tool_count: 0,
            })
            .await;

        let manager_clone = manager.clone();
        let call = tokio::spawn(async move {
            manager_clone
                .execute_tool_on_delegate(
                    "user-1",
                    "alpha",
                    "conv-1",
                    None,
                    invocation("read"),
                    Duration::from_secs(5),
                    None,
                )
                .await
        });
        let _ = rx.recv().await.expect("tool_call_request sent");

        manager.unregister_session("sess-1").await;
        let result = call.await.expect("join");
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn server_id_is_stable_across_calls() {
        let manager = DelegateManager::new(Arc::new(RecordingBroadcaster::default()));
        let first = manager.get_or_create_server_id("alpha", "search").await;
        let second = manager.get_or_create_server_id("alpha", "search").await;
        assert_eq!(first, second);
    }
}
