//! Scope Subsystem (§4.9): approval flows for a delegate asking to connect
//! a new MCP server (scope-change) or to raise the capabilities already
//! granted to a connected one (scope-elevate), gated by an optional
//! whitelist/blacklist policy per `(user, delegate)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcpl_types::Capability;
use mcpl_types::HostToDelegate;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use wildmatch::WildMatch;

use crate::collaborators::RoomBroadcaster;
use crate::delegate_manager::DelegateManager;
use crate::event_log::EventLog;
use crate::event_log::EventLogScope;

/// One whitelist/blacklist rule: matches a feature-set pattern (may
/// contain `*`, matched with the same wildcard semantics the Session
/// Manager uses for feature sets), an optional label, and the set of
/// capabilities it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRule {
    pub feature_set_pattern: String,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub label: Option<String>,
}

impl ScopeRule {
    fn matches(&self, feature_set: &str, label: Option<&str>, capability: Capability) -> bool {
        WildMatch::new(&self.feature_set_pattern).matches(feature_set)
            && self.capabilities.contains(&capability)
            && self.label.as_deref().is_none_or(|expected| Some(expected) == label)
    }
}

/// Whitelist/blacklist for one `(userId, delegateId)` pair. The blacklist
/// is consulted first: any overlap denies outright, regardless of the
/// whitelist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopePolicy {
    #[serde(default)]
    pub whitelist: Vec<ScopeRule>,
    #[serde(default)]
    pub blacklist: Vec<ScopeRule>,
}

impl ScopePolicy {
    fn blacklist_denies(&self, feature_set: &str, label: Option<&str>, requested: &[Capability]) -> bool {
        requested
            .iter()
            .any(|cap| self.blacklist.iter().any(|r| r.matches(feature_set, label, *cap)))
    }

    fn whitelist_covers(&self, feature_set: &str, label: Option<&str>, requested: &[Capability]) -> bool {
        !requested.is_empty()
            && requested
                .iter()
                .all(|cap| self.whitelist.iter().any(|r| r.matches(feature_set, label, *cap)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    AutoDeny,
    AutoApprove,
    AskUser,
}

/// Envelope persisted to the requesting user's event log and replayed at
/// startup to reconstruct a delegate's per-user policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScopePolicyUpdated {
    #[serde(rename = "type")]
    kind: String,
    delegate_id: String,
    policy: ScopePolicy,
}

struct PendingScopeChange {
    user_id: String,
    delegate_id: String,
    server_id: String,
    conversation_id: Option<String>,
    url: Option<String>,
    server_name: Option<String>,
    requested_capabilities: Vec<Capability>,
    reason: String,
    version: u64,
}

struct PendingElevate {
    request_id: String,
    user_id: String,
    delegate_id: String,
    server_id: String,
    conversation_id: String,
    feature_set: String,
    label: String,
    requested_capabilities: Vec<Capability>,
    version: u64,
}

/// Parses the raw wire strings of a scope request into [`Capability`],
/// warning on and dropping anything unrecognized rather than failing the
/// whole request.
pub fn parse_capabilities(raw: &[String]) -> Vec<Capability> {
    raw.iter()
        .filter_map(|s| match serde_json::from_value::<Capability>(serde_json::Value::String(s.clone())) {
            Ok(cap) => Some(cap),
            Err(_) => {
                tracing::warn!(capability = %s, "unrecognized capability in scope request, dropping");
                None
            }
        })
        .collect()
}

pub struct ScopeSubsystem {
    delegates: Arc<DelegateManager>,
    broadcaster: Arc<dyn RoomBroadcaster>,
    event_log: Arc<EventLog>,
    change_timeout: Duration,
    elevate_default_timeout: Duration,
    policies: Mutex<HashMap<(String, String), ScopePolicy>>,
    pending_changes: Mutex<HashMap<String, PendingScopeChange>>,
    /// `{delegateId}::{featureSet}::{label}` -> the request currently
    /// representing that dedup bucket.
    pending_elevates: Mutex<HashMap<String, PendingElevate>>,
    next_version: Mutex<u64>,
}

impl ScopeSubsystem {
    pub fn new(
        delegates: Arc<DelegateManager>,
        broadcaster: Arc<dyn RoomBroadcaster>,
        event_log: Arc<EventLog>,
        change_timeout: Duration,
        elevate_default_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            delegates,
            broadcaster,
            event_log,
            change_timeout,
            elevate_default_timeout,
            policies: Mutex::new(HashMap::new()),
            pending_changes: Mutex::new(HashMap::new()),
            pending_elevates: Mutex::new(HashMap::new()),
            next_version: Mutex::new(0),
        })
    }

    /// Replays `scope_policy_updated` entries from `user_id`'s event log,
    /// reconstructing every delegate's policy as of the last persisted
    /// update. Run once at startup before live traffic is accepted.
    pub async fn replay_user(&self, user_id: &str) {
        let events: Vec<ScopePolicyUpdated> = self
            .event_log
            .replay(&EventLogScope::User(user_id.to_string()))
            .await
            .unwrap_or_default();
        let mut policies = self.policies.lock().await;
        for event in events {
            if event.kind != "scope_policy_updated" {
                continue;
            }
            policies.insert((user_id.to_string(), event.delegate_id), event.policy);
        }
    }

    pub async fn policy_for(&self, user_id: &str, delegate_id: &str) -> ScopePolicy {
        self.policies
            .lock()
            .await
            .get(&(user_id.to_string(), delegate_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    async fn set_policy(&self, user_id: &str, delegate_id: &str, policy: ScopePolicy) {
        self.policies
            .lock()
            .await
            .insert((user_id.to_string(), delegate_id.to_string()), policy.clone());
        self.event_log
            .append(
                &EventLogScope::User(user_id.to_string()),
                &ScopePolicyUpdated {
                    kind: "scope_policy_updated".to_string(),
                    delegate_id: delegate_id.to_string(),
                    policy,
                },
            )
            .await;
    }

    /// Adds a rule to the whitelist or blacklist and persists the update,
    /// used by the `manage_scope_policies` built-in tool.
    pub async fn add_rule(&self, user_id: &str, delegate_id: &str, rule: ScopeRule, to_whitelist: bool) {
        let mut policy = self.policy_for(user_id, delegate_id).await;
        if to_whitelist {
            policy.whitelist.push(rule);
        } else {
            policy.blacklist.push(rule);
        }
        self.set_policy(user_id, delegate_id, policy).await;
    }

    async fn next_version(&self) -> u64 {
        let mut guard = self.next_version.lock().await;
        *guard += 1;
        *guard
    }

    /// Starts a scope-change flow: asks the owning user's UI to approve
    /// connecting a new server, with a 5-minute auto-deny timer.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_scope_change(
        self: &Arc<Self>,
        request_id: String,
        user_id: String,
        delegate_id: String,
        server_id: String,
        conversation_id: Option<String>,
        url: Option<String>,
        server_name: Option<String>,
        requested_capabilities: Vec<Capability>,
        reason: String,
    ) {
        let version = self.next_version().await;
        self.pending_changes.lock().await.insert(
            request_id.clone(),
            PendingScopeChange {
                user_id: user_id.clone(),
                delegate_id: delegate_id.clone(),
                server_id: server_id.clone(),
                conversation_id: conversation_id.clone(),
                url: url.clone(),
                server_name: server_name.clone(),
                requested_capabilities: requested_capabilities.clone(),
                reason: reason.clone(),
                version,
            },
        );

        self.broadcaster
            .broadcast(
                &user_id,
                serde_json::json!({
                    "type": "scope_change_approval_needed",
                    "requestId": request_id,
                    "delegateId": delegate_id,
                    "serverId": server_id,
                    "url": url,
                    "serverName": server_name,
                    "requestedCapabilities": requested_capabilities,
                    "reason": reason,
                }),
            )
            .await;

        let subsystem = self.clone();
        let timeout = self.change_timeout;
        let timeout_request_id = request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            subsystem.timeout_scope_change(&timeout_request_id, version).await;
        });
    }

    async fn timeout_scope_change(&self, request_id: &str, version: u64) {
        let pending = {
            let mut pending_changes = self.pending_changes.lock().await;
            match pending_changes.get(request_id) {
                Some(entry) if entry.version == version => pending_changes.remove(request_id),
                _ => None,
            }
        };
        let Some(pending) = pending else { return };
        tracing::info!(request_id, "scope change request timed out, auto-denying");
        self.send_change_result(&pending.user_id, &pending.delegate_id, request_id, false, None)
            .await;
        self.broadcaster
            .broadcast(
                &pending.user_id,
                serde_json::json!({"type": "scope_change_result", "requestId": request_id, "status": "denied_by_timeout"}),
            )
            .await;
    }

    /// Called when the owning user's UI approves or denies a pending
    /// scope-change request. Approval does not finalize the outcome: the
    /// delegate must still report back via [`Self::complete_scope_change_connect`].
    pub async fn decide_scope_change(&self, request_id: &str, approved: bool) {
        let pending = self.pending_changes.lock().await.remove(request_id);
        let Some(pending) = pending else {
            tracing::warn!(request_id, "scope change decision for unknown or expired request");
            return;
        };

        if !approved {
            self.send_change_result(&pending.user_id, &pending.delegate_id, request_id, false, None)
                .await;
            self.broadcaster
                .broadcast(
                    &pending.user_id,
                    serde_json::json!({"type": "scope_change_result", "requestId": request_id, "status": "denied"}),
                )
                .await;
            return;
        }

        self.send_change_result(
            &pending.user_id,
            &pending.delegate_id,
            request_id,
            true,
            Some(pending.requested_capabilities.clone()),
        )
        .await;
        // Awaits `mcpl/connect_server_result` before the outcome is final;
        // the delegate handler correlates that by request id separately.
    }

    /// Records the delegate's attempt to actually connect the
    /// newly-approved server, broadcasting the terminal outcome.
    pub async fn complete_scope_change_connect(
        &self,
        user_id: &str,
        request_id: &str,
        server_id: Option<&str>,
        success: bool,
        error: Option<&str>,
    ) {
        let status = if success { "approved_connected" } else { "approved_failed" };
        self.broadcaster
            .broadcast(
                user_id,
                serde_json::json!({
                    "type": "scope_change_result",
                    "requestId": request_id,
                    "status": status,
                    "serverId": server_id,
                    "error": error,
                }),
            )
            .await;
    }

    async fn send_change_result(
        &self,
        user_id: &str,
        delegate_id: &str,
        request_id: &str,
        approved: bool,
        new_capabilities: Option<Vec<Capability>>,
    ) {
        let Some(channel) = self.delegates.channel_for(user_id, delegate_id).await else {
            return;
        };
        let message = HostToDelegate::ScopeChangeResult {
            request_id: request_id.to_string(),
            approved,
            new_capabilities,
        };
        if let Ok(payload) = serde_json::to_value(&message) {
            let _ = channel.send(payload).await;
        }
    }

    /// Evaluates a scope-elevate request against policy. Blacklist denies
    /// outright; whitelist approves outright; otherwise the request is
    /// deduplicated by `{delegateId}::{featureSet}::{label}` and routed to
    /// the owning user's UI, with a timeout (caller-supplied or the
    /// configured default) that auto-denies.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_scope_elevate(
        self: &Arc<Self>,
        request_id: String,
        user_id: String,
        delegate_id: String,
        server_id: String,
        conversation_id: String,
        feature_set: String,
        label: String,
        requested_capabilities: Vec<Capability>,
        reason: String,
        timeout: Option<Duration>,
    ) {
        let policy = self.policy_for(&user_id, &delegate_id).await;
        if policy.blacklist_denies(&feature_set, Some(&label), &requested_capabilities) {
            self.send_elevate_result(&user_id, &delegate_id, &request_id, false, None).await;
            return;
        }
        if policy.whitelist_covers(&feature_set, Some(&label), &requested_capabilities) {
            self.send_elevate_result(&user_id, &delegate_id, &request_id, true, Some(requested_capabilities))
                .await;
            return;
        }

        let dedup_key = format!("{delegate_id}::{feature_set}::{label}");
        let version = self.next_version().await;
        let already_pending = {
            let mut pending = self.pending_elevates.lock().await;
            let replaced = pending.contains_key(&dedup_key);
            pending.insert(
                dedup_key.clone(),
                PendingElevate {
                    request_id: request_id.clone(),
                    user_id: user_id.clone(),
                    delegate_id: delegate_id.clone(),
                    server_id: server_id.clone(),
                    conversation_id: conversation_id.clone(),
                    feature_set: feature_set.clone(),
                    label: label.clone(),
                    requested_capabilities: requested_capabilities.clone(),
                    version,
                },
            );
            replaced
        };

        if !already_pending {
            self.broadcaster
                .broadcast(
                    &user_id,
                    serde_json::json!({
                        "type": "scope_elevate_approval_needed",
                        "requestId": request_id,
                        "delegateId": delegate_id,
                        "serverId": server_id,
                        "conversationId": conversation_id,
                        "featureSet": feature_set,
                        "label": label,
                        "requestedCapabilities": requested_capabilities,
                        "reason": reason,
                    }),
                )
                .await;
        }

        let subsystem = self.clone();
        let timeout = timeout.unwrap_or(self.elevate_default_timeout);
        let key = dedup_key;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            subsystem.timeout_scope_elevate(&key, version).await;
        });
    }

    async fn timeout_scope_elevate(&self, key: &str, version: u64) {
        let pending = {
            let mut pending_elevates = self.pending_elevates.lock().await;
            match pending_elevates.get(key) {
                Some(entry) if entry.version == version => pending_elevates.remove(key),
                _ => None,
            }
        };
        let Some(pending) = pending else { return };
        tracing::info!(key, "scope elevate request timed out, auto-denying");
        self.send_elevate_result(&pending.user_id, &pending.delegate_id, &pending.request_id, false, None)
            .await;
    }

    /// Called when the owning user's UI resolves a pending scope-elevate
    /// request. `remember` persists the decision as a new policy rule so
    /// future identical requests are auto-resolved.
    pub async fn decide_scope_elevate(&self, request_id: &str, approved: bool, remember: bool) {
        let found = {
            let pending_elevates = self.pending_elevates.lock().await;
            pending_elevates
                .iter()
                .find(|(_, entry)| entry.request_id == request_id)
                .map(|(key, entry)| (key.clone(), entry.user_id.clone(), entry.delegate_id.clone()))
        };
        let Some((key, user_id, delegate_id)) = found else {
            tracing::warn!(request_id, "scope elevate decision for unknown or expired request");
            return;
        };
        let pending = self.pending_elevates.lock().await.remove(&key);
        let Some(pending) = pending else { return };

        self.send_elevate_result(
            &user_id,
            &delegate_id,
            request_id,
            approved,
            approved.then(|| pending.requested_capabilities.clone()),
        )
        .await;

        if remember {
            let rule = ScopeRule {
                feature_set_pattern: pending.feature_set.clone(),
                capabilities: pending.requested_capabilities.clone(),
                label: Some(pending.label.clone()),
            };
            self.add_rule(&user_id, &delegate_id, rule, approved).await;
        }
        let _ = (pending.server_id, pending.conversation_id);
    }

    async fn send_elevate_result(
        &self,
        user_id: &str,
        delegate_id: &str,
        request_id: &str,
        approved: bool,
        new_capabilities: Option<Vec<Capability>>,
    ) {
        let Some(channel) = self.delegates.channel_for(user_id, delegate_id).await else {
            return;
        };
        let message = HostToDelegate::ScopeElevateResult {
            request_id: request_id.to_string(),
            approved,
            new_capabilities,
        };
        if let Ok(payload) = serde_json::to_value(&message) {
            let _ = channel.send(payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use mcpl_channel::ReliableChannel;
    use tokio::sync::mpsc;

    use super::*;
    use crate::collaborators::test_support::RecordingBroadcaster;
    use crate::delegate_manager::ConnectedDelegate;

    async fn subsystem_with_delegate() -> (Arc<ScopeSubsystem>, mpsc::UnboundedReceiver<serde_json::Value>) {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let delegates = DelegateManager::new(broadcaster.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = ReliableChannel::new(tx);
        delegates
            .register(ConnectedDelegate {
                user_id: "user-1".to_string(),
                delegate_id: "alpha".to_string(),
                session_id: "sess-1".to_string(),
                channel,
                tool_count: 0,
            })
            .await;
        let dir = tempfile::tempdir().expect("tempdir");
        let event_log = Arc::new(EventLog::new(dir.path().to_path_buf()));
        let subsystem = ScopeSubsystem::new(
            delegates,
            broadcaster,
            event_log,
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        (subsystem, rx)
    }

    #[tokio::test]
    async fn blacklist_denies_without_asking_ui() {
        let (subsystem, mut rx) = subsystem_with_delegate().await;
        subsystem
            .add_rule(
                "user-1",
                "alpha",
                ScopeRule {
                    feature_set_pattern: "*".to_string(),
                    capabilities: vec![Capability::ToolManagement],
                    label: None,
                },
                false,
            )
            .await;

        subsystem
            .request_scope_elevate(
                "req-1".to_string(),
                "user-1".to_string(),
                "alpha".to_string(),
                "alpha.search".to_string(),
                "conv-1".to_string(),
                "search".to_string(),
                "admin".to_string(),
                vec![Capability::ToolManagement],
                "needs write access".to_string(),
                None,
            )
            .await;

        let frame = rx.recv().await.expect("result sent");
        assert_eq!(frame["payload"]["approved"], false);
    }

    #[tokio::test]
    async fn whitelist_approves_without_asking_ui() {
        let (subsystem, mut rx) = subsystem_with_delegate().await;
        subsystem
            .add_rule(
                "user-1",
                "alpha",
                ScopeRule {
                    feature_set_pattern: "alpha.*".to_string(),
                    capabilities: vec![Capability::PushEvents],
                    label: Some("trusted".to_string()),
                },
                true,
            )
            .await;

        subsystem
            .request_scope_elevate(
                "req-1".to_string(),
                "user-1".to_string(),
                "alpha".to_string(),
                "alpha.search".to_string(),
                "conv-1".to_string(),
                "alpha.search".to_string(),
                "trusted".to_string(),
                vec![Capability::PushEvents],
                "routine".to_string(),
                None,
            )
            .await;

        let frame = rx.recv().await.expect("result sent");
        assert_eq!(frame["payload"]["approved"], true);
    }

    #[tokio::test]
    async fn unresolved_elevate_auto_denies_after_timeout() {
        let (subsystem, mut rx) = subsystem_with_delegate().await;
        subsystem
            .request_scope_elevate(
                "req-1".to_string(),
                "user-1".to_string(),
                "alpha".to_string(),
                "alpha.search".to_string(),
                "conv-1".to_string(),
                "alpha.search".to_string(),
                "label".to_string(),
                vec![Capability::PushEvents],
                "reason".to_string(),
                Some(Duration::from_millis(20)),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let frame = rx.recv().await.expect("auto-deny result sent");
        assert_eq!(frame["payload"]["approved"], false);
    }

    #[tokio::test]
    async fn unresolved_change_auto_denies_after_timeout() {
        let (subsystem, mut rx) = subsystem_with_delegate().await;
        subsystem
            .request_scope_change(
                "req-1".to_string(),
                "user-1".to_string(),
                "alpha".to_string(),
                "alpha.new".to_string(),
                Some("conv-1".to_string()),
                Some("wss://example/mcp".to_string()),
                Some("new-server".to_string()),
                vec![Capability::PushEvents],
                "reason".to_string(),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        let frame = rx.recv().await.expect("auto-deny result sent");
        assert_eq!(frame["payload"]["approved"], false);
    }
}
