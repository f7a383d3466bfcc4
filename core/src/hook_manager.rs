//! Hook Manager (§4.5): `beforeInference` fan-out with a per-server
//! timeout, deterministic (serverId-sorted) ordering, a per-server rate
//! limit, a sync-depth guard, and fire-and-forget `afterInference` notify.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use mcpl_types::Capability;
use mcpl_types::HostToDelegate;
use mcpl_types::delegate_to_host::HookInjection;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::delegate_manager::DelegateManager;
use crate::session::SessionManager;

/// Every server (`delegate_id`, `server_id`) pair currently eligible to
/// receive `beforeInference`/`afterInference` for one user.
struct HookTarget {
    delegate_id: String,
    server_id: String,
}

pub struct HookManager {
    sessions: Arc<SessionManager>,
    delegates: Arc<DelegateManager>,
    pending: Mutex<HashMap<String, oneshot::Sender<Vec<HookInjection>>>>,
    rate_window: Mutex<HashMap<String, Vec<Instant>>>,
    timeout: Duration,
    rate_limit_per_minute: u32,
}

impl HookManager {
    pub fn new(
        sessions: Arc<SessionManager>,
        delegates: Arc<DelegateManager>,
        timeout: Duration,
        rate_limit_per_minute: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            delegates,
            pending: Mutex::new(HashMap::new()),
            rate_window: Mutex::new(HashMap::new()),
            timeout,
            rate_limit_per_minute,
        })
    }

    /// `depth` counts nested `beforeInference` calls triggered by an
    /// inference that was itself the result of a hook injection; at
    /// `depth >= 3` hooks never fire, so a misbehaving hook can't recurse
    /// the chain indefinitely. Hooks never block or fail an inference: a
    /// timed-out or unreachable server simply contributes nothing.
    pub async fn before_inference(
        &self,
        user_id: &str,
        conversation_id: &str,
        summary: Option<String>,
        depth: u32,
    ) -> Vec<HookInjection> {
        if depth >= 3 {
            return Vec::new();
        }

        let targets = self.hook_targets(user_id).await;
        let mut allowed = Vec::with_capacity(targets.len());
        for target in targets {
            if self.check_rate_limit(&target.server_id).await {
                allowed.push(target);
            } else {
                tracing::warn!(server_id = %target.server_id, "beforeInference server over rate limit, skipping");
            }
        }

        let mut join_set = JoinSet::new();
        for target in allowed {
            let delegates = self.delegates.clone();
            let pending = self.pending_for(&target.server_id).await;
            let user_id = user_id.to_string();
            let conversation_id = conversation_id.to_string();
            let summary = summary.clone();
            let timeout = self.timeout;
            let delegate_id = target.delegate_id.clone();
            let server_id = target.server_id.clone();
            join_set.spawn(async move {
                let request_id = pending.0;
                let rx = pending.1;
                let message = HostToDelegate::BeforeInference {
                    request_id,
                    conversation_id,
                    messages_summary: summary,
                };
                let Some(channel) = delegates.channel_for(&user_id, &delegate_id).await else {
                    return Vec::new();
                };
                let Ok(payload) = serde_json::to_value(&message) else {
                    return Vec::new();
                };
                if channel.send(payload).await.is_err() {
                    return Vec::new();
                }
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(injections)) => injections,
                    _ => {
                        tracing::warn!(server_id, "beforeInference timed out or server closed");
                        Vec::new()
                    }
                }
            });
        }

        let mut all = Vec::new();
        while let Some(result) = join_set.join_next().await {
            all.extend(result.unwrap_or_default());
        }
        // Determinism contract (§4.5, §8): output order depends only on
        // the set of servers and their replies, never reply arrival order.
        all.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        all
    }

    /// Fire-and-forget: notifies every hook-capable server but does not
    /// wait for (or even register a correlation for) a reply.
    pub async fn after_inference(&self, user_id: &str, conversation_id: &str, summary: Option<String>) {
        for target in self.hook_targets(user_id).await {
            let Some(channel) = self.delegates.channel_for(user_id, &target.delegate_id).await else {
                continue;
            };
            let message = HostToDelegate::AfterInference {
                request_id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                messages_summary: summary.clone(),
            };
            if let Ok(payload) = serde_json::to_value(&message) {
                let _ = channel.send(payload).await;
            }
        }
    }

    /// Resolves a pending `beforeInference` request on receipt of
    /// `mcpl/beforeInference_response`. A response with no matching
    /// pending entry (already timed out) is dropped silently.
    pub async fn complete(&self, request_id: &str, injections: Vec<HookInjection>) {
        if let Some(sender) = self.pending.lock().await.remove(request_id) {
            let _ = sender.send(injections);
        }
    }

    async fn pending_for(&self, _server_id: &str) -> (String, oneshot::Receiver<Vec<HookInjection>>) {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        (request_id, rx)
    }

    async fn hook_targets(&self, user_id: &str) -> Vec<HookTarget> {
        let mut targets = Vec::new();
        for session in self.sessions.sessions_for_user(user_id).await {
            if !session.capabilities.contains(&Capability::ContextHooks) {
                continue;
            }
            for (server_id, feature_set) in &session.feature_sets {
                if feature_set.context_hooks {
                    targets.push(HookTarget {
                        delegate_id: session.delegate_id.clone(),
                        server_id: server_id.clone(),
                    });
                }
            }
        }
        targets
    }

    /// Prunes timestamps older than one minute, then admits the call if
    /// still under quota for `server_id`.
    async fn check_rate_limit(&self, server_id: &str) -> bool {
        let mut window = self.rate_window.lock().await;
        let now = Instant::now();
        let entry = window.entry(server_id.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < Duration::from_secs(60));
        if entry.len() as u32 >= self.rate_limit_per_minute {
            return false;
        }
        entry.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use std::sync::Arc;

    use mcpl_channel::ReliableChannel;
    use mcpl_types::FeatureSet;
    use mcpl_types::FeatureSetMap;
    use tokio::sync::mpsc;

    use super::*;
    use crate::collaborators::test_support::RecordingBroadcaster;
    use crate::delegate_manager::ConnectedDelegate;

    #[tokio::test]
    async fn depth_guard_returns_empty_without_dispatch() {
        let sessions = SessionManager::new();
        let delegates = DelegateManager::new(Arc::new(RecordingBroadcaster::default()));
        let hooks = HookManager::new(sessions, delegates, Duration::from_millis(50), 10);
        let injections = hooks.before_inference("user-1", "conv-1", None, 3).await;
        assert!(injections.is_empty());
    }

    #[tokio::test]
    async fn aggregates_and_sorts_by_server_id() {
        let sessions = SessionManager::new();
        let delegates = DelegateManager::new(Arc::new(RecordingBroadcaster::default()));

        let session = sessions
            .create_session(
                "user-1".to_string(),
                "alpha".to_string(),
                &[Capability::ContextHooks],
                "1".to_string(),
            )
            .await;
        let mut feature_sets = FeatureSetMap::new();
        feature_sets.insert(
            "alpha.zeta".to_string(),
            FeatureSet {
                context_hooks: true,
                ..Default::default()
            },
        );
        feature_sets.insert(
            "alpha.alpha-server".to_string(),
            FeatureSet {
                context_hooks: true,
                ..Default::default()
            },
        );
        sessions.set_feature_sets(&session.id, feature_sets).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = ReliableChannel::new(tx);
        delegates
            .register(ConnectedDelegate {
                user_id: "user-1".to_string(),
                delegate_id: "alpha".to_string(),
                session_id: session.id.clone(),
                channel,
                tool_count: 0,
            })
            .await;

        let hooks = HookManager::new(sessions, delegates.clone(), Duration::from_secs(1), 10);
        let hooks_clone = hooks.clone();
        let call = tokio::spawn(async move { hooks_clone.before_inference("user-1", "conv-1", None, 0).await });

        // Two beforeInference frames go out, one per server. Respond to
        // each out of order, assigning the "later" server's injection to
        // the first request completed, to exercise the final sort.
        let server_ids = ["alpha.zeta", "alpha.alpha-server"];
        for server_id in server_ids {
            let frame = rx.recv().await.expect("frame sent");
            let payload = frame["payload"].clone();
            let request_id = payload["requestId"].as_str().expect("requestId").to_string();
            hooks
                .complete(
                    &request_id,
                    vec![HookInjection {
                        server_id: server_id.to_string(),
                        position: mcpl_types::delegate_to_host::InjectionPosition::System,
                        content: format!("from {server_id}"),
                    }],
                )
                .await;
        }

        let injections = call.await.expect("join");
        assert_eq!(injections.len(), 2);
        assert_eq!(injections[0].server_id, "alpha.alpha-server");
        assert_eq!(injections[1].server_id, "alpha.zeta");
    }
}
