//! Session Manager (§4.2): MCPL-level identity that survives WebSocket
//! reconnects, plus the wildcard feature-set expansion delegates rely on.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use mcpl_channel::ChannelSnapshot;
use mcpl_types::Capability;
use mcpl_types::FeatureSet;
use mcpl_types::FeatureSetMap;
use tokio::sync::Mutex;
use uuid::Uuid;
use wildmatch::WildMatch;

/// MCPL-level session, addressed independently of the physical
/// connection that currently (if any) backs it.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub delegate_id: String,
    pub capabilities: HashSet<Capability>,
    pub feature_sets: FeatureSetMap,
    pub protocol_version: String,
    reliable_state: Option<ChannelSnapshot>,
}

impl Session {
    fn new(
        user_id: String,
        delegate_id: String,
        requested: &[Capability],
        protocol_version: String,
    ) -> Self {
        let capabilities = requested
            .iter()
            .copied()
            .filter(|c| Capability::ALL.contains(c))
            .collect();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            delegate_id,
            capabilities,
            feature_sets: FeatureSetMap::new(),
            protocol_version,
            reliable_state: None,
        }
    }
}

#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handles `mcpl/hello`: negotiates capabilities down to the server's
    /// fixed supported set and mints a new session id.
    pub async fn create_session(
        &self,
        user_id: String,
        delegate_id: String,
        requested_capabilities: &[Capability],
        protocol_version: String,
    ) -> Session {
        let session = Session::new(user_id, delegate_id, requested_capabilities, protocol_version);
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Returns the session only if `user_id` owns it; otherwise `None` so
    /// the caller falls back to creating a fresh session.
    pub async fn resume_session(&self, session_id: &str, user_id: &str) -> Option<Session> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .filter(|s| s.user_id == user_id)
            .cloned()
    }

    /// Replaces a session's feature-set map wholesale. Callers must have
    /// already expanded wildcards with [`expand_feature_sets`].
    pub async fn set_feature_sets(&self, session_id: &str, feature_sets: FeatureSetMap) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.feature_sets = feature_sets;
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Every live session owned by `user_id`, for fan-out operations
    /// (hook dispatch, feature-set-driven broadcasts) that must consider
    /// all of a user's delegates at once.
    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<Session> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn save_reliable_state(&self, session_id: &str, snapshot: ChannelSnapshot) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.reliable_state = Some(snapshot);
        }
    }

    pub async fn get_reliable_state(&self, session_id: &str) -> Option<ChannelSnapshot> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).and_then(|s| s.reliable_state.clone())
    }

    /// Explicit, user-initiated teardown. Sessions otherwise persist
    /// indefinitely so they can be resumed.
    pub async fn remove_session(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }
}

/// Expands `prefix.*` wildcard keys in `raw` against `server_ids`, so the
/// caller can hand [`SessionManager::set_feature_sets`] a map keyed purely
/// by concrete server id. A concrete key always wins over a wildcard match
/// for the same server id.
pub fn expand_feature_sets(raw: &FeatureSetMap, server_ids: &[String]) -> FeatureSetMap {
    let mut concrete: HashMap<&str, FeatureSet> = HashMap::new();
    let mut wildcards: Vec<(&str, FeatureSet)> = Vec::new();

    for (key, value) in raw {
        if key.contains('*') {
            wildcards.push((key.as_str(), *value));
        } else {
            concrete.insert(key.as_str(), *value);
        }
    }

    let mut expanded = FeatureSetMap::new();
    for server_id in server_ids {
        if let Some(value) = concrete.get(server_id.as_str()) {
            expanded.insert(server_id.clone(), *value);
            continue;
        }
        if let Some((_, value)) = wildcards
            .iter()
            .find(|(pattern, _)| WildMatch::new(pattern).matches(server_id))
        {
            expanded.insert(server_id.clone(), *value);
        }
    }
    // Concrete keys for server ids the delegate doesn't (yet) advertise are
    // kept verbatim: a reconnecting delegate may re-advertise the server
    // before the session is ever consulted again.
    for (key, value) in &concrete {
        expanded.entry((*key).to_string()).or_insert(*value);
    }
    expanded
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use maplit::hashmap;

    use super::*;

    #[tokio::test]
    async fn create_session_negotiates_capability_intersection() {
        let manager = SessionManager::new();
        let session = manager
            .create_session(
                "user-1".to_string(),
                "delegate-1".to_string(),
                &[Capability::ContextHooks, Capability::PushEvents],
                "1".to_string(),
            )
            .await;
        assert_eq!(session.capabilities.len(), 2);
        assert!(session.capabilities.contains(&Capability::ContextHooks));
    }

    #[tokio::test]
    async fn resume_session_requires_matching_owner() {
        let manager = SessionManager::new();
        let session = manager
            .create_session(
                "user-1".to_string(),
                "delegate-1".to_string(),
                &[],
                "1".to_string(),
            )
            .await;

        assert!(manager.resume_session(&session.id, "user-2").await.is_none());
        assert!(manager.resume_session(&session.id, "user-1").await.is_some());
    }

    #[test]
    fn wildcard_expansion_prefers_concrete_keys() {
        let raw = hashmap! {
            "search.*".to_string() => FeatureSet { push_events: true, ..Default::default() },
            "search.web".to_string() => FeatureSet { context_hooks: true, ..Default::default() },
        };
        let server_ids = vec!["search.web".to_string(), "search.images".to_string()];
        let expanded = expand_feature_sets(&raw, &server_ids);

        assert!(expanded["search.web"].context_hooks);
        assert!(!expanded["search.web"].push_events);
        assert!(expanded["search.images"].push_events);
    }
}
