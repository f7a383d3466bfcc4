//! State Manager (§4.8): per-conversation mutable state, RFC 6902 patch
//! mutation, a checkpoint tree with linear/tree modes, two-phase
//! rollback, eviction, tombstones, and startup replay.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use mcpl_types::JsonPatch;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

use crate::collaborators::RoomBroadcaster;
use crate::error::CoreError;
use crate::event_log::EventLog;
use crate::event_log::EventLogScope;
use crate::ui_event_log::ActiveBranchChanged;
use crate::ui_event_log::UiEventLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeMode {
    Linear,
    Tree,
}

#[derive(Debug, Clone)]
pub struct CheckpointNode {
    pub id: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub snapshot: Option<String>,
    pub created_at: u64,
    pub label: Option<String>,
    pub mutation_count: u64,
}

struct ConversationTree {
    nodes: HashMap<String, CheckpointNode>,
    current: Option<String>,
    next_seq: u64,
    tombstones: VecDeque<String>,
    host_managed: bool,
    mode: TreeMode,
    mutations_since_checkpoint: u64,
}

impl ConversationTree {
    fn new(host_managed: bool) -> Self {
        Self {
            nodes: HashMap::new(),
            current: None,
            next_seq: 0,
            tombstones: VecDeque::new(),
            host_managed,
            mode: TreeMode::Linear,
            mutations_since_checkpoint: 0,
        }
    }
}

struct ConversationState {
    value: Value,
    tree: ConversationTree,
}

/// Flexible envelope for every `checkpoint_tree_updated` entry written to
/// the owning user's event log, replayed on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointTreeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub conversation_id: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub created_at: Option<u64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub mutation_count: Option<u64>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackCheck {
    NoCheckpoints,
    Expired,
    Unknown,
    Exists { checkpoint_id: String },
}

#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub checkpoint_id: String,
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub created_at: u64,
    pub is_current: bool,
    pub label: Option<String>,
    pub mutation_count: u64,
}

pub struct StateManagerConfig {
    pub max_nodes: usize,
    pub max_tombstones: usize,
    pub max_state_bytes: usize,
    pub checkpoint_interval: u64,
}

pub struct StateManager {
    conversations: RwLock<HashMap<String, Arc<Mutex<ConversationState>>>>,
    config: StateManagerConfig,
    event_log: Arc<EventLog>,
    broadcaster: Arc<dyn RoomBroadcaster>,
    ui_events: Arc<UiEventLog>,
}

impl StateManager {
    pub fn new(config: StateManagerConfig, event_log: Arc<EventLog>, broadcaster: Arc<dyn RoomBroadcaster>, ui_events: Arc<UiEventLog>) -> Arc<Self> {
        Arc::new(Self {
            conversations: RwLock::new(HashMap::new()),
            config,
            event_log,
            broadcaster,
            ui_events,
        })
    }

    /// Records the conversation's "current" checkpoint node moving to `branch_id`
    /// as an `active_branch_changed` entry (§6 "Persisted state"): the
    /// checkpoint tree is this runtime's only notion of a conversation
    /// having more than one live branch, so every `current`-node change —
    /// a new checkpoint, a rollback — is exactly an active-branch change.
    async fn record_active_branch(&self, conversation_id: &str, branch_id: &str, timestamp: u64) {
        self.ui_events
            .record(
                conversation_id,
                ActiveBranchChanged {
                    message_id: conversation_id.to_string(),
                    branch_id: branch_id.to_string(),
                    timestamp,
                },
            )
            .await;
    }

    pub async fn get_state(&self, conversation_id: &str) -> Option<Value> {
        let state = self.conversation_or_create(conversation_id).await;
        let locked = state.lock().await;
        Some(locked.value.clone())
    }

    pub async fn set_state(&self, user_id: &str, conversation_id: &str, value: Value) {
        let state = self.conversation_or_create(conversation_id).await;
        let mut locked = state.lock().await;
        locked.value = value;
        self.bump_and_maybe_checkpoint(user_id, conversation_id, &mut locked).await;
    }

    /// Applies `patch` in place. On failure (including a `test` op that
    /// doesn't hold) the state is left unchanged and the mutation does not
    /// count toward the checkpoint interval.
    pub async fn apply_patch(
        &self,
        user_id: &str,
        conversation_id: &str,
        patch: &JsonPatch,
    ) -> Result<(), CoreError> {
        let state = self.conversation_or_create(conversation_id).await;
        let mut locked = state.lock().await;
        let mut candidate = locked.value.clone();
        json_patch::patch(&mut candidate, patch).map_err(|error| CoreError::InvalidPatch(error.to_string()))?;
        locked.value = candidate;
        self.bump_and_maybe_checkpoint(user_id, conversation_id, &mut locked).await;
        Ok(())
    }

    async fn bump_and_maybe_checkpoint(&self, user_id: &str, conversation_id: &str, locked: &mut ConversationState) {
        locked.tree.mutations_since_checkpoint += 1;
        if locked.tree.mutations_since_checkpoint % self.config.checkpoint_interval == 0 {
            self.create_checkpoint(user_id, conversation_id, locked, None).await;
        }
    }

    async fn create_checkpoint(
        &self,
        user_id: &str,
        conversation_id: &str,
        locked: &mut ConversationState,
        label: Option<String>,
    ) {
        let snapshot = if locked.tree.host_managed {
            let serialized = match serde_json::to_string(&locked.value) {
                Ok(s) => s,
                Err(error) => {
                    tracing::warn!(%error, "failed to serialize conversation state for checkpoint");
                    return;
                }
            };
            if serialized.len() > self.config.max_state_bytes {
                tracing::warn!(conversation_id, size = serialized.len(), "state too large to checkpoint, skipping");
                return;
            }
            Some(serialized)
        } else {
            None
        };

        locked.tree.next_seq += 1;
        let id = format!("chk_{}", locked.tree.next_seq);
        let parent = locked.tree.current.clone();
        let created_at = Utc::now().timestamp_millis().max(0) as u64;
        let node = CheckpointNode {
            id: id.clone(),
            parent: parent.clone(),
            children: Vec::new(),
            snapshot: snapshot.clone(),
            created_at,
            label: label.clone(),
            mutation_count: locked.tree.mutations_since_checkpoint,
        };
        if let Some(parent_id) = &parent
            && let Some(parent_node) = locked.tree.nodes.get_mut(parent_id)
        {
            parent_node.children.push(id.clone());
        }
        locked.tree.nodes.insert(id.clone(), node);
        locked.tree.current = Some(id.clone());
        self.record_active_branch(conversation_id, &id, created_at).await;

        self.evict(&mut locked.tree);

        self.event_log
            .append(
                &EventLogScope::User(user_id.to_string()),
                &CheckpointTreeEvent {
                    kind: "checkpoint_tree_updated".to_string(),
                    action: "checkpoint".to_string(),
                    conversation_id: conversation_id.to_string(),
                    id: Some(id.clone()),
                    parent,
                    created_at: Some(created_at),
                    label,
                    mutation_count: Some(locked.tree.mutations_since_checkpoint),
                    state: snapshot,
                    checkpoint_id: None,
                },
            )
            .await;
        self.broadcaster
            .broadcast(
                user_id,
                serde_json::json!({"type": "checkpoint_tree_updated", "action": "checkpoint", "conversationId": conversation_id, "checkpointId": id}),
            )
            .await;
    }

    /// Two-phase rollback, phase one: resolves whether `checkpoint_id`
    /// (or, if absent, the parent of `current`) can be rolled back to,
    /// without mutating anything except — when an explicit id is given —
    /// the one-way linear-to-tree mode upgrade.
    pub async fn can_rollback(&self, user_id: &str, conversation_id: &str, checkpoint_id: Option<&str>) -> RollbackCheck {
        let state = self.existing_conversation(conversation_id).await;
        let Some(state) = state else { return RollbackCheck::NoCheckpoints };
        let mut locked = state.lock().await;
        if locked.tree.nodes.is_empty() {
            return RollbackCheck::NoCheckpoints;
        }

        if checkpoint_id.is_some() && locked.tree.mode == TreeMode::Linear {
            locked.tree.mode = TreeMode::Tree;
            self.persist_mode_upgrade(user_id, conversation_id).await;
        }

        let target = match checkpoint_id {
            Some(id) => id.to_string(),
            None => match locked.tree.current.as_ref().and_then(|cur| locked.tree.nodes.get(cur)).and_then(|n| n.parent.clone()) {
                Some(parent) => parent,
                None => return RollbackCheck::NoCheckpoints,
            },
        };

        match locked.tree.nodes.get(&target) {
            None => {
                if locked.tree.tombstones.iter().any(|t| t == &target) {
                    RollbackCheck::Expired
                } else {
                    RollbackCheck::Unknown
                }
            }
            Some(node) => {
                if locked.tree.host_managed && node.snapshot.is_none() {
                    RollbackCheck::Expired
                } else {
                    RollbackCheck::Exists { checkpoint_id: target }
                }
            }
        }
    }

    async fn persist_mode_upgrade(&self, user_id: &str, conversation_id: &str) {
        self.event_log
            .append(
                &EventLogScope::User(user_id.to_string()),
                &CheckpointTreeEvent {
                    kind: "checkpoint_tree_updated".to_string(),
                    action: "mode_upgrade".to_string(),
                    conversation_id: conversation_id.to_string(),
                    id: None,
                    parent: None,
                    created_at: None,
                    label: None,
                    mutation_count: None,
                    state: None,
                    checkpoint_id: None,
                },
            )
            .await;
    }

    /// Phase two: commits a rollback resolved by [`Self::can_rollback`].
    /// Resets the mutation counter so the checkpoint cadence restarts
    /// from the restored point.
    pub async fn commit_rollback(
        &self,
        user_id: &str,
        conversation_id: &str,
        checkpoint_id: &str,
    ) -> Result<RollbackOutcome, CoreError> {
        let state = self.conversation_or_create(conversation_id).await;
        let mut locked = state.lock().await;
        if locked.tree.nodes.is_empty() {
            return Err(CoreError::RollbackFailed);
        }
        let Some(node) = locked.tree.nodes.get(checkpoint_id).cloned() else {
            return Err(CoreError::CheckpointExpired(checkpoint_id.to_string()));
        };

        let restored = if locked.tree.host_managed {
            match &node.snapshot {
                None => return Err(CoreError::CheckpointExpired(checkpoint_id.to_string())),
                Some(snapshot) => match serde_json::from_str::<Value>(snapshot) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        self.remove_node(&mut locked.tree, checkpoint_id);
                        return Err(CoreError::RollbackFailed);
                    }
                },
            }
        } else {
            None
        };

        if let Some(value) = &restored {
            locked.value = value.clone();
        }
        locked.tree.current = Some(checkpoint_id.to_string());
        locked.tree.mutations_since_checkpoint = 0;
        self.record_active_branch(conversation_id, checkpoint_id, Utc::now().timestamp_millis().max(0) as u64).await;

        self.event_log
            .append(
                &EventLogScope::User(user_id.to_string()),
                &CheckpointTreeEvent {
                    kind: "checkpoint_tree_updated".to_string(),
                    action: "rollback".to_string(),
                    conversation_id: conversation_id.to_string(),
                    id: None,
                    parent: None,
                    created_at: None,
                    label: None,
                    mutation_count: None,
                    state: None,
                    checkpoint_id: Some(checkpoint_id.to_string()),
                },
            )
            .await;
        self.broadcaster
            .broadcast(
                user_id,
                serde_json::json!({"type": "checkpoint_tree_updated", "action": "rollback", "conversationId": conversation_id, "checkpointId": checkpoint_id}),
            )
            .await;

        Ok(RollbackOutcome {
            checkpoint_id: checkpoint_id.to_string(),
            state: restored,
        })
    }

    /// `rollback()` with no explicit target: resolves to the parent of
    /// `current` and, unlike [`Self::can_rollback`] with an id, never
    /// upgrades linear mode to tree.
    pub async fn rollback_to_parent(&self, user_id: &str, conversation_id: &str) -> Result<RollbackOutcome, CoreError> {
        let state = self.conversation_or_create(conversation_id).await;
        let target = {
            let locked = state.lock().await;
            locked
                .tree
                .current
                .as_ref()
                .and_then(|cur| locked.tree.nodes.get(cur))
                .and_then(|n| n.parent.clone())
        };
        match target {
            Some(target) => self.commit_rollback(user_id, conversation_id, &target).await,
            None => Err(CoreError::RollbackFailed),
        }
    }

    pub async fn get_checkpoints(&self, conversation_id: &str) -> (Option<String>, Vec<CheckpointSummary>) {
        let Some(state) = self.existing_conversation(conversation_id).await else {
            return (None, Vec::new());
        };
        let locked = state.lock().await;
        let current = locked.tree.current.clone();
        let summaries = locked
            .tree
            .nodes
            .values()
            .map(|n| CheckpointSummary {
                id: n.id.clone(),
                parent: n.parent.clone(),
                children: n.children.clone(),
                created_at: n.created_at,
                is_current: Some(&n.id) == current.as_ref(),
                label: n.label.clone(),
                mutation_count: n.mutation_count,
            })
            .collect();
        (current, summaries)
    }

    /// Linear mode: walks `current` -> root; while the chain exceeds
    /// `max_nodes`, the oldest ancestor is dropped outright and its
    /// children reparented to `None`; no tombstones.
    ///
    /// Tree mode: repeatedly evicts the oldest leaf not on the active
    /// branch (root -> current), tombstoning it (dropping the oldest
    /// tombstone once the cap is hit), until no off-branch leaf remains
    /// — even if the tree is still over `max_nodes`.
    fn evict(&self, tree: &mut ConversationTree) {
        match tree.mode {
            TreeMode::Linear => self.evict_linear(tree),
            TreeMode::Tree => self.evict_tree(tree),
        }
    }

    fn evict_linear(&self, tree: &mut ConversationTree) {
        let mut chain = Vec::new();
        let mut cursor = tree.current.clone();
        while let Some(id) = cursor {
            let Some(node) = tree.nodes.get(&id) else { break };
            cursor = node.parent.clone();
            chain.push(id);
        }
        while chain.len() > self.config.max_nodes {
            let Some(oldest) = chain.pop() else { break };
            let children: Vec<String> = tree.nodes.get(&oldest).map(|n| n.children.clone()).unwrap_or_default();
            for child_id in children {
                if let Some(child) = tree.nodes.get_mut(&child_id) {
                    child.parent = None;
                }
            }
            tree.nodes.remove(&oldest);
        }
    }

    fn evict_tree(&self, tree: &mut ConversationTree) {
        loop {
            let active_branch = self.active_branch(tree);
            let oldest_off_branch_leaf = tree
                .nodes
                .values()
                .filter(|n| n.children.is_empty() && !active_branch.contains(&n.id))
                .min_by_key(|n| n.created_at)
                .map(|n| n.id.clone());

            let Some(leaf_id) = oldest_off_branch_leaf else { break };
            if let Some(node) = tree.nodes.remove(&leaf_id)
                && let Some(parent_id) = &node.parent
                && let Some(parent) = tree.nodes.get_mut(parent_id)
            {
                parent.children.retain(|c| c != &leaf_id);
            }
            tree.tombstones.push_back(leaf_id);
            if tree.tombstones.len() > self.config.max_tombstones {
                tree.tombstones.pop_front();
            }
        }
    }

    fn active_branch(&self, tree: &ConversationTree) -> std::collections::HashSet<String> {
        let mut branch = std::collections::HashSet::new();
        let mut cursor = tree.current.clone();
        while let Some(id) = cursor {
            let Some(node) = tree.nodes.get(&id) else { break };
            branch.insert(id.clone());
            cursor = node.parent.clone();
        }
        branch
    }

    fn remove_node(&self, tree: &mut ConversationTree, id: &str) {
        if let Some(node) = tree.nodes.remove(id)
            && let Some(parent_id) = &node.parent
            && let Some(parent) = tree.nodes.get_mut(parent_id)
        {
            parent.children.retain(|c| c != id);
        }
    }

    /// Replays every `checkpoint_tree_updated` entry from `user_id`'s
    /// event log, reconstructing each referenced conversation's tree and
    /// restoring its latest live (host-managed) state. Run once at
    /// startup before any live traffic for that user is accepted.
    pub async fn replay_user(&self, user_id: &str) {
        let events: Vec<CheckpointTreeEvent> = self
            .event_log
            .replay(&EventLogScope::User(user_id.to_string()))
            .await
            .unwrap_or_default();

        for event in events {
            if event.kind != "checkpoint_tree_updated" {
                continue;
            }
            let state = self.conversation_or_create(&event.conversation_id).await;
            let mut locked = state.lock().await;
            match event.action.as_str() {
                "checkpoint" => {
                    let Some(id) = event.id else { continue };
                    let created_at = event.created_at.unwrap_or(0);
                    if let Some(parent_id) = &event.parent
                        && let Some(parent) = locked.tree.nodes.get_mut(parent_id)
                    {
                        parent.children.push(id.clone());
                    }
                    if let Some(seq) = id.strip_prefix("chk_").and_then(|n| n.parse::<u64>().ok()) {
                        locked.tree.next_seq = locked.tree.next_seq.max(seq);
                    }
                    locked.tree.nodes.insert(
                        id.clone(),
                        CheckpointNode {
                            id: id.clone(),
                            parent: event.parent,
                            children: Vec::new(),
                            snapshot: event.state.clone(),
                            created_at,
                            label: event.label,
                            mutation_count: event.mutation_count.unwrap_or(0),
                        },
                    );
                    locked.tree.current = Some(id);
                    if let Some(snapshot) = event.state
                        && let Ok(value) = serde_json::from_str(&snapshot)
                    {
                        locked.value = value;
                    }
                }
                "rollback" => {
                    let Some(target) = event.checkpoint_id else { continue };
                    if locked.tree.nodes.contains_key(&target) {
                        locked.tree.current = Some(target.clone());
                        locked.tree.mutations_since_checkpoint = 0;
                        if let Some(node) = locked.tree.nodes.get(&target)
                            && let Some(snapshot) = &node.snapshot
                            && let Ok(value) = serde_json::from_str(snapshot)
                        {
                            locked.value = value;
                        }
                    } else {
                        tracing::warn!(conversation_id = %event.conversation_id, target, "replay: rollback to unknown checkpoint, skipping");
                    }
                }
                "mode_upgrade" => {
                    locked.tree.mode = TreeMode::Tree;
                }
                other => {
                    tracing::warn!(action = other, "replay: unknown checkpoint_tree_updated action");
                }
            }
        }

        let conversations = self.conversations.read().await;
        for state in conversations.values() {
            let mut locked = state.lock().await;
            self.evict(&mut locked.tree);
        }
    }

    async fn existing_conversation(&self, conversation_id: &str) -> Option<Arc<Mutex<ConversationState>>> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    async fn conversation_or_create(&self, conversation_id: &str) -> Arc<Mutex<ConversationState>> {
        if let Some(existing) = self.existing_conversation(conversation_id).await {
            return existing;
        }
        self.conversations
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ConversationState {
                    value: Value::Null,
                    tree: ConversationTree::new(true),
                }))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use crate::collaborators::test_support::RecordingBroadcaster;

    fn manager() -> Arc<StateManager> {
        manager_with_ui_dir().0
    }

    fn manager_with_ui_dir() -> (Arc<StateManager>, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ui_dir = tempfile::tempdir().expect("tempdir").into_path();
        let manager = StateManager::new(
            StateManagerConfig {
                max_nodes: 50,
                max_tombstones: 200,
                max_state_bytes: 256 * 1024,
                checkpoint_interval: 10,
            },
            Arc::new(EventLog::new(dir.into_path())),
            Arc::new(RecordingBroadcaster::default()),
            UiEventLog::new(ui_dir.clone()),
        );
        (manager, ui_dir)
    }

    #[tokio::test]
    async fn no_checkpoints_until_interval_reached() {
        let manager = manager();
        for _ in 0..9 {
            manager.set_state("user-1", "conv-1", serde_json::json!({"n": 1})).await;
        }
        assert_eq!(manager.can_rollback("user-1", "conv-1", None).await, RollbackCheck::NoCheckpoints);

        manager.set_state("user-1", "conv-1", serde_json::json!({"n": 10})).await;
        let (current, checkpoints) = manager.get_checkpoints("conv-1").await;
        assert_eq!(current.as_deref(), Some("chk_1"));
        assert_eq!(checkpoints.len(), 1);
    }

    #[tokio::test]
    async fn rollback_without_target_restores_parent_and_stays_linear() {
        let manager = manager();
        for i in 0..20 {
            manager.set_state("user-1", "conv-1", serde_json::json!({"n": i})).await;
        }
        let (current, checkpoints) = manager.get_checkpoints("conv-1").await;
        assert_eq!(current.as_deref(), Some("chk_2"));
        assert_eq!(checkpoints.len(), 2);

        let outcome = manager.rollback_to_parent("user-1", "conv-1").await.expect("rollback succeeds");
        assert_eq!(outcome.checkpoint_id, "chk_1");
        assert_eq!(manager.get_state("conv-1").await, outcome.state);

        let (current_after, _) = manager.get_checkpoints("conv-1").await;
        assert_eq!(current_after.as_deref(), Some("chk_1"));
    }

    #[tokio::test]
    async fn named_rollback_upgrades_to_tree_mode() {
        let manager = manager();
        for i in 0..20 {
            manager.set_state("user-1", "conv-1", serde_json::json!({"n": i})).await;
        }
        manager.rollback_to_parent("user-1", "conv-1").await.expect("rollback succeeds");
        for i in 0..10 {
            manager.set_state("user-1", "conv-1", serde_json::json!({"n": 100 + i})).await;
        }

        let check = manager.can_rollback("user-1", "conv-1", Some("chk_2")).await;
        assert_eq!(check, RollbackCheck::Exists { checkpoint_id: "chk_2".to_string() });

        let outcome = manager.commit_rollback("user-1", "conv-1", "chk_2").await.expect("commit succeeds");
        assert_eq!(outcome.checkpoint_id, "chk_2");
    }

    #[tokio::test]
    async fn unknown_checkpoint_is_not_expired() {
        let manager = manager();
        manager.set_state("user-1", "conv-1", serde_json::json!({})).await;
        let check = manager.can_rollback("user-1", "conv-1", Some("chk_999")).await;
        assert_eq!(check, RollbackCheck::Unknown);
    }

    #[tokio::test]
    async fn checkpoint_and_rollback_record_active_branch_changes() {
        let (manager, ui_dir) = manager_with_ui_dir();
        for i in 0..20 {
            manager.set_state("user-1", "conv-1", serde_json::json!({"n": i})).await;
        }
        let ui_log = UiEventLog::new(ui_dir);
        let shard = ui_log.shard_path("conv-1");
        let contents = tokio::fs::read_to_string(&shard).await.expect("ui event shard written on checkpoint");
        assert!(contents.contains("chk_1"));
        assert!(contents.contains("chk_2"));

        manager.rollback_to_parent("user-1", "conv-1").await.expect("rollback succeeds");
        let contents = tokio::fs::read_to_string(&shard).await.expect("ui event shard written on rollback");
        let entries: Vec<ActiveBranchChanged> = contents.lines().map(|line| serde_json::from_str(line).expect("valid entry")).collect();
        let last = entries.last().expect("at least one entry");
        assert_eq!(last.branch_id, "chk_1");
        assert_eq!(last.message_id, "conv-1");
    }

    #[tokio::test]
    async fn patch_failure_leaves_state_untouched() {
        let manager = manager();
        manager.set_state("user-1", "conv-1", serde_json::json!({"a": 1})).await;
        let patch: JsonPatch = serde_json::from_value(serde_json::json!([
            {"op": "test", "path": "/a", "value": 2}
        ]))
        .expect("valid patch document");

        let result = manager.apply_patch("user-1", "conv-1", &patch).await;
        assert!(result.is_err());
        assert_eq!(manager.get_state("conv-1").await, Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn linear_eviction_reparents_oldest_ancestor_children() {
        let manager = manager();
        for i in 0..(55 * 10) {
            manager.set_state("user-1", "conv-1", serde_json::json!({"n": i})).await;
        }
        let (_, checkpoints) = manager.get_checkpoints("conv-1").await;
        assert!(checkpoints.len() <= 50);
    }
}
