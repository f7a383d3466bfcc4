//! Event Queue (§4.6): one strict-FIFO, single-in-flight queue of push
//! events per conversation, with idempotency dedup and a global hourly
//! rate limit on successfully processed events.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::collaborators::RoomBroadcaster;
use crate::event_log::EventLog;
use crate::event_log::EventLogScope;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const CLEANUP_AFTER: Duration = Duration::from_secs(5 * 60);
const FALLBACK_KEY_BUCKET: Duration = Duration::from_secs(5 * 60);

/// Runs one push event to completion: builds a user message from its
/// payload and drives an inference over it. Implemented by the embedder.
pub trait PushEventHandler: Send + Sync {
    fn handle<'a>(&'a self, entry: &'a PushEventEntry) -> BoxFuture<'a, Result<String, String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushEventStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    RateLimited,
    DuplicateIgnored,
}

impl PushEventStatus {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            PushEventStatus::Completed
                | PushEventStatus::Failed
                | PushEventStatus::RateLimited
                | PushEventStatus::DuplicateIgnored
        )
    }
}

#[derive(Debug, Clone)]
pub struct IncomingPushEvent {
    pub id: String,
    pub source: String,
    pub conversation_id: String,
    pub event_type: String,
    pub payload: Value,
    pub system_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub timestamp: u64,
    pub delegate_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushEventEntry {
    pub id: String,
    pub source: String,
    pub conversation_id: String,
    pub event_type: String,
    pub payload: Value,
    pub system_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub timestamp: u64,
    pub delegate_id: String,
    pub user_id: String,
    pub status: PushEventStatus,
    pub error: Option<String>,
    #[serde(skip)]
    terminal_at: Option<Instant>,
}

struct ConversationState {
    order: VecDeque<String>,
    entries: HashMap<String, PushEventEntry>,
    paused: bool,
    in_flight: bool,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            paused: false,
            in_flight: false,
        }
    }
}

pub struct EventQueueConfig {
    pub max_pushes_per_hour: u32,
    pub idempotency_window: Duration,
    pub max_queue_size: usize,
}

pub struct EventQueue {
    conversations: Mutex<HashMap<String, Arc<Mutex<ConversationState>>>>,
    idempotency_seen: Mutex<HashMap<String, Instant>>,
    processed_timestamps: Mutex<Vec<Instant>>,
    config: EventQueueConfig,
    event_log: Arc<EventLog>,
    broadcaster: Arc<dyn RoomBroadcaster>,
    handler: Arc<dyn PushEventHandler>,
}

impl EventQueue {
    pub fn new(
        config: EventQueueConfig,
        event_log: Arc<EventLog>,
        broadcaster: Arc<dyn RoomBroadcaster>,
        handler: Arc<dyn PushEventHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conversations: Mutex::new(HashMap::new()),
            idempotency_seen: Mutex::new(HashMap::new()),
            processed_timestamps: Mutex::new(Vec::new()),
            config,
            event_log,
            broadcaster,
            handler,
        })
    }

    pub async fn push(self: &Arc<Self>, event: IncomingPushEvent) -> PushEventEntry {
        let effective_key = event
            .idempotency_key
            .clone()
            .unwrap_or_else(|| fallback_key(&event.event_type, &event.payload, event.timestamp));

        let now = Instant::now();
        {
            let mut seen = self.idempotency_seen.lock().await;
            seen.retain(|_, expiry| *expiry > now);
            if seen.contains_key(&effective_key) {
                return self
                    .record_terminal(&event, PushEventStatus::DuplicateIgnored, None)
                    .await;
            }
        }

        {
            let mut timestamps = self.processed_timestamps.lock().await;
            timestamps.retain(|t| now.duration_since(*t) < Duration::from_secs(60 * 60));
            if timestamps.len() as u32 >= self.config.max_pushes_per_hour {
                let entry = self
                    .record_terminal(&event, PushEventStatus::RateLimited, None)
                    .await;
                self.event_log
                    .append(
                        &EventLogScope::Conversation(event.conversation_id.clone()),
                        &serde_json::json!({"type": "push_event_rate_limited", "eventId": event.id}),
                    )
                    .await;
                return entry;
            }
        }

        let state = self.conversation_state(&event.conversation_id).await;
        {
            let locked = state.lock().await;
            if locked.order.len() >= self.config.max_queue_size {
                drop(locked);
                return self
                    .record_terminal(&event, PushEventStatus::RateLimited, Some("Queue full".to_string()))
                    .await;
            }
        }

        self.idempotency_seen
            .lock()
            .await
            .insert(effective_key, now + self.config.idempotency_window);

        let entry = PushEventEntry {
            id: event.id.clone(),
            source: event.source.clone(),
            conversation_id: event.conversation_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            system_message: event.system_message.clone(),
            idempotency_key: event.idempotency_key.clone(),
            timestamp: event.timestamp,
            delegate_id: event.delegate_id.clone(),
            user_id: event.user_id.clone(),
            status: PushEventStatus::Queued,
            error: None,
            terminal_at: None,
        };

        {
            let mut locked = state.lock().await;
            locked.order.push_back(entry.id.clone());
            locked.entries.insert(entry.id.clone(), entry.clone());
        }

        self.event_log
            .append(
                &EventLogScope::Conversation(event.conversation_id.clone()),
                &serde_json::json!({"type": "push_event_received", "eventId": entry.id}),
            )
            .await;
        self.broadcast_queue_update(&entry).await;

        let should_start = {
            let locked = state.lock().await;
            !locked.paused && !locked.in_flight
        };
        if should_start {
            self.schedule_processing(event.conversation_id.clone());
        }

        entry
    }

    pub async fn pause(&self, conversation_id: &str) {
        let state = self.conversation_state(conversation_id).await;
        state.lock().await.paused = true;
    }

    pub async fn resume(self: &Arc<Self>, conversation_id: &str) {
        let should_start = {
            let state = self.conversation_state(conversation_id).await;
            let mut locked = state.lock().await;
            locked.paused = false;
            !locked.in_flight && !locked.order.is_empty()
        };
        if should_start {
            self.schedule_processing(conversation_id.to_string());
        }
    }

    pub async fn status_of(&self, conversation_id: &str, event_id: &str) -> Option<PushEventEntry> {
        let state = self.conversation_state(conversation_id).await;
        state.lock().await.entries.get(event_id).cloned()
    }

    fn schedule_processing(self: &Arc<Self>, conversation_id: String) {
        let queue = self.clone();
        tokio::spawn(async move { queue.process_tick(&conversation_id).await });
    }

    async fn process_tick(self: &Arc<Self>, conversation_id: &str) {
        let state = self.conversation_state(conversation_id).await;

        let next_id = {
            let mut locked = state.lock().await;
            if locked.in_flight || locked.paused {
                return;
            }
            match locked.order.pop_front() {
                Some(id) => {
                    locked.in_flight = true;
                    if let Some(entry) = locked.entries.get_mut(&id) {
                        entry.status = PushEventStatus::Processing;
                    }
                    Some(id)
                }
                None => {
                    self.prune_terminal(&mut locked);
                    None
                }
            }
        };

        let Some(id) = next_id else { return };
        let entry = {
            let locked = state.lock().await;
            match locked.entries.get(&id) {
                Some(entry) => entry.clone(),
                None => return,
            }
        };
        self.broadcast_queue_update(&entry).await;

        let outcome = self.handler.handle(&entry).await;
        let now = Instant::now();
        let (status, error) = match &outcome {
            Ok(_) => (PushEventStatus::Completed, None),
            Err(message) => (PushEventStatus::Failed, Some(message.clone())),
        };
        if outcome.is_ok() {
            self.processed_timestamps.lock().await.push(now);
        }

        let updated_entry = {
            let mut locked = state.lock().await;
            locked.in_flight = false;
            if let Some(stored) = locked.entries.get_mut(&id) {
                stored.status = status;
                stored.error = error;
                stored.terminal_at = Some(now);
            }
            locked.entries.get(&id).cloned()
        };
        if let Some(entry) = updated_entry {
            self.broadcast_queue_update(&entry).await;
        }
        self.event_log
            .append(
                &EventLogScope::Conversation(conversation_id.to_string()),
                &serde_json::json!({"type": "push_event_processed", "eventId": id, "status": status}),
            )
            .await;

        // Defer to a subsequent tick instead of looping in place, so a
        // large backlog doesn't grow the call stack.
        self.schedule_processing(conversation_id.to_string());
    }

    fn prune_terminal(&self, state: &mut ConversationState) {
        let now = Instant::now();
        state.entries.retain(|_, entry| match entry.terminal_at {
            Some(at) => now.duration_since(at) < CLEANUP_AFTER,
            None => true,
        });
    }

    async fn record_terminal(
        &self,
        event: &IncomingPushEvent,
        status: PushEventStatus,
        error: Option<String>,
    ) -> PushEventEntry {
        let entry = PushEventEntry {
            id: event.id.clone(),
            source: event.source.clone(),
            conversation_id: event.conversation_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            system_message: event.system_message.clone(),
            idempotency_key: event.idempotency_key.clone(),
            timestamp: event.timestamp,
            delegate_id: event.delegate_id.clone(),
            user_id: event.user_id.clone(),
            status,
            error,
            terminal_at: Some(Instant::now()),
        };
        let state = self.conversation_state(&event.conversation_id).await;
        state.lock().await.entries.insert(entry.id.clone(), entry.clone());
        self.broadcast_queue_update(&entry).await;
        entry
    }

    async fn conversation_state(&self, conversation_id: &str) -> Arc<Mutex<ConversationState>> {
        self.conversations
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationState::default())))
            .clone()
    }

    async fn broadcast_queue_update(&self, entry: &PushEventEntry) {
        self.broadcaster
            .broadcast(
                &entry.user_id,
                serde_json::json!({"type": "push_event_queue_update", "entry": entry}),
            )
            .await;
    }
}

fn fallback_key(event_type: &str, payload: &Value, timestamp: u64) -> String {
    let bucket = timestamp / FALLBACK_KEY_BUCKET.as_millis() as u64;
    let concat = format!("{event_type}:{payload}:{bucket}");
    let digest = Sha256::digest(concat.as_bytes());
    format!("fallback:{}", &hex::encode(digest)[..16])
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::collaborators::test_support::RecordingBroadcaster;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    impl PushEventHandler for CountingHandler {
        fn handle<'a>(&'a self, _entry: &'a PushEventEntry) -> BoxFuture<'a, Result<String, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok("handled".to_string()) })
        }
    }

    fn event(id: &str, idempotency_key: Option<&str>) -> IncomingPushEvent {
        IncomingPushEvent {
            id: id.to_string(),
            source: "webhook".to_string(),
            conversation_id: "conv-1".to_string(),
            event_type: "issue_comment".to_string(),
            payload: serde_json::json!({"n": id}),
            system_message: None,
            idempotency_key: idempotency_key.map(|k| k.to_string()),
            timestamp: 1_000,
            delegate_id: "alpha".to_string(),
            user_id: "user-1".to_string(),
        }
    }

    fn new_queue(max_per_hour: u32, max_queue_size: usize) -> Arc<EventQueue> {
        EventQueue::new(
            EventQueueConfig {
                max_pushes_per_hour: max_per_hour,
                idempotency_window: Duration::from_secs(30 * 60),
                max_queue_size,
            },
            Arc::new(EventLog::new(std::env::temp_dir().join(format!("mcpl-test-{}", uuid::Uuid::new_v4())))),
            Arc::new(RecordingBroadcaster::default()),
            Arc::new(CountingHandler {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        )
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_ignored() {
        let queue = new_queue(60, 100);
        let first = queue.push(event("e1", Some("k1"))).await;
        assert_eq!(first.status, PushEventStatus::Queued);
        let second = queue.push(event("e2", Some("k1"))).await;
        assert_eq!(second.status, PushEventStatus::DuplicateIgnored);
    }

    #[tokio::test]
    async fn queue_full_is_rate_limited() {
        let queue = new_queue(60, 1);
        queue.pause("conv-1").await;
        let first = queue.push(event("e1", Some("k1"))).await;
        assert_eq!(first.status, PushEventStatus::Queued);
        let second = queue.push(event("e2", Some("k2"))).await;
        assert_eq!(second.status, PushEventStatus::RateLimited);
        assert_eq!(second.error.as_deref(), Some("Queue full"));
    }

    #[tokio::test]
    async fn processing_completes_and_unblocks_next() {
        let queue = new_queue(60, 100);
        queue.push(event("e1", Some("k1"))).await;
        queue.push(event("e2", Some("k2"))).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let first = queue.status_of("conv-1", "e1").await.expect("e1 present");
        let second = queue.status_of("conv-1", "e2").await.expect("e2 present");
        assert_eq!(first.status, PushEventStatus::Completed);
        assert_eq!(second.status, PushEventStatus::Completed);
    }
}
