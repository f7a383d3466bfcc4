//! Append-only JSONL event log, sharded per user and per conversation.
//!
//! One spawned task per log path owns the file handle and performs the
//! actual write, the same split codex's rollout recorder uses to keep
//! blocking-free I/O off the caller's task. Appends are fire-and-forget by
//! contract (§7): a failure is logged and counted, never propagated to the
//! state transition that triggered it.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::Result;

const WRITER_CHANNEL_CAPACITY: usize = 256;

/// Identifies which sharded log file an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventLogScope {
    User(String),
    Conversation(String),
}

impl EventLogScope {
    fn relative_path(&self) -> PathBuf {
        match self {
            EventLogScope::User(id) => Path::new("users").join(format!("{id}.jsonl")),
            EventLogScope::Conversation(id) => {
                Path::new("conversations").join(format!("{id}.jsonl"))
            }
        }
    }
}

pub struct EventLog {
    root: PathBuf,
    writers: Mutex<HashMap<PathBuf, mpsc::Sender<String>>>,
    append_failures: Arc<AtomicU64>,
}

impl EventLog {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            writers: Mutex::new(HashMap::new()),
            append_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of appends that have failed since startup. Exposed for tests
    /// and future metrics wiring rather than as a user-visible error.
    pub fn append_failure_count(&self) -> u64 {
        self.append_failures.load(Ordering::Relaxed)
    }

    /// Appends `event` to the log identified by `scope`. Failures are
    /// logged and counted, never returned: persistence must never block a
    /// state transition.
    pub async fn append(&self, scope: &EventLogScope, event: &impl Serialize) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(%error, "failed to serialize event log entry");
                self.append_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let sender = match self.writer_for(scope).await {
            Ok(sender) => sender,
            Err(error) => {
                tracing::warn!(%error, ?scope, "failed to open event log for append");
                self.append_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if sender.send(line).await.is_err() {
            tracing::warn!(?scope, "event log writer task is gone");
            self.append_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reads every entry of `scope`'s log in order, skipping (and warning
    /// on) lines that fail to parse as `T`. Used on startup to replay
    /// checkpoint and scope-policy history.
    pub async fn replay<T: DeserializeOwned>(&self, scope: &EventLogScope) -> Result<Vec<T>> {
        let path = self.root.join(scope.relative_path());
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<T>(&line) {
                Ok(entry) => entries.push(entry),
                Err(error) => {
                    tracing::warn!(%error, ?scope, "skipping unparsable event log entry during replay");
                }
            }
        }
        Ok(entries)
    }

    async fn writer_for(&self, scope: &EventLogScope) -> Result<mpsc::Sender<String>> {
        let path = self.root.join(scope.relative_path());
        let mut writers = self.writers.lock().await;
        if let Some(sender) = writers.get(&path) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }
        let sender = spawn_writer(path.clone()).await?;
        writers.insert(path, sender.clone());
        Ok(sender)
    }
}

async fn spawn_writer(path: PathBuf) -> Result<mpsc::Sender<String>> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .await?;

    let (tx, mut rx) = mpsc::channel::<String>(WRITER_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut file = file;
        while let Some(line) = rx.recv().await {
            if let Err(error) = file.write_all(line.as_bytes()).await {
                tracing::warn!(%error, "event log writer: failed to write line");
                break;
            }
            if let Err(error) = file.write_all(b"\n").await {
                tracing::warn!(%error, "event log writer: failed to write newline");
                break;
            }
            if let Err(error) = file.flush().await {
                tracing::warn!(%error, "event log writer: failed to flush");
                break;
            }
        }
    });

    Ok(tx)
}
