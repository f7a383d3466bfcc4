//! UIEventLog (§6 "Persisted state"): sharded, append-only record of
//! per-message active-branch state, auto-compacted once a shard grows too
//! large. One mutex per shard path serializes writer and compactor access
//! to that file, the per-key-mutex replacement for promise-chain write
//! serialization called out in §9 Design Notes.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::Mutex;

const COMPACT_AFTER_BYTES: u64 = 50 * 1024;
const COMPACT_AFTER_WRITES: u64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBranchChanged {
    pub message_id: String,
    pub branch_id: String,
    pub timestamp: u64,
}

struct Shard {
    lock: Arc<Mutex<()>>,
    writes_since_compaction: u64,
}

/// Append-only per-conversation log of `active_branch_changed` events,
/// sharded by the first four hex characters of the conversation id so a
/// busy host doesn't funnel every conversation through one directory.
pub struct UiEventLog {
    root: PathBuf,
    shards: Mutex<HashMap<String, Shard>>,
}

impl UiEventLog {
    pub fn new(root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            root,
            shards: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn shard_path(&self, conversation_id: &str) -> PathBuf {
        let hex: String = conversation_id.chars().filter(|c| c.is_ascii_hexdigit()).take(4).collect();
        let shard = if hex.len() == 4 { hex } else { format!("{hex:0<4}") };
        self.root.join("ui_events").join(shard).join(format!("{conversation_id}.jsonl"))
    }

    /// Appends one `active_branch_changed` entry, compacting the shard
    /// in-place once it crosses the size or write-count threshold.
    pub async fn record(&self, conversation_id: &str, entry: ActiveBranchChanged) {
        let path = self.shard_path(conversation_id);
        let lock = self.shard_lock(&path).await;
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent()
            && let Err(error) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!(%error, path = %path.display(), "failed to create ui event log shard directory");
            return;
        }

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(%error, "failed to serialize active_branch_changed");
                return;
            }
        };
        match tokio::fs::OpenOptions::new().append(true).create(true).open(&path).await {
            Ok(mut file) => {
                if file.write_all(line.as_bytes()).await.is_err() || file.write_all(b"\n").await.is_err() {
                    tracing::warn!(path = %path.display(), "ui event log append failed");
                    return;
                }
                let _ = file.flush().await;
            }
            Err(error) => {
                tracing::warn!(%error, path = %path.display(), "failed to open ui event log shard");
                return;
            }
        }

        let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let should_compact = {
            let mut shards = self.shards.lock().await;
            let shard = shards.get_mut(&path.display().to_string());
            match shard {
                Some(shard) => {
                    shard.writes_since_compaction += 1;
                    shard.writes_since_compaction >= COMPACT_AFTER_WRITES || size >= COMPACT_AFTER_BYTES
                }
                None => size >= COMPACT_AFTER_BYTES,
            }
        };

        if should_compact {
            self.compact_locked(&path).await;
            if let Some(shard) = self.shards.lock().await.get_mut(&path.display().to_string()) {
                shard.writes_since_compaction = 0;
            }
        }
    }

    async fn shard_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut shards = self.shards.lock().await;
        shards
            .entry(path.display().to_string())
            .or_insert_with(|| Shard {
                lock: Arc::new(Mutex::new(())),
                writes_since_compaction: 0,
            })
            .lock
            .clone()
    }

    /// Rewrites the shard to one line per `messageId`, keeping each
    /// message's most recently recorded branch. Atomic: written to a
    /// `.tmp` file, swapped in via rename, with the original preserved at
    /// `.bak` until the swap succeeds. Must be called with the shard's
    /// lock already held.
    async fn compact_locked(&self, path: &Path) {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(_) => return,
        };
        let mut lines = BufReader::new(file).lines();
        let mut latest: HashMap<String, ActiveBranchChanged> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(entry) = serde_json::from_str::<ActiveBranchChanged>(&line) {
                if !latest.contains_key(&entry.message_id) {
                    order.push(entry.message_id.clone());
                }
                latest.insert(entry.message_id.clone(), entry);
            }
        }

        let mut compacted = String::new();
        for message_id in &order {
            if let Some(entry) = latest.get(message_id)
                && let Ok(line) = serde_json::to_string(entry)
            {
                compacted.push_str(&line);
                compacted.push('\n');
            }
        }

        let tmp_path = path.with_extension("jsonl.tmp");
        let bak_path = path.with_extension("jsonl.bak");
        if tokio::fs::write(&tmp_path, compacted.as_bytes()).await.is_err() {
            return;
        }
        if tokio::fs::rename(path, &bak_path).await.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return;
        }
        if tokio::fs::rename(&tmp_path, path).await.is_err() {
            let _ = tokio::fs::rename(&bak_path, path).await;
            let _ = tokio::fs::remove_file(&tmp_path).await;
            tracing::warn!(path = %path.display(), "ui event log compaction failed, rolled back");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn record_appends_jsonl_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = UiEventLog::new(dir.path().to_path_buf());
        log.record(
            "abcdef12-0000-0000-0000-000000000000",
            ActiveBranchChanged {
                message_id: "msg-1".to_string(),
                branch_id: "branch-a".to_string(),
                timestamp: 1,
            },
        )
        .await;

        let path = log.shard_path("abcdef12-0000-0000-0000-000000000000");
        let contents = tokio::fs::read_to_string(&path).await.expect("shard file exists");
        assert!(contents.contains("branch-a"));
        assert!(path.to_string_lossy().contains("abcd"));
    }

    #[tokio::test]
    async fn compaction_keeps_only_latest_branch_per_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = UiEventLog::new(dir.path().to_path_buf());
        let conversation_id = "0000abcd-0000-0000-0000-000000000000";
        for i in 0..5u64 {
            log.record(
                conversation_id,
                ActiveBranchChanged {
                    message_id: "msg-1".to_string(),
                    branch_id: format!("branch-{i}"),
                    timestamp: i,
                },
            )
            .await;
        }

        let path = log.shard_path(conversation_id);
        log.compact_locked(&path).await;
        let contents = tokio::fs::read_to_string(&path).await.expect("shard file exists");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("branch-4"));
    }
}
