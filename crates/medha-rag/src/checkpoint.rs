//! Per-thread state persistence.
//!
//! One state per thread id, last write wins. Nothing here serializes
//! concurrent invocations on the same thread; callers that need ordering do
//! that themselves.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

use crate::state::ConversationState;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationState>>;

    async fn put(&self, thread_id: &str, state: &ConversationState) -> Result<()>;
}

/// Process-local store. Threads are lost on restart.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    threads: DashMap<String, ConversationState>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        Ok(self.threads.get(thread_id).map(|e| e.value().clone()))
    }

    async fn put(&self, thread_id: &str, state: &ConversationState) -> Result<()> {
        self.threads.insert(thread_id.to_string(), state.clone());
        Ok(())
    }
}

/// One pretty-printed JSON file per thread.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, thread_id: &str) -> PathBuf {
        self.dir.join(file_name_for(thread_id))
    }
}

/// Thread ids are caller-supplied. Plain ids are used as-is, anything else is
/// hex-encoded so it cannot escape the directory. The prefixes keep the two
/// forms from colliding.
fn file_name_for(thread_id: &str) -> String {
    let plain = !thread_id.is_empty()
        && thread_id.len() <= 100
        && thread_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        format!("t-{}.json", thread_id)
    } else {
        let hex: String = thread_id.bytes().map(|b| format!("{:02x}", b)).collect();
        format!("h-{}.json", hex)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        let path = self.path_for(thread_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                let message = format!("Failed to read checkpoint {}", path.display());
                return Err(e).context(message);
            }
        };

        let state: ConversationState = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    thread_id,
                    path = %path.display(),
                    error = %e,
                    "Corrupt checkpoint, starting thread fresh"
                );
                return Ok(None);
            }
        };
        if let Err(e) = state.check_invariants() {
            tracing::warn!(
                thread_id,
                path = %path.display(),
                error = %e,
                "Checkpoint violates state invariants, starting thread fresh"
            );
            return Ok(None);
        }

        tracing::debug!(
            thread_id,
            messages = state.messages().len(),
            "Checkpoint loaded"
        );
        Ok(Some(state))
    }

    async fn put(&self, thread_id: &str, state: &ConversationState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create checkpoint dir {}", self.dir.display()))?;

        let path = self.path_for(thread_id);
        let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;

        // Write to a sibling temp file and rename so readers never see a partial file.
        let tmp_name = format!("{}.{}.tmp", file_name_for(thread_id), uuid::Uuid::new_v4());
        let tmp = self.dir.join(tmp_name);
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            let message = format!("Failed to replace {}", path.display());
            return Err(e).context(message);
        }

        tracing::debug!(thread_id, path = %path.display(), "Checkpoint written");
        Ok(())
    }
}
