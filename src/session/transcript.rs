use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Who said it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Agent,
}

/// A single utterance in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    /// When the message was received
    pub timestamp: DateTime<Utc>,
}

/// Append-only conversation log
///
/// Entries are kept in receipt order for the life of the session. Every
/// appended entry is also broadcast to subscribers.
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    entries: Arc<RwLock<Vec<TranscriptEntry>>>,
    updates: broadcast::Sender<TranscriptEntry>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(64);
        Self::with_updates(updates)
    }

    /// Empty log publishing to an existing channel
    pub fn with_updates(updates: broadcast::Sender<TranscriptEntry>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            updates,
        }
    }

    pub async fn append(&self, role: Role, text: impl Into<String>) -> TranscriptEntry {
        let entry = TranscriptEntry {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        };

        self.entries.write().await.push(entry.clone());
        // No subscribers is fine
        let _ = self.updates.send(entry.clone());
        entry
    }

    pub async fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Receive entries appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEntry> {
        self.updates.subscribe()
    }

    pub async fn to_json(&self) -> Result<String> {
        let entries = self.entries.read().await;
        serde_json::to_string_pretty(&*entries).context("Failed to serialize transcript")
    }

    /// Export the transcript as a JSON array
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json().await?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .context("Failed to create transcript directory")?;
        }
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write transcript to {}", path.display()))
    }
}

impl Default for TranscriptLog {
    fn default() -> Self {
        Self::new()
    }
}
