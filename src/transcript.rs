//! Conversation transcript
//!
//! Append-only, ordered record of who said what. Sequence numbers are
//! assigned under the write lock, so they are gapless and every reader sees
//! a prefix of the final transcript.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Author of a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Bot,
}

/// One immutable transcript entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// 1-based, gapless
    pub sequence: u64,
    pub sender: Sender,
    pub text: String,
    /// Links a user message to its reply; `None` for the greeting
    pub turn_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only transcript
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: RwLock<Vec<TranscriptEntry>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, assigning the next sequence number
    pub fn append(
        &self,
        sender: Sender,
        text: impl Into<String>,
        turn_id: Option<String>,
    ) -> TranscriptEntry {
        let mut entries = self.entries.write().unwrap();
        let entry = TranscriptEntry {
            sequence: entries.len() as u64 + 1,
            sender,
            text: text.into(),
            turn_id,
            created_at: Utc::now(),
        };
        entries.push(entry.clone());
        entry
    }

    /// Full ordered transcript
    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.entries.read().unwrap().clone()
    }

    /// Entries with a sequence number greater than `sequence`
    pub fn entries_after(&self, sequence: u64) -> Vec<TranscriptEntry> {
        let entries = self.entries.read().unwrap();
        // sequence n lives at index n - 1
        let start = usize::try_from(sequence).map_or(entries.len(), |s| s.min(entries.len()));
        entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
