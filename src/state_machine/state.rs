//! Conversation state types

use crate::rules::RuleMatcher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A reply that has been resolved but not yet delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReply {
    pub turn_id: String,
    pub reply: String,
}

/// Conversation state
///
/// Turns overlap freely: several replies may be pending at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvState {
    /// No reply pending
    #[default]
    Idle,

    /// At least one reply scheduled, in submission order
    AwaitingReply { pending: Vec<PendingReply> },

    /// Torn down; nothing further is appended
    Closed,
}

impl ConvState {
    /// Idle when nothing is pending, `AwaitingReply` otherwise
    pub fn from_pending(pending: Vec<PendingReply>) -> Self {
        if pending.is_empty() {
            ConvState::Idle
        } else {
            ConvState::AwaitingReply { pending }
        }
    }

    pub fn pending(&self) -> &[PendingReply] {
        match self {
            ConvState::AwaitingReply { pending } => pending,
            ConvState::Idle | ConvState::Closed => &[],
        }
    }

    pub fn is_awaiting_reply(&self) -> bool {
        matches!(self, ConvState::AwaitingReply { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConvState::Closed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConvState::Idle => "idle",
            ConvState::AwaitingReply { .. } => "awaiting_reply",
            ConvState::Closed => "closed",
        }
    }
}

/// Default simulated typing latency
pub const DEFAULT_REPLY_DELAY: Duration = Duration::from_millis(1000);

/// Context for a conversation (immutable configuration)
#[derive(Debug, Clone)]
pub struct ConvContext {
    pub conversation_id: String,
    pub reply_delay: Duration,
    pub matcher: Arc<RuleMatcher>,
}

impl ConvContext {
    pub fn new(conversation_id: impl Into<String>, matcher: Arc<RuleMatcher>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            reply_delay: DEFAULT_REPLY_DELAY,
            matcher,
        }
    }

    #[must_use]
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }
}
