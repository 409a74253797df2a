//! Effects produced by state transitions

use crate::transcript::Sender;
use std::time::Duration;

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Append an entry to the transcript
    AppendEntry {
        sender: Sender,
        text: String,
        turn_id: Option<String>,
    },

    /// Deliver the pending reply for a turn after a delay
    ScheduleReply { turn_id: String, delay: Duration },

    /// Stop a scheduled reply from being delivered
    CancelReply { turn_id: String },

    /// Publish the new state to observers
    NotifyStateChange,
}

impl Effect {
    pub fn append_user(text: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Effect::AppendEntry {
            sender: Sender::User,
            text: text.into(),
            turn_id: Some(turn_id.into()),
        }
    }

    pub fn append_bot(text: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Effect::AppendEntry {
            sender: Sender::Bot,
            text: text.into(),
            turn_id: Some(turn_id.into()),
        }
    }
}
