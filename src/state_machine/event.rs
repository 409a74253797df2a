//! Events that can occur in a conversation

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // User events
    UserMessage {
        text: String,
        /// Caller-assigned id linking this message to its reply
        turn_id: String,
    },
    CancelReply {
        turn_id: String,
    },
    /// The conversation view was torn down
    Close,

    // Scheduler events
    ReplyDue {
        turn_id: String,
    },
}

impl Event {
    pub fn user_message(text: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Event::UserMessage {
            text: text.into(),
            turn_id: turn_id.into(),
        }
    }

    pub fn reply_due(turn_id: impl Into<String>) -> Self {
        Event::ReplyDue {
            turn_id: turn_id.into(),
        }
    }
}
