//! API request and response types

use crate::state_machine::ConvState;
use crate::transcript::TranscriptEntry;
use serde::{Deserialize, Serialize};

/// Request to send a chat message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

/// Response for conversation creation
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConversationResponse {
    pub conversation_id: String,
}

/// One row of the conversation listing
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationSummaryResponse {
    pub conversation_id: String,
    pub state: ConvState,
    pub entries: usize,
}

/// Response with a list of conversations
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationSummaryResponse>,
}

/// Response with conversation state and transcript
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub conversation_id: String,
    pub state: ConvState,
    pub awaiting_reply: bool,
    pub messages: Vec<TranscriptEntry>,
}

/// Response for chat action
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
}

/// Response for cancel and close actions
#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
