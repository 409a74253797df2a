//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    ChatRequest, ChatResponse, ConversationListResponse, ConversationResponse,
    ConversationSummaryResponse, CreateConversationResponse, ErrorResponse, OkResponse,
};
use super::AppState;
use crate::runtime::{RuntimeError, TranscriptEvent};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Conversation listing
        .route("/api/conversations", get(list_conversations))
        // Conversation creation
        .route("/api/conversations/new", post(create_conversation))
        // Transcript retrieval
        .route("/api/conversations/:id", get(get_conversation))
        // SSE streaming
        .route("/api/conversations/:id/stream", get(stream_conversation))
        // User actions
        .route("/api/conversations/:id/chat", post(send_chat))
        .route(
            "/api/conversations/:id/turns/:turn_id/cancel",
            post(cancel_reply),
        )
        // Lifecycle
        .route("/api/conversations/:id/close", post(close_conversation))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Conversation Listing
// ============================================================

async fn list_conversations(State(state): State<AppState>) -> Json<ConversationListResponse> {
    let conversations = state
        .runtime
        .list()
        .await
        .into_iter()
        .map(|summary| ConversationSummaryResponse {
            conversation_id: summary.conversation_id,
            state: summary.state,
            entries: summary.entries,
        })
        .collect();

    Json(ConversationListResponse { conversations })
}

// ============================================================
// Conversation Creation
// ============================================================

async fn create_conversation(State(state): State<AppState>) -> Json<CreateConversationResponse> {
    let conversation_id = state.runtime.create().await;
    Json(CreateConversationResponse { conversation_id })
}

// ============================================================
// Transcript Retrieval
// ============================================================

#[derive(Debug, Deserialize)]
struct AfterQuery {
    after: Option<u64>,
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AfterQuery>,
) -> Result<Json<ConversationResponse>, AppError> {
    let messages = match query.after {
        Some(after) => state.runtime.entries_after(&id, after).await?,
        None => state.runtime.snapshot(&id).await?,
    };
    let conv_state = state.runtime.state(&id).await?;

    Ok(Json(ConversationResponse {
        conversation_id: id,
        awaiting_reply: conv_state.is_awaiting_reply(),
        state: conv_state,
        messages,
    }))
}

async fn stream_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    // Subscribe before the snapshot so nothing falls between them
    let (broadcast_rx, viewer) = state.runtime.attach_viewer(&id).await?;
    let messages = state.runtime.snapshot(&id).await?;
    let conv_state = state.runtime.state(&id).await?;

    let init_event = TranscriptEvent::Init {
        conversation_id: id,
        last_sequence: messages.last().map_or(0, |e| e.sequence),
        messages,
        awaiting_reply: conv_state.is_awaiting_reply(),
    };

    Ok(sse_stream(init_event, broadcast_rx, viewer))
}

// ============================================================
// User Actions
// ============================================================

async fn send_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    let Json(req) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let turn_id = state.runtime.submit(&id, &req.text).await?;

    Ok(Json(ChatResponse {
        queued: turn_id.is_some(),
        turn_id,
    }))
}

async fn cancel_reply(
    State(state): State<AppState>,
    Path((id, turn_id)): Path<(String, String)>,
) -> Result<Json<OkResponse>, AppError> {
    state.runtime.cancel_reply(&id, &turn_id).await?;
    Ok(Json(OkResponse { ok: true }))
}

// ============================================================
// Lifecycle
// ============================================================

async fn close_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, AppError> {
    state.runtime.close(&id).await?;
    Ok(Json(OkResponse { ok: true }))
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("netops-assist ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<RuntimeError> for AppError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(_) => AppError::NotFound(err.to_string()),
            RuntimeError::Stopped(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
