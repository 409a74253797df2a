//! Server-Sent Events support

use crate::runtime::{TranscriptEvent, ViewerGuard};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Init event first, then live updates
///
/// Entries already carried by the init snapshot are skipped, so a subscriber
/// that raced an append sees each entry exactly once. The viewer guard lives
/// as long as the stream; a client disconnect drops both.
pub fn sse_stream(
    init_event: TranscriptEvent,
    broadcast_rx: broadcast::Receiver<TranscriptEvent>,
    viewer: ViewerGuard,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_sequence = match &init_event {
        TranscriptEvent::Init { last_sequence, .. } => *last_sequence,
        _ => 0,
    };

    let init = futures::stream::once(async move { Ok(to_axum_event(init_event)) });

    let updates = BroadcastStream::new(broadcast_rx).filter_map(move |result| match result {
        Ok(TranscriptEvent::Entry { entry }) if entry.sequence <= last_sequence => None,
        Ok(event) => Some(Ok(to_axum_event(event))),
        Err(e) => {
            tracing::debug!(error = %e, "SSE subscriber lagged");
            None
        }
    });

    let stream = init.chain(updates).map(move |event| {
        let _attached = &viewer;
        event
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_axum_event(event: TranscriptEvent) -> Event {
    let (event_type, data) = event_payload(event);
    Event::default().event(event_type).data(data.to_string())
}

fn event_payload(event: TranscriptEvent) -> (&'static str, Value) {
    match event {
        TranscriptEvent::Init {
            conversation_id,
            messages,
            awaiting_reply,
            last_sequence,
        } => (
            "init",
            json!({
                "type": "init",
                "conversation_id": conversation_id,
                "messages": messages,
                "awaiting_reply": awaiting_reply,
                "last_sequence": last_sequence
            }),
        ),
        TranscriptEvent::Entry { entry } => (
            "entry",
            json!({
                "type": "entry",
                "entry": entry
            }),
        ),
        TranscriptEvent::StateChange { state } => (
            "state_change",
            json!({
                "type": "state_change",
                "state": state
            }),
        ),
        TranscriptEvent::Closed => ("closed", json!({ "type": "closed" })),
        TranscriptEvent::Error { message } => (
            "error",
            json!({
                "type": "error",
                "message": message
            }),
        ),
    }
}
