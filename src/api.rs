//! HTTP API for the support assistant
//!
//! JSON endpoints for the dashboard widget plus an SSE transcript stream.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::runtime::{ConversationSettings, RuntimeManager};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeManager>,
}

impl AppState {
    pub fn new(settings: ConversationSettings) -> Self {
        Self {
            runtime: RuntimeManager::start(settings),
        }
    }
}
