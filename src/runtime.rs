//! Runtime for executing conversations
//!
//! Each open conversation is a `ConversationController` task fed through an
//! mpsc channel. The manager owns the registry of open conversations and is
//! the only way the HTTP layer reaches them.
//!
//! A conversation lives as long as someone observes it. It is closed when
//! the last SSE viewer detaches, or by the idle reaper once it has had no
//! viewer and no caller for the configured idle timeout.

mod executor;
pub mod scheduler;

#[cfg(test)]
pub mod testing;

pub use executor::ConversationController;
pub use scheduler::{DeliveryHandle, DeliveryScheduler, TokioScheduler};

use crate::rules::RuleMatcher;
use crate::state_machine::{ConvContext, ConvState, Event};
use crate::transcript::{MessageLog, Sender, TranscriptEntry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};

/// Type alias for production controllers
pub type ProductionController = ConversationController<TokioScheduler<Event>>;

/// Errors surfaced to callers of the runtime manager
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Conversation not found: {0}")]
    NotFound(String),
    #[error("Conversation {0} is no longer running")]
    Stopped(String),
}

/// Settings shared by every conversation
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub matcher: Arc<RuleMatcher>,
    pub reply_delay: Duration,
    /// Bot message seeded into each new transcript
    pub greeting: Option<String>,
    /// Close conversations left without viewer or caller this long
    pub idle_timeout: Option<Duration>,
}

/// Handle to interact with a running conversation
#[derive(Clone)]
pub struct ConversationHandle {
    pub event_tx: mpsc::Sender<Event>,
    pub broadcast_tx: broadcast::Sender<TranscriptEvent>,
    pub state_rx: watch::Receiver<ConvState>,
    pub log: Arc<MessageLog>,
    /// Attached SSE viewers
    viewers: Arc<AtomicUsize>,
    last_active: Arc<Mutex<Instant>>,
}

impl ConversationHandle {
    fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.viewers.load(Ordering::SeqCst) == 0
            && now.saturating_duration_since(*self.last_active.lock().unwrap()) >= idle_timeout
    }
}

/// Keeps a conversation open while an SSE viewer is attached
///
/// Dropping the last guard of a conversation closes it.
pub struct ViewerGuard {
    runtime: Weak<RuntimeManager>,
    conversation_id: String,
    viewers: Arc<AtomicUsize>,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        if self.viewers.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let conv_id = std::mem::take(&mut self.conversation_id);
        rt.spawn(async move {
            runtime.close_unobserved(&conv_id).await;
        });
    }
}

/// Events sent to transcript observers
#[derive(Debug, Clone)]
pub enum TranscriptEvent {
    Init {
        conversation_id: String,
        messages: Vec<TranscriptEntry>,
        awaiting_reply: bool,
        last_sequence: u64,
    },
    Entry {
        entry: TranscriptEntry,
    },
    StateChange {
        /// Full state as JSON object (e.g., `{"type":"awaiting_reply","pending":[...]}`)
        state: serde_json::Value,
    },
    Closed,
    Error {
        message: String,
    },
}

/// Summary row for conversation listings
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub state: ConvState,
    pub entries: usize,
}

/// Manager for all conversation runtimes
pub struct RuntimeManager {
    settings: ConversationSettings,
    conversations: RwLock<HashMap<String, ConversationHandle>>,
}

impl RuntimeManager {
    pub fn new(settings: ConversationSettings) -> Self {
        Self {
            settings,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// Build a manager and start its idle reaper when an idle timeout is set
    pub fn start(settings: ConversationSettings) -> Arc<Self> {
        let idle_timeout = settings.idle_timeout;
        let manager = Arc::new(Self::new(settings));
        if let Some(idle_timeout) = idle_timeout {
            spawn_idle_reaper(&manager, idle_timeout);
        }
        manager
    }

    /// Open a new conversation and start its controller
    pub async fn create(&self) -> String {
        let conversation_id = uuid::Uuid::new_v4().to_string();

        let log = Arc::new(MessageLog::new());
        if let Some(greeting) = &self.settings.greeting {
            log.append(Sender::Bot, greeting.clone(), None);
        }

        let context = ConvContext::new(&conversation_id, self.settings.matcher.clone())
            .with_reply_delay(self.settings.reply_delay);

        let (event_tx, event_rx) = mpsc::channel(32);
        let (broadcast_tx, _) = broadcast::channel(128);
        let (state_tx, state_rx) = watch::channel(ConvState::Idle);

        let scheduler = TokioScheduler::new(event_tx.clone());
        let controller: ProductionController = ConversationController::new(
            context,
            log.clone(),
            scheduler,
            event_rx,
            state_tx,
            broadcast_tx.clone(),
        );

        let conv_id = conversation_id.clone();
        tokio::spawn(async move {
            controller.run().await;
            tracing::info!(conv_id = %conv_id, "Conversation runtime finished");
        });

        self.conversations.write().await.insert(
            conversation_id.clone(),
            ConversationHandle {
                event_tx,
                broadcast_tx,
                state_rx,
                log,
                viewers: Arc::new(AtomicUsize::new(0)),
                last_active: Arc::new(Mutex::new(Instant::now())),
            },
        );

        tracing::info!(conv_id = %conversation_id, "Conversation created");
        conversation_id
    }

    /// Look up a running conversation, marking it active
    pub async fn handle(&self, conversation_id: &str) -> Result<ConversationHandle, RuntimeError> {
        let handle = self
            .conversations
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(conversation_id.to_string()))?;
        handle.touch();
        Ok(handle)
    }

    async fn send_event(&self, conversation_id: &str, event: Event) -> Result<(), RuntimeError> {
        let handle = self.handle(conversation_id).await?;
        handle
            .event_tx
            .send(event)
            .await
            .map_err(|_| RuntimeError::Stopped(conversation_id.to_string()))
    }

    /// Submit user text.
    ///
    /// Returns the turn id, or `None` for blank text (which the controller
    /// ignores).
    pub async fn submit(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<Option<String>, RuntimeError> {
        let turn_id = uuid::Uuid::new_v4().to_string();
        let blank = text.trim().is_empty();

        self.send_event(conversation_id, Event::user_message(text, turn_id.clone()))
            .await?;

        if blank {
            tracing::debug!(conv_id = %conversation_id, "Ignored blank submission");
            return Ok(None);
        }

        let rule = self
            .settings
            .matcher
            .find(text)
            .map(|r| r.keywords().join("+"));
        tracing::debug!(
            conv_id = %conversation_id,
            turn_id = %turn_id,
            rule = rule.as_deref().unwrap_or("fallback"),
            "Message submitted"
        );
        Ok(Some(turn_id))
    }

    /// Cancel the pending reply for one turn
    pub async fn cancel_reply(
        &self,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<(), RuntimeError> {
        self.send_event(
            conversation_id,
            Event::CancelReply {
                turn_id: turn_id.to_string(),
            },
        )
        .await
    }

    /// Full ordered transcript
    pub async fn snapshot(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<TranscriptEntry>, RuntimeError> {
        Ok(self.handle(conversation_id).await?.log.snapshot())
    }

    /// Transcript entries newer than `sequence`
    pub async fn entries_after(
        &self,
        conversation_id: &str,
        sequence: u64,
    ) -> Result<Vec<TranscriptEntry>, RuntimeError> {
        Ok(self.handle(conversation_id).await?.log.entries_after(sequence))
    }

    /// Latest published state
    pub async fn state(&self, conversation_id: &str) -> Result<ConvState, RuntimeError> {
        let handle = self.handle(conversation_id).await?;
        let state = handle.state_rx.borrow().clone();
        Ok(state)
    }

    /// Subscribe to conversation updates as a viewer
    ///
    /// The conversation stays open at least as long as the returned guard.
    pub async fn attach_viewer(
        self: &Arc<Self>,
        conversation_id: &str,
    ) -> Result<(broadcast::Receiver<TranscriptEvent>, ViewerGuard), RuntimeError> {
        let handle = self.handle(conversation_id).await?;
        handle.viewers.fetch_add(1, Ordering::SeqCst);
        let guard = ViewerGuard {
            runtime: Arc::downgrade(self),
            conversation_id: conversation_id.to_string(),
            viewers: handle.viewers.clone(),
        };
        tracing::debug!(conv_id = %conversation_id, "Viewer attached");
        Ok((handle.broadcast_tx.subscribe(), guard))
    }

    /// Tear a conversation down, cancelling every outstanding reply
    pub async fn close(&self, conversation_id: &str) -> Result<(), RuntimeError> {
        let handle = self
            .conversations
            .write()
            .await
            .remove(conversation_id)
            .ok_or_else(|| RuntimeError::NotFound(conversation_id.to_string()))?;

        shut_down(conversation_id, handle, "closed by client").await;
        Ok(())
    }

    /// Close a conversation whose last viewer left, unless another attached
    async fn close_unobserved(&self, conversation_id: &str) -> bool {
        let handle = {
            let mut conversations = self.conversations.write().await;
            match conversations.get(conversation_id) {
                Some(h) if h.viewers.load(Ordering::SeqCst) == 0 => {
                    conversations.remove(conversation_id)
                }
                _ => None,
            }
        };
        let Some(handle) = handle else {
            return false;
        };
        shut_down(conversation_id, handle, "viewer detached").await;
        true
    }

    /// Close conversations with no viewer and no caller for `idle_timeout`
    pub async fn expire_idle(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, ConversationHandle)> = {
            let mut conversations = self.conversations.write().await;
            let ids: Vec<String> = conversations
                .iter()
                .filter(|(_, handle)| handle.is_idle(now, idle_timeout))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| conversations.remove(&id).map(|handle| (id, handle)))
                .collect()
        };

        let count = expired.len();
        for (conv_id, handle) in expired {
            shut_down(&conv_id, handle, "idle").await;
        }
        count
    }

    /// Close every open conversation (shutdown)
    pub async fn close_all(&self) {
        let handles: Vec<(String, ConversationHandle)> =
            self.conversations.write().await.drain().collect();
        for (conv_id, handle) in handles {
            shut_down(&conv_id, handle, "shutdown").await;
        }
    }

    /// Open conversations, in no particular order
    pub async fn list(&self) -> Vec<ConversationSummary> {
        self.conversations
            .read()
            .await
            .iter()
            .map(|(id, handle)| ConversationSummary {
                conversation_id: id.clone(),
                state: handle.state_rx.borrow().clone(),
                entries: handle.log.len(),
            })
            .collect()
    }
}

async fn shut_down(conversation_id: &str, handle: ConversationHandle, reason: &'static str) {
    // A stopped controller has nothing left to cancel
    let _ = handle.event_tx.send(Event::Close).await;
    tracing::info!(conv_id = %conversation_id, reason, "Conversation closed");
}

/// Periodically close idle conversations; stops with the manager
fn spawn_idle_reaper(manager: &Arc<RuntimeManager>, idle_timeout: Duration) {
    let manager = Arc::downgrade(manager);
    let period = (idle_timeout / 4).max(Duration::from_millis(10));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            let expired = manager.expire_idle(idle_timeout).await;
            if expired > 0 {
                tracing::info!(expired, "Closed idle conversations");
            }
        }
        tracing::debug!("Idle reaper stopped");
    });
}
