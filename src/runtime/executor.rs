//! Conversation controller
//!
//! One actor per conversation. Events are handled one at a time and each is
//! processed to completion without awaiting, so the user entry and the
//! resolved reply of one submission can never interleave with another.

use super::{DeliveryHandle, DeliveryScheduler, TranscriptEvent};
use crate::state_machine::{transition, ConvContext, ConvState, Effect, Event, TransitionError};
use crate::transcript::MessageLog;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

/// Drives one conversation: applies transitions and executes their effects
pub struct ConversationController<D>
where
    D: DeliveryScheduler<Event>,
{
    context: ConvContext,
    state: ConvState,
    log: Arc<MessageLog>,
    scheduler: D,
    /// Scheduled reply per turn
    deliveries: HashMap<String, DeliveryHandle>,
    event_rx: mpsc::Receiver<Event>,
    state_tx: watch::Sender<ConvState>,
    broadcast_tx: broadcast::Sender<TranscriptEvent>,
}

impl<D> ConversationController<D>
where
    D: DeliveryScheduler<Event>,
{
    pub fn new(
        context: ConvContext,
        log: Arc<MessageLog>,
        scheduler: D,
        event_rx: mpsc::Receiver<Event>,
        state_tx: watch::Sender<ConvState>,
        broadcast_tx: broadcast::Sender<TranscriptEvent>,
    ) -> Self {
        Self {
            context,
            state: ConvState::Idle,
            log,
            scheduler,
            deliveries: HashMap::new(),
            event_rx,
            state_tx,
            broadcast_tx,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(conv_id = %self.context.conversation_id, "Starting conversation controller");

        while let Some(event) = self.event_rx.recv().await {
            if let Err(e) = self.process_event(event) {
                tracing::warn!(conv_id = %self.context.conversation_id, error = %e, "Rejected event");
                let _ = self.broadcast_tx.send(TranscriptEvent::Error {
                    message: e.to_string(),
                });
            }
            if self.state.is_closed() {
                break;
            }
        }

        // Nothing may land in a transcript nobody observes any more
        let outstanding = self.scheduler.pending();
        self.scheduler.cancel_all();
        self.deliveries.clear();
        let _ = self.broadcast_tx.send(TranscriptEvent::Closed);

        tracing::info!(
            conv_id = %self.context.conversation_id,
            cancelled = outstanding,
            "Conversation controller stopped"
        );
    }

    /// Apply one event
    pub(crate) fn process_event(&mut self, event: Event) -> Result<(), TransitionError> {
        let result = transition(&self.state, &self.context, event)?;
        self.state = result.new_state;

        for effect in result.effects {
            self.execute_effect(effect);
        }
        Ok(())
    }

    fn execute_effect(&mut self, effect: Effect) {
        match effect {
            Effect::AppendEntry {
                sender,
                text,
                turn_id,
            } => {
                let entry = self.log.append(sender, text, turn_id);
                tracing::debug!(
                    conv_id = %self.context.conversation_id,
                    sequence = entry.sequence,
                    sender = ?entry.sender,
                    "Appended transcript entry"
                );
                let _ = self.broadcast_tx.send(TranscriptEvent::Entry { entry });
            }

            Effect::ScheduleReply { turn_id, delay } => {
                let handle = self
                    .scheduler
                    .schedule(Event::reply_due(turn_id.clone()), delay);
                tracing::debug!(
                    conv_id = %self.context.conversation_id,
                    turn_id = %turn_id,
                    delivery_id = handle.id(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduled reply"
                );
                self.deliveries.insert(turn_id, handle);
            }

            Effect::CancelReply { turn_id } => {
                if let Some(handle) = self.deliveries.remove(&turn_id) {
                    self.scheduler.cancel(handle);
                    tracing::info!(
                        conv_id = %self.context.conversation_id,
                        turn_id = %turn_id,
                        "Cancelled pending reply"
                    );
                }
            }

            Effect::NotifyStateChange => {
                self.forget_delivered();
                self.state_tx.send_replace(self.state.clone());
                tracing::debug!(
                    conv_id = %self.context.conversation_id,
                    state = self.state.name(),
                    "State changed"
                );
                let state_json = serde_json::to_value(&self.state).unwrap_or(Value::Null);
                let _ = self
                    .broadcast_tx
                    .send(TranscriptEvent::StateChange { state: state_json });
            }
        }
    }

    /// Drop handles for turns that are no longer pending
    fn forget_delivered(&mut self) {
        let pending = self.state.pending();
        self.deliveries
            .retain(|turn_id, _| pending.iter().any(|p| &p.turn_id == turn_id));
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &ConvState {
        &self.state
    }
}
