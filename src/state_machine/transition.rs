//! Pure state transition function
//!
//! Decides what a conversation does with each event. Resolution happens
//! here, synchronously, so a user entry and its resolved reply are fixed
//! before the next event is looked at.

use super::{ConvContext, ConvState, Effect, Event, PendingReply};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConvState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConvState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    /// The state is unchanged and nothing happens
    pub fn unchanged(state: &ConvState) -> Self {
        Self::new(state.clone())
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Conversation is closed")]
    ConversationClosed,
}

/// Pure transition function
///
/// Given the same inputs, it always produces the same outputs, with no I/O
/// side effects.
pub fn transition(
    state: &ConvState,
    context: &ConvContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // Closed absorbs everything except new messages
        // ============================================================
        (ConvState::Closed, Event::UserMessage { .. }) => Err(TransitionError::ConversationClosed),

        (ConvState::Closed, _) => Ok(TransitionResult::unchanged(state)),

        // ============================================================
        // User messages
        // ============================================================

        // Blank sends are ignored
        (_, Event::UserMessage { text, .. }) if text.trim().is_empty() => {
            Ok(TransitionResult::unchanged(state))
        }

        (_, Event::UserMessage { text, turn_id }) => {
            let reply = context.matcher.resolve(&text).to_string();

            let mut pending = state.pending().to_vec();
            pending.push(PendingReply {
                turn_id: turn_id.clone(),
                reply,
            });

            Ok(TransitionResult::new(ConvState::from_pending(pending)).with_effects([
                Effect::append_user(text, turn_id.clone()),
                Effect::ScheduleReply {
                    turn_id,
                    delay: context.reply_delay,
                },
                Effect::NotifyStateChange,
            ]))
        }

        // ============================================================
        // Reply delivery
        // ============================================================
        (_, Event::ReplyDue { turn_id }) => {
            let (delivered, rest) = take_pending(state, &turn_id);
            match delivered {
                Some(PendingReply { turn_id, reply }) => {
                    Ok(TransitionResult::new(ConvState::from_pending(rest)).with_effects([
                        Effect::append_bot(reply, turn_id),
                        Effect::NotifyStateChange,
                    ]))
                }
                // Already delivered or cancelled
                None => Ok(TransitionResult::unchanged(state)),
            }
        }

        // ============================================================
        // Cancellation
        // ============================================================
        (_, Event::CancelReply { turn_id }) => {
            let (cancelled, rest) = take_pending(state, &turn_id);
            if cancelled.is_none() {
                return Ok(TransitionResult::unchanged(state));
            }
            Ok(TransitionResult::new(ConvState::from_pending(rest)).with_effects([
                Effect::CancelReply { turn_id },
                Effect::NotifyStateChange,
            ]))
        }

        (_, Event::Close) => {
            let cancels = state.pending().iter().map(|p| Effect::CancelReply {
                turn_id: p.turn_id.clone(),
            });
            Ok(TransitionResult::new(ConvState::Closed)
                .with_effects(cancels)
                .with_effect(Effect::NotifyStateChange))
        }
    }
}

/// Split the pending reply for `turn_id` out of the state
fn take_pending(state: &ConvState, turn_id: &str) -> (Option<PendingReply>, Vec<PendingReply>) {
    let mut found = None;
    let mut rest = Vec::with_capacity(state.pending().len());
    for p in state.pending() {
        if found.is_none() && p.turn_id == turn_id {
            found = Some(p.clone());
        } else {
            rest.push(p.clone());
        }
    }
    (found, rest)
}
