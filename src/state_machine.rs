//! Per-conversation state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions:
//! `transition` decides, the controller executes the returned effects.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;


pub use effect::Effect;
pub use event::Event;
pub use state::{ConvContext, ConvState, PendingReply, DEFAULT_REPLY_DELAY};
#[allow(unused_imports)] // Public API re-exports
pub use transition::{transition, TransitionError, TransitionResult};
