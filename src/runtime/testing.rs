//! Test doubles for the runtime
//!
//! `ManualScheduler` fires deliveries only when a test asks it to, so
//! ordering and cancellation can be exercised without real timers.

use super::{ConversationController, DeliveryHandle, DeliveryScheduler, TranscriptEvent};
use crate::rules::{RuleMatcher, RuleSetConfig};
use crate::state_machine::{ConvContext, ConvState, Event};
use crate::transcript::{MessageLog, Sender, TranscriptEntry};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

// ============================================================================
// Manual Scheduler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Fired,
    Cancelled,
}

struct Scheduled {
    handle: DeliveryHandle,
    delay: Duration,
    payload: Event,
    slot: Slot,
}

#[derive(Default)]
struct ManualState {
    entries: Vec<Scheduled>,
    next_id: u64,
}

/// Scheduler that delivers only when told to
#[derive(Clone)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualState>>,
    tx: mpsc::Sender<Event>,
}

impl ManualScheduler {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState::default())),
            tx,
        }
    }

    /// Payloads still waiting, in due order
    pub fn pending_payloads(&self) -> Vec<Event> {
        let mut pending: Vec<(Duration, DeliveryHandle, Event)> = self
            .inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|s| s.slot == Slot::Pending)
            .map(|s| (s.delay, s.handle, s.payload.clone()))
            .collect();
        pending.sort_by_key(|(delay, handle, _)| (*delay, *handle));
        pending.into_iter().map(|(_, _, e)| e).collect()
    }

    /// Deliver the payload for a handle if it is still pending
    pub async fn fire(&self, handle: DeliveryHandle) -> bool {
        let payload = {
            let mut state = self.inner.lock().unwrap();
            let Some(entry) = state
                .entries
                .iter_mut()
                .find(|s| s.handle == handle && s.slot == Slot::Pending)
            else {
                return false;
            };
            entry.slot = Slot::Fired;
            entry.payload.clone()
        };
        self.tx.send(payload).await.is_ok()
    }

    /// Deliver everything pending, in due order; returns how many fired
    pub async fn fire_all(&self) -> usize {
        let mut handles: Vec<(Duration, DeliveryHandle)> = self
            .inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|s| s.slot == Slot::Pending)
            .map(|s| (s.delay, s.handle))
            .collect();
        handles.sort();

        let mut fired = 0;
        for (_, handle) in handles {
            if self.fire(handle).await {
                fired += 1;
            }
        }
        fired
    }

    /// Deliver pending payloads in reverse scheduling order
    pub async fn fire_all_reversed(&self) -> usize {
        let handles: Vec<DeliveryHandle> = self
            .inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .rev()
            .filter(|s| s.slot == Slot::Pending)
            .map(|s| s.handle)
            .collect();

        let mut fired = 0;
        for handle in handles {
            if self.fire(handle).await {
                fired += 1;
            }
        }
        fired
    }

    pub fn cancelled_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|s| s.slot == Slot::Cancelled)
            .count()
    }
}

impl DeliveryScheduler<Event> for ManualScheduler {
    fn schedule(&mut self, payload: Event, delay: Duration) -> DeliveryHandle {
        let mut state = self.inner.lock().unwrap();
        state.next_id += 1;
        let handle = DeliveryHandle::new(state.next_id);
        state.entries.push(Scheduled {
            handle,
            delay,
            payload,
            slot: Slot::Pending,
        });
        handle
    }

    fn cancel(&mut self, handle: DeliveryHandle) {
        let mut state = self.inner.lock().unwrap();
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|s| s.handle == handle && s.slot == Slot::Pending)
        {
            entry.slot = Slot::Cancelled;
        }
    }

    fn cancel_all(&mut self) {
        for entry in &mut self.inner.lock().unwrap().entries {
            if entry.slot == Slot::Pending {
                entry.slot = Slot::Cancelled;
            }
        }
    }

    fn pending(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|s| s.slot == Slot::Pending)
            .count()
    }
}

// ============================================================================
// Test Runtime Builder
// ============================================================================

/// A controller running on a `ManualScheduler`, with handles for driving it
pub struct TestRuntime {
    pub log: Arc<MessageLog>,
    pub scheduler: ManualScheduler,
    pub event_tx: mpsc::Sender<Event>,
    pub state_rx: watch::Receiver<ConvState>,
    pub broadcast_rx: broadcast::Receiver<TranscriptEvent>,
    next_turn: u64,
    _runtime_handle: tokio::task::JoinHandle<()>,
}

pub struct TestRuntimeBuilder {
    conv_id: String,
    config: RuleSetConfig,
    reply_delay: Duration,
}

impl TestRuntime {
    pub fn builder() -> TestRuntimeBuilder {
        TestRuntimeBuilder {
            conv_id: "test-conv".to_string(),
            config: RuleSetConfig::network_support(),
            reply_delay: Duration::from_millis(1000),
        }
    }
}

impl TestRuntimeBuilder {
    pub fn rules(mut self, config: RuleSetConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> TestRuntime {
        let catalog = self.config.into_catalog().expect("valid test catalog");
        let matcher = Arc::new(RuleMatcher::new(catalog.rule_set));
        let context = ConvContext::new(&self.conv_id, matcher).with_reply_delay(self.reply_delay);

        let log = Arc::new(MessageLog::new());
        let (event_tx, event_rx) = mpsc::channel(32);
        let (broadcast_tx, broadcast_rx) = broadcast::channel(128);
        let (state_tx, state_rx) = watch::channel(ConvState::Idle);
        let scheduler = ManualScheduler::new(event_tx.clone());

        let controller = ConversationController::new(
            context,
            log.clone(),
            scheduler.clone(),
            event_rx,
            state_tx,
            broadcast_tx,
        );
        let handle = tokio::spawn(controller.run());

        TestRuntime {
            log,
            scheduler,
            event_tx,
            state_rx,
            broadcast_rx,
            next_turn: 0,
            _runtime_handle: handle,
        }
    }
}

impl TestRuntime {
    /// Submit text and wait until the controller has handled it
    pub async fn submit(&mut self, text: &str) -> String {
        self.next_turn += 1;
        let turn_id = format!("turn-{}", self.next_turn);
        self.send(Event::user_message(text, turn_id.clone())).await;
        turn_id
    }

    pub async fn cancel(&mut self, turn_id: &str) {
        self.send(Event::CancelReply {
            turn_id: turn_id.to_string(),
        })
        .await;
    }

    pub async fn close(&mut self) {
        self.send(Event::Close).await;
    }

    /// Send an event and wait for the controller to drain its queue
    pub async fn send(&mut self, event: Event) {
        self.event_tx.send(event).await.expect("controller running");
        self.settle().await;
    }

    /// Wait until every queued event has been processed
    pub async fn settle(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.event_tx.capacity() < self.event_tx.max_capacity() {
            assert!(tokio::time::Instant::now() < deadline, "controller stalled");
            tokio::task::yield_now().await;
        }
        // The last event was received; give the controller a turn to finish it
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.log.snapshot()
    }

    pub fn texts(&self, sender: Sender) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.sender == sender)
            .map(|e| e.text)
            .collect()
    }

    /// Wait for the next transcript entry broadcast
    pub async fn next_entry(&mut self, timeout: Duration) -> Option<TranscriptEntry> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(50), self.broadcast_rx.recv()).await {
                Ok(Ok(TranscriptEvent::Entry { entry })) => return Some(entry),
                _ => continue,
            }
        }
        None
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ConversationSettings, RuntimeError, RuntimeManager};

    const FALLBACK: &str = "I'm sorry, I don't understand. Can you please provide more details about your networking issue?";

    fn assert_gapless(entries: &[TranscriptEntry]) {
        for (idx, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence, idx as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_manual_scheduler_respects_cancel() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut scheduler = ManualScheduler::new(tx);

        let a = scheduler.schedule(Event::reply_due("a"), Duration::from_millis(10));
        let b = scheduler.schedule(Event::reply_due("b"), Duration::from_millis(10));
        scheduler.cancel(a);
        scheduler.cancel(a);

        assert_eq!(scheduler.pending(), 1);
        assert!(!scheduler.fire(a).await);
        assert!(scheduler.fire(b).await);
        assert!(!scheduler.fire(b).await);
        assert_eq!(rx.recv().await, Some(Event::reply_due("b")));
        assert_eq!(scheduler.cancelled_count(), 1);
    }

    #[tokio::test]
    async fn test_user_entry_immediate_bot_entry_deferred() {
        let mut rt = TestRuntime::builder().build();
        rt.submit("my internet is really slow today").await;

        let entries = rt.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sender, Sender::User);
        assert!(rt.state_rx.borrow().is_awaiting_reply());

        assert_eq!(rt.scheduler.fire_all().await, 1);
        rt.settle().await;

        let entries = rt.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sender, Sender::Bot);
        assert!(entries[1].text.starts_with("If your internet is slow"));
        assert_eq!(entries[1].turn_id, entries[0].turn_id);
        assert_eq!(*rt.state_rx.borrow(), ConvState::Idle);
    }

    #[tokio::test]
    async fn test_reply_uses_configured_delay() {
        let mut rt = TestRuntime::builder().build();
        rt.submit("ip conflict").await;
        let scheduled = rt.scheduler.pending_payloads();
        assert_eq!(scheduled.len(), 1);
        assert!(matches!(&scheduled[0], Event::ReplyDue { turn_id } if turn_id == "turn-1"));
    }

    #[tokio::test]
    async fn test_blank_submissions_leave_log_unchanged() {
        let mut rt = TestRuntime::builder().build();
        rt.submit("").await;
        rt.submit("   ").await;
        rt.submit("\t\n").await;

        assert!(rt.entries().is_empty());
        assert_eq!(rt.scheduler.pending(), 0);
        assert_eq!(*rt.state_rx.borrow(), ConvState::Idle);
    }

    #[tokio::test]
    async fn test_unknown_topic_gets_fallback() {
        let mut rt = TestRuntime::builder().build();
        rt.submit("my printer is broken").await;
        rt.scheduler.fire_all().await;
        rt.settle().await;

        assert_eq!(rt.texts(Sender::Bot), vec![FALLBACK.to_string()]);
    }

    #[tokio::test]
    async fn test_rapid_submissions_each_get_own_reply() {
        let mut rt = TestRuntime::builder().build();
        let first = rt.submit("slow internet").await;
        let second = rt.submit("ip conflict").await;

        let users: Vec<_> = rt.entries().into_iter().map(|e| e.turn_id).collect();
        assert_eq!(users, vec![Some(first.clone()), Some(second.clone())]);

        // Deliver the second reply first
        rt.scheduler.fire_all_reversed().await;
        rt.settle().await;

        let entries = rt.entries();
        assert_eq!(entries.len(), 4);
        assert_gapless(&entries);

        let reply_for = |turn: &str| {
            entries
                .iter()
                .find(|e| e.sender == Sender::Bot && e.turn_id.as_deref() == Some(turn))
                .map(|e| e.text.clone())
                .unwrap()
        };
        assert!(reply_for(&first).starts_with("If your internet is slow"));
        assert!(reply_for(&second).starts_with("To resolve an IP address conflict"));
    }

    #[tokio::test]
    async fn test_n_submissions_produce_n_user_entries_in_order() {
        let mut rt = TestRuntime::builder().build();
        let inputs = ["slow internet", "wifi won't connect", "hello", "ip conflict", "x"];
        for (i, text) in inputs.iter().enumerate() {
            rt.submit(text).await;
            if i % 2 == 0 {
                rt.scheduler.fire_all().await;
                rt.settle().await;
            }
        }

        let entries = rt.entries();
        assert_gapless(&entries);
        assert_eq!(rt.texts(Sender::User), inputs.map(String::from).to_vec());
        assert!(rt.texts(Sender::Bot).len() <= inputs.len());

        rt.scheduler.fire_all().await;
        rt.settle().await;
        assert_eq!(rt.texts(Sender::Bot).len(), inputs.len());
    }

    #[tokio::test]
    async fn test_cancelled_turn_never_replies() {
        let mut rt = TestRuntime::builder().build();
        let kept = rt.submit("slow internet").await;
        let dropped = rt.submit("ip conflict").await;

        rt.cancel(&dropped).await;
        assert_eq!(rt.scheduler.cancelled_count(), 1);

        rt.scheduler.fire_all().await;
        // A stale timer event for the cancelled turn is ignored
        rt.send(Event::reply_due(dropped.clone())).await;

        let bot_turns: Vec<_> = rt
            .entries()
            .into_iter()
            .filter(|e| e.sender == Sender::Bot)
            .filter_map(|e| e.turn_id)
            .collect();
        assert_eq!(bot_turns, vec![kept]);
    }

    #[tokio::test]
    async fn test_close_cancels_outstanding_replies() {
        let mut rt = TestRuntime::builder().build();
        rt.submit("slow internet").await;
        rt.submit("can't connect to wifi").await;
        rt.close().await;

        assert_eq!(rt.scheduler.pending(), 0);
        assert_eq!(rt.scheduler.fire_all().await, 0);
        assert_eq!(rt.entries().len(), 2);
        assert_eq!(*rt.state_rx.borrow(), ConvState::Closed);
    }

    #[tokio::test]
    async fn test_broadcasts_entries() {
        let mut rt = TestRuntime::builder().build();
        rt.submit("ip conflict").await;

        let user = rt.next_entry(Duration::from_secs(1)).await.unwrap();
        assert_eq!(user.sender, Sender::User);

        rt.scheduler.fire_all().await;
        let bot = rt.next_entry(Duration::from_secs(1)).await.unwrap();
        assert_eq!(bot.sender, Sender::Bot);
        assert_eq!(bot.sequence, 2);
    }

    #[tokio::test]
    async fn test_custom_rules() {
        let config: RuleSetConfig = serde_json::from_value(serde_json::json!({
            "fallback_response": "No idea",
            "rules": [
                { "keywords": ["dns"], "response": "Flush DNS" },
                { "keywords": ["dns", "slow"], "response": "Change resolver", "priority": 1 }
            ]
        }))
        .unwrap();
        let mut rt = TestRuntime::builder().rules(config).build();

        rt.submit("DNS is slow").await;
        rt.submit("dns broken").await;
        rt.submit("ping").await;
        rt.scheduler.fire_all().await;
        rt.settle().await;

        assert_eq!(
            rt.texts(Sender::Bot),
            vec!["Change resolver", "Flush DNS", "No idea"]
        );
    }

    // ------------------------------------------------------------------
    // RuntimeManager with the real scheduler
    // ------------------------------------------------------------------

    fn settings(delay_ms: u64, greeting: Option<&str>) -> ConversationSettings {
        let catalog = RuleSetConfig::network_support().into_catalog().unwrap();
        ConversationSettings {
            matcher: Arc::new(RuleMatcher::new(catalog.rule_set)),
            reply_delay: Duration::from_millis(delay_ms),
            greeting: greeting.map(String::from),
            idle_timeout: None,
        }
    }

    fn manager(delay_ms: u64, greeting: Option<&str>) -> Arc<RuntimeManager> {
        Arc::new(RuntimeManager::new(settings(delay_ms, greeting)))
    }

    async fn wait_for_entries(mgr: &RuntimeManager, id: &str, count: usize) -> Vec<TranscriptEntry> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let entries = mgr.snapshot(id).await.unwrap();
            if entries.len() >= count || tokio::time::Instant::now() >= deadline {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_manager_end_to_end() {
        let mgr = manager(20, Some("Hello!"));
        let id = mgr.create().await;

        let turn = mgr.submit(&id, "can't connect to wifi").await.unwrap();
        assert!(turn.is_some());
        assert_eq!(mgr.submit(&id, "   ").await.unwrap(), None);

        let entries = wait_for_entries(&mgr, &id, 3).await;
        assert_eq!(entries.len(), 3);
        assert_gapless(&entries);
        assert_eq!(entries[0].text, "Hello!");
        assert_eq!(entries[0].turn_id, None);
        assert_eq!(entries[1].turn_id, turn);
        assert!(entries[2].text.starts_with("If you're having trouble connecting to WiFi"));

        assert_eq!(mgr.entries_after(&id, 2).await.unwrap().len(), 1);
        assert_eq!(mgr.state(&id).await.unwrap(), ConvState::Idle);
    }

    #[tokio::test]
    async fn test_manager_close_prevents_late_reply() {
        let mgr = manager(50, None);
        let id = mgr.create().await;
        let handle = mgr.handle(&id).await.unwrap();

        mgr.submit(&id, "slow internet").await.unwrap();
        mgr.close(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let entries = handle.log.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sender, Sender::User);

        assert!(matches!(
            mgr.submit(&id, "hello").await,
            Err(RuntimeError::NotFound(_))
        ));
        assert!(matches!(mgr.close(&id).await, Err(RuntimeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_manager_cancel_reply() {
        let mgr = manager(50, None);
        let id = mgr.create().await;

        let turn = mgr.submit(&id, "ip conflict").await.unwrap().unwrap();
        mgr.cancel_reply(&id, &turn).await.unwrap();
        // Unknown turns are ignored
        mgr.cancel_reply(&id, "no-such-turn").await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(mgr.snapshot(&id).await.unwrap().len(), 1);
        assert_eq!(mgr.state(&id).await.unwrap(), ConvState::Idle);
    }

    #[tokio::test]
    async fn test_manager_list_and_close_all() {
        let mgr = manager(1000, Some("hi"));
        let a = mgr.create().await;
        let b = mgr.create().await;
        mgr.submit(&a, "slow internet").await.unwrap();

        let mut listed = mgr.list().await;
        listed.sort_by_key(|s| s.entries);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].conversation_id, b);
        assert_eq!(listed[1].entries, 2);

        mgr.close_all().await;
        assert!(mgr.list().await.is_empty());
        assert!(matches!(mgr.snapshot(&a).await, Err(RuntimeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_viewer_detach_closes_conversation() {
        let mgr = manager(50, None);
        let id = mgr.create().await;
        let untouched: Vec<String> = futures::future::join_all((0..5).map(|_| mgr.create())).await;
        assert_eq!(mgr.list().await.len(), 6);

        let (rx, viewer) = mgr.attach_viewer(&id).await.unwrap();
        let handle = mgr.handle(&id).await.unwrap();
        mgr.submit(&id, "slow internet").await.unwrap();

        drop(rx);
        drop(viewer);
        tokio::time::sleep(Duration::from_millis(150)).await;

        // The pending reply was cancelled with the view
        let entries = handle.log.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sender, Sender::User);
        assert!(matches!(mgr.state(&id).await, Err(RuntimeError::NotFound(_))));

        // Conversations that never had a viewer are left alone
        let open: Vec<String> = mgr.list().await.into_iter().map(|s| s.conversation_id).collect();
        assert_eq!(open.len(), untouched.len());
        assert!(!open.contains(&id));
    }

    #[tokio::test]
    async fn test_conversation_survives_while_any_viewer_remains() {
        let mgr = manager(20, None);
        let id = mgr.create().await;

        let (_rx_a, viewer_a) = mgr.attach_viewer(&id).await.unwrap();
        let (_rx_b, viewer_b) = mgr.attach_viewer(&id).await.unwrap();
        drop(viewer_a);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(mgr.handle(&id).await.is_ok());

        mgr.submit(&id, "ip conflict").await.unwrap();
        assert_eq!(wait_for_entries(&mgr, &id, 2).await.len(), 2);

        drop(viewer_b);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mgr.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_idle_conversations_expire() {
        let mgr = RuntimeManager::start(ConversationSettings {
            idle_timeout: Some(Duration::from_millis(40)),
            ..settings(150, None)
        });

        let watched = mgr.create().await;
        let (_rx, _viewer) = mgr.attach_viewer(&watched).await.unwrap();

        let abandoned = mgr.create().await;
        let handle = mgr.handle(&abandoned).await.unwrap();
        mgr.submit(&abandoned, "slow internet").await.unwrap();
        for _ in 0..20 {
            mgr.create().await;
        }

        tokio::time::sleep(Duration::from_millis(300)).await;

        let open: Vec<String> = mgr.list().await.into_iter().map(|s| s.conversation_id).collect();
        assert_eq!(open, vec![watched]);
        // Expiry closed it before the reply was due
        assert_eq!(handle.log.len(), 1);
        assert!(matches!(
            mgr.submit(&abandoned, "hello").await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_activity_defers_expiry() {
        let mgr = manager(1000, None);
        let id = mgr.create().await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.snapshot(&id).await.unwrap();
        assert_eq!(mgr.expire_idle(Duration::from_millis(25)).await, 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mgr.expire_idle(Duration::from_millis(25)).await, 1);
        assert!(mgr.list().await.is_empty());
    }
}
