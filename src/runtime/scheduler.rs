//! Deferred, cancellable delivery
//!
//! The controller talks to a `DeliveryScheduler` so tests can swap in a
//! scheduler that fires on demand instead of on a timer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Opaque reference to a scheduled delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryHandle(u64);

impl DeliveryHandle {
    #[cfg(test)]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Timed delivery of payloads back to their owner
///
/// Guarantees:
/// - a payload is delivered at most once, never before its delay elapses
/// - once `cancel` returns, the payload is never delivered
/// - deliveries happen in nondecreasing due-time order
pub trait DeliveryScheduler<P>: Send + 'static {
    fn schedule(&mut self, payload: P, delay: Duration) -> DeliveryHandle;

    /// Idempotent; unknown, fired and cancelled handles are ignored
    fn cancel(&mut self, handle: DeliveryHandle);

    fn cancel_all(&mut self);

    /// Scheduled but neither delivered nor cancelled
    fn pending(&self) -> usize;
}

enum Command<P> {
    Schedule {
        id: u64,
        due: Instant,
        payload: P,
    },
    Forget {
        id: u64,
    },
}

/// Production scheduler backed by one tokio driver task
///
/// The driver owns a due-time ordered queue and sends each payload into the
/// channel handed to `new`. The `live` set is the single point where firing
/// and cancelling race: whoever removes the id first wins.
pub struct TokioScheduler<P> {
    cmd_tx: mpsc::UnboundedSender<Command<P>>,
    live: Arc<Mutex<HashSet<u64>>>,
    shutdown: CancellationToken,
    next_id: u64,
}

impl<P: Send + 'static> TokioScheduler<P> {
    /// Must be called from within a tokio runtime
    pub fn new(out_tx: mpsc::Sender<P>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let live = Arc::new(Mutex::new(HashSet::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(drive(cmd_rx, out_tx, live.clone(), shutdown.clone()));

        Self {
            cmd_tx,
            live,
            shutdown,
            next_id: 1,
        }
    }
}

impl<P: Send + 'static> DeliveryScheduler<P> for TokioScheduler<P> {
    fn schedule(&mut self, payload: P, delay: Duration) -> DeliveryHandle {
        let id = self.next_id;
        self.next_id += 1;

        self.live.lock().unwrap().insert(id);
        let due = Instant::now() + delay;
        if self.cmd_tx.send(Command::Schedule { id, due, payload }).is_err() {
            tracing::warn!(delivery_id = id, "Delivery driver stopped, dropping payload");
            self.live.lock().unwrap().remove(&id);
        }
        DeliveryHandle(id)
    }

    fn cancel(&mut self, handle: DeliveryHandle) {
        let was_live = self.live.lock().unwrap().remove(&handle.0);
        if was_live {
            tracing::debug!(delivery_id = handle.0, "Delivery cancelled");
            let _ = self.cmd_tx.send(Command::Forget { id: handle.0 });
        }
    }

    fn cancel_all(&mut self) {
        let ids: Vec<u64> = self.live.lock().unwrap().drain().collect();
        for id in ids {
            let _ = self.cmd_tx.send(Command::Forget { id });
        }
    }

    fn pending(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl<P> Drop for TokioScheduler<P> {
    fn drop(&mut self) {
        self.live.lock().unwrap().clear();
        self.shutdown.cancel();
    }
}

async fn drive<P: Send + 'static>(
    mut cmd_rx: mpsc::UnboundedReceiver<Command<P>>,
    out_tx: mpsc::Sender<P>,
    live: Arc<Mutex<HashSet<u64>>>,
    shutdown: CancellationToken,
) {
    // (due, id) orders equal due times by scheduling order
    let mut queue: BTreeMap<(Instant, u64), P> = BTreeMap::new();
    let mut due_by_id: HashMap<u64, Instant> = HashMap::new();

    loop {
        let next_due = queue.keys().next().map(|(due, _)| *due);

        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Schedule { id, due, payload }) => {
                    queue.insert((due, id), payload);
                    due_by_id.insert(id, due);
                }
                Some(Command::Forget { id }) => {
                    if let Some(due) = due_by_id.remove(&id) {
                        queue.remove(&(due, id));
                    }
                }
                None => break,
            },

            () = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let Some(((_, id), payload)) = queue.pop_first() else {
                    continue;
                };
                due_by_id.remove(&id);

                let fire = live.lock().unwrap().remove(&id);
                if !fire {
                    continue;
                }
                if out_tx.send(payload).await.is_err() {
                    tracing::debug!(delivery_id = id, "Delivery receiver gone");
                    break;
                }
            }
        }
    }

    tracing::debug!(dropped = queue.len(), "Delivery driver stopped");
}
