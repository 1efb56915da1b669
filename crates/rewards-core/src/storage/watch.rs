//! Live total-points subscriptions.
//!
//! Watchers receive the new total after every committed mutation affecting
//! their user. Delivery goes through an unbounded channel so the mutating
//! thread never blocks on a slow subscriber; a dropped or unsubscribed
//! watcher is pruned on the next notification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A live subscription to one user's point total.
///
/// No further values are delivered after `unsubscribe` (or drop).
pub struct TotalPointsWatch {
    rx: Receiver<i64>,
    alive: Arc<AtomicBool>,
}

impl TotalPointsWatch {
    /// Next value if one is already queued.
    pub fn try_recv(&self) -> Option<i64> {
        self.rx.try_recv().ok()
    }

    /// Block up to `timeout` for the next value.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<i64> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// End the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for TotalPointsWatch {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

struct WatchSender {
    tx: Sender<i64>,
    alive: Arc<AtomicBool>,
}

/// Per-user watcher registry shared by the store backends.
#[derive(Default)]
pub(crate) struct WatchRegistry {
    watchers: Mutex<HashMap<String, Vec<WatchSender>>>,
}

impl WatchRegistry {
    /// The registry holds only sender handles, which stay usable after a
    /// panic elsewhere; recover the guard rather than poisoning every
    /// later mutation.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<WatchSender>>> {
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a watcher; the current total is delivered immediately.
    pub fn subscribe(&self, user_id: &str, current_total: i64) -> TotalPointsWatch {
        let (tx, rx) = channel();
        let alive = Arc::new(AtomicBool::new(true));
        // Seed the subscription so callers see a value without waiting for
        // the next mutation.
        let _ = tx.send(current_total);
        self.lock()
            .entry(user_id.to_string())
            .or_default()
            .push(WatchSender {
                tx,
                alive: Arc::clone(&alive),
            });
        TotalPointsWatch { rx, alive }
    }

    /// Deliver `total` to every live watcher of `user_id`, pruning dead ones.
    pub fn notify(&self, user_id: &str, total: i64) {
        let mut watchers = self.lock();
        if let Some(list) = watchers.get_mut(user_id) {
            list.retain(|w| w.alive.load(Ordering::SeqCst) && w.tx.send(total).is_ok());
            if list.is_empty() {
                watchers.remove(user_id);
            }
        }
    }
}
