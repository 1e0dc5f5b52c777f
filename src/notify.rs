//! Wakeup notifications for in-process workers.
//!
//! Wakeups are hints: the channel overflows by dropping the oldest entry,
//! and a worker that misses one still finds the work on its next poll.

use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender, TrySendError};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wakeup {
    /// A product reached a state that may satisfy its dependents
    ProductReady { pid: String },
    /// A new edge was declared
    DependencyAdded { downstream: String },
    /// A stale product was put back up for grabs
    Requeued { pid: String },
}

#[derive(Clone)]
pub struct Notifier {
    tx: Sender<Wakeup>,
    // keeps the channel open while nobody listens
    _keepalive: InactiveReceiver<Wakeup>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = broadcast(capacity.max(1));
        tx.set_overflow(true);
        Self {
            tx,
            _keepalive: rx.deactivate(),
        }
    }

    pub fn notify(&self, wakeup: Wakeup) {
        match self.tx.try_broadcast(wakeup) {
            Ok(Some(dropped)) => trace!("Wakeup overflow dropped {:?}", dropped),
            Ok(None) => {}
            Err(TrySendError::Inactive(_)) => {}
            Err(e) => debug!("Wakeup not delivered: {}", e),
        }
    }

    pub fn subscribe(&self) -> Receiver<Wakeup> {
        self.tx.new_receiver()
    }
}
