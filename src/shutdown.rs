//! Cooperative shutdown signal.
//!
//! Every suspension point of the pipeline (feed polls, backoff sleeps,
//! delivery waits) observes the same signal. Triggering drops the only
//! sender, so every blocked `recv_timeout` wakes immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

#[derive(Debug)]
struct Inner {
    triggered: AtomicBool,
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

/// Clonable shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        if self.inner.triggered.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut guard) = self.inner.tx.lock() {
            guard.take();
        }
    }

    /// True once triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Sleeps for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` if the full duration elapsed, `false` on shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        match self.inner.rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => true,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Receiver that disconnects on shutdown, for use in `select!`.
    #[must_use]
    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.rx
    }
}
