use tokio::sync::watch;

/// A cooperative cancellation flag observed by subscription producer tasks
/// between `next()` calls. Cloning shares the same underlying signal.
///
/// Built on a `watch` channel (not a bare `AtomicBool` + `Notify`) so that
/// `cancelled()` can't miss a `cancel()` that races ahead of it — `watch`
/// always observes the latest value, even for a waiter that subscribes after
/// the change.
#[derive(Clone)]
pub struct CancelSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Signal cancellation; any pending or future [`Self::cancelled`] call observes it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`Self::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
