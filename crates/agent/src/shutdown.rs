//! Cooperative shutdown signal shared by every agent loop.
//!
//! A thin wrapper over a `tokio::sync::watch` channel. Loops select on
//! [`ShutdownSignal::wait`] with a `biased` arm first, so cancellation
//! deterministically wins over timers and channel receives. Dropping the
//! [`ShutdownNotifier`] counts as shutdown, so a torn-down agent can never
//! strand a loop.

use tokio::sync::watch;

/// Sender half; owned by the agent, triggered exactly once.
#[derive(Debug)]
pub struct ShutdownNotifier {
    tx: watch::Sender<bool>,
}

impl ShutdownNotifier {
    pub fn notify(&self) {
        // Receivers observe the value, not the send count; re-notifying
        // is harmless.
        let _ = self.tx.send(true);
    }
}

/// Receiver half; cheap to clone, one per loop.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Completes once shutdown has been signalled (or the notifier was
    /// dropped). Completes immediately if it already has been.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Non-blocking check, for loop re-entry points between awaits.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Creates a connected notifier/signal pair.
#[must_use]
pub fn channel() -> (ShutdownNotifier, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownNotifier { tx }, ShutdownSignal { rx })
}
