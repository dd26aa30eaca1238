//! Cooperative shutdown signalling.
//!
//! A [`ShutdownHandle`] flips the flag once; any number of cloned
//! [`ShutdownSignal`]s observe it. In-flight transactions are never torn
//! down: callers check the signal before starting new work and the retry
//! driver races its backoff sleep against it.

use tokio::sync::watch;

/// Sender half. Dropping it without calling [`ShutdownHandle::shutdown`]
/// leaves the signal unset forever.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Receiver half, cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair.
pub fn shutdown_pair() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    /// Signal shutdown to every receiver.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// True once shutdown has been signalled.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when shutdown is signalled. Pending forever when the handle
    /// was dropped without signalling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without signalling; nothing left to observe.
                std::future::pending::<()>().await;
            }
        }
    }
}
