//! Cooperative cancellation primitives
//!
//! Cancellation is cooperative: the engine checks the signal between any two
//! suspension points and stops before the next node, writing a final
//! checkpoint with status `cancelled`.

use tokio::sync::watch;

/// Caller-side handle that triggers cancellation
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether cancellation was already requested
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Engine/node-side view of the cancellation state
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// A signal that never fires, for callers without a handle
    ///
    /// The sender drops immediately; `is_cancelled` keeps reading the last
    /// sent value (`false`) and `cancelled` parks forever on the closed
    /// channel.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling; never resolves.
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// Create a linked handle/signal pair
pub fn cancellation_pair() -> (CancelHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancellationSignal { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_propagates() {
        let (handle, signal) = cancellation_pair();
        assert!(!signal.is_cancelled());

        handle.cancel();
        assert!(signal.is_cancelled());
        signal.cancelled().await; // resolves immediately
    }

    #[tokio::test]
    async fn test_never_signal_stays_quiet() {
        let signal = CancellationSignal::never();
        assert!(!signal.is_cancelled());
    }
}
