use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Cancellation signal shared by the simulator and every worker.
///
/// The signal is a zero-capacity channel that never carries a message:
/// cancelling drops the sole [`Sender`], which disconnects every cloned
/// [`Receiver`] at once. Disconnection is monotonic (a channel never
/// reconnects) and the receiver half can sit in a `select!` arm alongside a
/// data operation, which is exactly what the worker loops need.
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    // Taken on the first cancel; the Mutex is the stop-once guard.
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            inner: Arc::new(CancelInner {
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Signal cancellation. Idempotent: later calls are no-ops.
    pub fn cancel(&self) {
        drop(self.inner.tx.lock().take());
    }

    /// A fresh observer of this handle's signal.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.inner.rx.clone(),
        }
    }
}

impl Clone for CancelHandle {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the cancellation signal, cloned into every worker.
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl CancelToken {
    /// Non-blocking check, used at the top of the generator loop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// The raw receiver, for use as a `select!` arm. It becomes ready
    /// (disconnected) when the handle cancels.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::select;
    use std::time::Duration;

    #[test]
    fn test_token_observes_cancel() {
        let handle = CancelHandle::new();
        let token = handle.token();
        assert!(!token.is_cancelled());

        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = CancelHandle::new();
        handle.cancel();
        handle.cancel();
        assert!(handle.token().is_cancelled());
    }

    #[test]
    fn test_clone_shares_signal() {
        let handle = CancelHandle::new();
        let other = handle.clone();
        let token = other.token();

        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_token_is_selectable() {
        let handle = CancelHandle::new();
        let token = handle.token();

        let waiter = std::thread::spawn(move || {
            select! {
                recv(token.receiver()) -> _ => true,
                default(Duration::from_secs(5)) => false,
            }
        });

        handle.cancel();
        assert!(waiter.join().unwrap());
    }
}
