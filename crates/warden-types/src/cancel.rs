/// Request cancellation signalling.
///
/// The caller keeps a [`CancelHandle`]; every suspension point inside the
/// pipeline holds a cloned [`CancelSignal`] and races it against its work.
use tokio::sync::watch;

/// Caller side: fires the cancellation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Pipeline side: observes the cancellation.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    /// Cancel the request. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// A signal observing this handle.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    ///
    /// Pends forever if the handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let (handle, signal) = cancel_pair();
        let waiter = tokio::spawn(async move { signal.cancelled().await });
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let (handle, signal) = cancel_pair();
        handle.cancel();
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_does_not_fire() {
        let signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(result.is_err());
        assert!(!signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_does_not_fire() {
        let (handle, signal) = cancel_pair();
        drop(handle);
        let result = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
