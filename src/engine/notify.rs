use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// Single-slot, coalescing "state changed" signal.
///
/// Sending never blocks: if a signal is already pending the send is dropped.
/// Consumers wait with [`ChangeNotifier::changed`] and then re-read the full
/// state from the store; no diff is carried.
pub struct ChangeNotifier {
    tx: Mutex<Option<mpsc::Sender<()>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Raise the signal. Returns `true` if this call queued a new signal,
    /// `false` if one was already pending or the notifier is closed.
    pub fn notify(&self) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx.try_send(()).is_ok(),
            None => false,
        }
    }

    /// Wait for the next signal. Returns `false` once the notifier has been
    /// closed and no signal remains pending.
    pub async fn changed(&self) -> bool {
        self.rx.lock().await.recv().await.is_some()
    }

    /// Consume a pending signal without waiting.
    pub fn try_take(&self) -> bool {
        match self.rx.try_lock() {
            Ok(mut rx) => rx.try_recv().is_ok(),
            Err(_) => false,
        }
    }

    /// Stop accepting signals and wake any waiters once drained.
    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
