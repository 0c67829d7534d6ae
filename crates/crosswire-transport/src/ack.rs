//! One-shot ACK registry for the raw transport.
//!
//! A sender registers its sequence number and gets back an [`AckGuard`].
//! The first ACK frame for that sequence completes the guard; later ones
//! find nothing registered and are dropped. Dropping the guard, whether
//! after success, timeout or cancellation, removes the registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Default)]
pub struct PendingAcks {
    waiters: Arc<Mutex<HashMap<u32, oneshot::Sender<()>>>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the ACK for `sequence`. A second registration
    /// for the same sequence replaces the first.
    pub fn register(&self, sequence: u32) -> AckGuard {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(sequence, tx);
        AckGuard {
            sequence,
            rx,
            waiters: Arc::clone(&self.waiters),
        }
    }

    /// Deliver an ACK. Returns `true` if a waiter was signalled.
    pub fn resolve(&self, sequence: u32) -> bool {
        match self.waiters.lock().remove(&sequence) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct AckGuard {
    sequence: u32,
    rx: oneshot::Receiver<()>,
    waiters: Arc<Mutex<HashMap<u32, oneshot::Sender<()>>>>,
}

impl AckGuard {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Wait up to `timeout` for the ACK. Can be called again after a
    /// timeout; returns `true` once the ACK has arrived.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, &mut self.rx).await, Ok(Ok(())))
    }
}

impl Drop for AckGuard {
    fn drop(&mut self) {
        self.waiters.lock().remove(&self.sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_ack_fires_once() {
        let acks = PendingAcks::new();
        let mut guard = acks.register(42);

        assert!(acks.resolve(42));
        assert!(!acks.resolve(42));
        assert!(guard.wait(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_timeout_then_late_ack() {
        let acks = PendingAcks::new();
        let mut guard = acks.register(7);

        assert!(!guard.wait(Duration::from_millis(10)).await);
        assert_eq!(acks.len(), 1);
        assert!(acks.resolve(7));
        assert!(guard.wait(Duration::from_millis(10)).await);
    }

    #[test]
    fn test_guard_unregisters_on_drop() {
        let acks = PendingAcks::new();
        {
            let _guard = acks.register(1);
            let _other = acks.register(2);
            assert_eq!(acks.len(), 2);
        }
        assert!(acks.is_empty());
        assert!(!acks.resolve(1));
    }
}
