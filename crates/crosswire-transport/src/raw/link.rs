//! Link-layer I/O seam for the raw transport.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::codec::MacAddr;
use crate::error::{Result, TransportError};

/// Something that moves whole Ethernet frames.
#[async_trait]
pub trait FrameLink: Send + Sync {
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Next frame addressed to us or to broadcast. Returns
    /// [`TransportError::Closed`] once the link is gone.
    async fn recv(&self) -> Result<Vec<u8>>;

    fn local_mac(&self) -> MacAddr;
}

// ---------------------------------------------------------------------------
// In-memory hub
// ---------------------------------------------------------------------------

/// A shared segment for tests: every attached link sees broadcast frames
/// and frames addressed to its MAC, but never its own transmissions.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    ports: Arc<Mutex<Vec<(MacAddr, mpsc::UnboundedSender<Vec<u8>>)>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, mac: MacAddr) -> MemoryLink {
        let (tx, rx) = mpsc::unbounded_channel();
        self.ports.lock().push((mac, tx));
        MemoryLink {
            mac,
            hub: self.clone(),
            rx: AsyncMutex::new(rx),
        }
    }

    fn forward(&self, from: MacAddr, frame: &[u8]) {
        if frame.len() < 6 {
            return;
        }
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&frame[..6]);
        let dst = MacAddr(dst);

        let mut ports = self.ports.lock();
        ports.retain(|(_, tx)| !tx.is_closed());
        for (mac, tx) in ports.iter() {
            if *mac == from {
                continue;
            }
            if dst.is_broadcast() || dst == *mac {
                let _ = tx.send(frame.to_vec());
            }
        }
    }
}

#[derive(Debug)]
pub struct MemoryLink {
    mac: MacAddr,
    hub: MemoryHub,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl FrameLink for MemoryLink {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        self.hub.forward(self.mac, frame);
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    fn local_mac(&self) -> MacAddr {
        self.mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MacAddr = MacAddr([2, 0, 0, 0, 0, 1]);
    const B: MacAddr = MacAddr([2, 0, 0, 0, 0, 2]);
    const C: MacAddr = MacAddr([2, 0, 0, 0, 0, 3]);

    fn frame_to(dst: MacAddr) -> Vec<u8> {
        let mut f = dst.0.to_vec();
        f.extend_from_slice(&[0u8; 8]);
        f
    }

    #[tokio::test]
    async fn test_hub_broadcast_and_unicast() {
        let hub = MemoryHub::new();
        let a = hub.attach(A);
        let b = hub.attach(B);
        let c = hub.attach(C);

        a.send(&frame_to(MacAddr::BROADCAST)).await.unwrap();
        assert_eq!(&b.recv().await.unwrap()[..6], &[0xFF; 6]);
        assert_eq!(&c.recv().await.unwrap()[..6], &[0xFF; 6]);

        a.send(&frame_to(C)).await.unwrap();
        assert_eq!(&c.recv().await.unwrap()[..6], &C.0);

        // A never hears itself and B never saw the unicast.
        b.send(&frame_to(A)).await.unwrap();
        assert_eq!(&a.recv().await.unwrap()[..6], &A.0);
    }
}
