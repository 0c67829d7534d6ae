//! Raw Ethernet broadcast transport.
//!
//! Every outbound [`TransportMessage`] is serialized, split into frames by
//! [`codec::encode`] and written to the link one frame at a time. Inbound
//! frames go through checksum validation, frame reassembly and the seen
//! cache before reaching subscribers.
//!
//! Discovery is a two-line exchange: clients broadcast `DISCOVER|` and
//! servers that have called [`Transport::announce`] reply with
//! `ANNOUNCE|<hash8>|<version>` to the prober's MAC.

pub mod link;
pub mod packet;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crosswire_shared::types::{FrameType, TransportMode};

use crate::ack::PendingAcks;
use crate::codec::{self, Frame, MacAddr, FLAG_ACK_REQUESTED};
use crate::error::{Result, TransportError};
use crate::reassembly::{Reassembler, DEFAULT_IDLE_TIMEOUT};
use crate::seen::{SeenCache, SEEN_CLEANUP_INTERVAL};
use crate::transport::{
    announce_payload, parse_announce, PeerInfo, ServiceInfo, StatsCounter, Subscribers,
    Transport, TransportConfig, TransportMessage, TransportStats, DISCOVER_PAYLOAD,
};

pub use link::{FrameLink, MemoryHub, MemoryLink};
pub use packet::PacketLink;

/// Reassembly GC cadence.
const GC_INTERVAL: Duration = Duration::from_secs(60);

pub struct RawTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    link: Arc<dyn FrameLink>,
    sequence: AtomicU32,
    reassembler: Reassembler<String>,
    seen: SeenCache,
    acks: PendingAcks,
    peers: Mutex<HashMap<MacAddr, PeerInfo>>,
    service: Mutex<Option<ServiceInfo>>,
    subscribers: Subscribers,
    stats: StatsCounter,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl RawTransport {
    /// Use an already opened link (tests attach to a [`MemoryHub`]).
    pub fn new(config: TransportConfig, link: Arc<dyn FrameLink>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let subscribers = Subscribers::new(config.recv_buffer);
        Self {
            inner: Arc::new(Inner {
                config,
                link,
                sequence: AtomicU32::new(1),
                reassembler: Reassembler::new(DEFAULT_IDLE_TIMEOUT),
                seen: SeenCache::default(),
                acks: PendingAcks::new(),
                peers: Mutex::new(HashMap::new()),
                service: Mutex::new(None),
                subscribers,
                stats: StatsCounter::default(),
                running: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Open an `AF_PACKET` socket on `config.interface`.
    pub fn open(config: TransportConfig) -> Result<Self> {
        let link = PacketLink::open(&config.interface)?;
        Ok(Self::new(config, Arc::new(link)))
    }

    pub fn local_mac(&self) -> MacAddr {
        self.inner.link.local_mac()
    }

    /// Send and wait for the first ACK, resending all frames after each
    /// `retry_delay` until `max_retries` is exhausted.
    pub async fn send_with_ack(&self, dst: MacAddr, msg: TransportMessage) -> Result<()> {
        self.inner.transmit(dst, msg, true).await
    }

    /// ACK waiters currently registered.
    pub fn pending_acks(&self) -> usize {
        self.inner.acks.len()
    }
}

impl Inner {
    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_frames(&self, frames: &[Frame]) -> Result<()> {
        for frame in frames {
            let bytes = frame.to_bytes();
            if let Err(e) = self.link.send(&bytes).await {
                self.stats.record_error();
                return Err(e);
            }
            self.stats.record_sent(bytes.len());
        }
        Ok(())
    }

    async fn transmit(&self, dst: MacAddr, mut msg: TransportMessage, want_ack: bool) -> Result<()> {
        let sequence = self.next_sequence();
        msg.sequence = sequence;
        if msg.sender_addr.is_empty() {
            msg.sender_addr = self.link.local_mac().to_string();
        }

        let body = msg.to_bytes()?;
        let flags = if want_ack { FLAG_ACK_REQUESTED } else { 0 };
        let frames = codec::encode(
            dst,
            self.link.local_mac(),
            msg.kind,
            sequence,
            &body,
            self.config.chunk_size,
            flags,
        )?;

        // Our own broadcast may be reflected back by some links.
        self.seen.insert(&msg.id);

        if !want_ack {
            self.write_frames(&frames).await?;
            self.stats.record_message_sent();
            return Ok(());
        }

        let mut guard = self.acks.register(sequence);
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                self.stats.record_retry();
                debug!(sequence, attempt, "no ACK yet, resending frames");
            }
            self.write_frames(&frames).await?;
            if guard.wait(self.config.retry_delay).await {
                self.stats.record_message_sent();
                return Ok(());
            }
        }

        self.stats.record_error();
        Err(TransportError::Timeout("ACK"))
    }

    async fn send_control(&self, dst: MacAddr, frame_type: FrameType, sequence: u32, payload: Vec<u8>) {
        let frame = Frame::single(dst, self.link.local_mac(), frame_type, sequence, payload);
        if let Err(e) = self.write_frames(std::slice::from_ref(&frame)).await {
            warn!(error = %e, ?frame_type, "failed to send control frame");
        }
    }

    async fn handle_raw(&self, raw: Vec<u8>) {
        self.stats.record_received(raw.len());

        let frame = match codec::decode(&raw) {
            Ok(f) => f,
            Err(e) => {
                self.stats.record_error();
                trace!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        let local = self.link.local_mac();
        if frame.src == local || !(frame.dst.is_broadcast() || frame.dst == local) {
            return;
        }

        match frame.frame_type {
            FrameType::Ack => {
                if !self.acks.resolve(frame.sequence) {
                    trace!(sequence = frame.sequence, "ACK with no waiter");
                }
            }
            FrameType::Nack => {
                self.stats.record_nack();
                debug!(sequence = frame.sequence, src = %frame.src, "NACK received, ignoring");
            }
            FrameType::Discover => self.handle_discover(frame).await,
            FrameType::Data | FrameType::Control | FrameType::Auth => {
                self.handle_payload(frame).await
            }
        }
    }

    async fn handle_discover(&self, frame: Frame) {
        if frame.payload.starts_with(DISCOVER_PAYLOAD) {
            let reply = self.service.lock().as_ref().map(announce_payload);
            if let Some(reply) = reply {
                debug!(to = %frame.src, "answering discovery probe");
                let sequence = self.next_sequence();
                self.send_control(frame.src, FrameType::Discover, sequence, reply)
                    .await;
            }
            return;
        }

        if let Some((hash, version)) = parse_announce(&frame.payload) {
            let peer = PeerInfo {
                id: frame.src.to_string(),
                address: frame.src.to_string(),
                mode: TransportMode::Arp,
                last_seen: Utc::now(),
                channel_id_hash: hash,
                version,
            };
            debug!(peer = %peer.address, hash = %peer.channel_id_hash, "discovered server");
            self.peers.lock().insert(frame.src, peer);
        }
    }

    async fn handle_payload(&self, frame: Frame) {
        let src = frame.src;
        let sequence = frame.sequence;
        let ack_requested = frame.ack_requested();

        let Some(body) = codec::try_reassemble(&self.reassembler, frame) else {
            return;
        };

        // ACK even duplicates: the sender may have missed our first ACK.
        if ack_requested {
            self.send_control(src, FrameType::Ack, sequence, Vec::new())
                .await;
        }

        let mut msg = match TransportMessage::from_bytes(&body) {
            Ok(m) => m,
            Err(e) => {
                self.stats.record_error();
                debug!(error = %e, src = %src, "dropping malformed envelope");
                return;
            }
        };

        if !self.seen.insert(&msg.id) {
            trace!(id = %msg.id, "duplicate message");
            return;
        }

        msg.sender_addr = src.to_string();
        self.stats.record_message_received();
        self.subscribers.deliver(msg);
    }
}

async fn receive_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = inner.link.recv() => match result {
                Ok(raw) => inner.handle_raw(raw).await,
                Err(TransportError::Closed) => {
                    info!("raw link closed");
                    break;
                }
                Err(e) => {
                    inner.stats.record_error();
                    warn!(error = %e, "raw link receive failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    inner.running.store(false, Ordering::SeqCst);
}

async fn housekeeping_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut seen_tick = tokio::time::interval(SEEN_CLEANUP_INTERVAL);
    let mut gc_tick = tokio::time::interval(GC_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = seen_tick.tick() => {
                let removed = inner.seen.cleanup();
                if removed > 0 {
                    trace!(removed, "seen cache cleanup");
                }
            }
            _ = gc_tick.tick() => {
                let removed = inner.reassembler.gc();
                if removed > 0 {
                    debug!(removed, "dropped idle partial messages");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for RawTransport {
    async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.send_replace(false);
        self.inner.stats.mark_started();

        tokio::spawn(receive_loop(
            Arc::clone(&self.inner),
            self.inner.shutdown.subscribe(),
        ));
        tokio::spawn(housekeeping_loop(
            Arc::clone(&self.inner),
            self.inner.shutdown.subscribe(),
        ));

        info!(mac = %self.local_mac(), "raw transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        self.inner.running.store(false, Ordering::SeqCst);
        info!("raw transport stopped");
        Ok(())
    }

    async fn connect(&self, _target: &str) -> Result<()> {
        // Link-layer broadcast has no session to establish.
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn send_message(&self, msg: TransportMessage) -> Result<()> {
        let want_ack = self.inner.config.require_ack;
        self.inner.transmit(MacAddr::BROADCAST, msg, want_ack).await
    }

    async fn send_to(&self, addr: &str, msg: TransportMessage) -> Result<()> {
        let dst: MacAddr = addr.parse()?;
        let want_ack = self.inner.config.require_ack;
        self.inner.transmit(dst, msg, want_ack).await
    }

    fn subscribe(&self) -> mpsc::Receiver<TransportMessage> {
        self.inner.subscribers.subscribe()
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<PeerInfo>> {
        let started = Utc::now();
        let sequence = self.inner.next_sequence();
        self.inner
            .send_control(
                MacAddr::BROADCAST,
                FrameType::Discover,
                sequence,
                DISCOVER_PAYLOAD.to_vec(),
            )
            .await;

        tokio::time::sleep(timeout).await;

        let peers = self
            .inner
            .peers
            .lock()
            .values()
            .filter(|p| p.last_seen >= started)
            .cloned()
            .collect();
        Ok(peers)
    }

    async fn announce(&self, info: ServiceInfo) -> Result<()> {
        info!(
            channel = %info.channel_hash8(),
            members = info.current_members,
            "answering raw discovery probes"
        );
        *self.inner.service.lock() = Some(info);
        Ok(())
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Arp
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }
}
