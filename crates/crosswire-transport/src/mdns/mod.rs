//! mDNS-over-UDP transport.
//!
//! Payloads travel as ephemeral service instances (see [`wire`]). Each
//! published chunk stays in the live table, and is re-announced in answer
//! to matching queries, until its 5 second force-expiry timer fires.
//! Receivers poll the service with PTR queries every 100ms and rebuild
//! messages with the shared [`Reassembler`].

pub mod wire;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crosswire_shared::constants::{MDNS_ADDR, MDNS_PORT};
use crosswire_shared::types::TransportMode;

use crate::error::{Result, TransportError};
use crate::reassembly::{Reassembler, DEFAULT_IDLE_TIMEOUT};
use crate::seen::{SeenCache, SEEN_CLEANUP_INTERVAL};
use crate::transport::{
    PeerInfo, ServiceInfo, StatsCounter, Subscribers, Transport, TransportConfig,
    TransportMessage, TransportStats,
};
use wire::{ChunkRecord, Observed};

/// Cadence of outgoing PTR queries.
pub const QUERY_INTERVAL: Duration = Duration::from_millis(100);
/// Longest a receive waits for answers before re-checking state.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(1);
/// Published chunks are withdrawn after this long, observed or not.
pub const FORCE_EXPIRY: Duration = Duration::from_secs(5);

const GC_INTERVAL: Duration = Duration::from_secs(60);
const MAX_PACKET: usize = 9000;

pub struct MdnsTransport {
    inner: Arc<Inner>,
}

struct Inner {
    group: SocketAddrV4,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    /// instance label → chunk, for re-answering queries.
    live: Mutex<HashMap<String, ChunkRecord>>,
    reassembler: Reassembler<String>,
    seen: SeenCache,
    peers: Mutex<HashMap<String, PeerInfo>>,
    service: Mutex<Option<ServiceInfo>>,
    subscribers: Subscribers,
    stats: StatsCounter,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl MdnsTransport {
    pub fn new(config: TransportConfig) -> Self {
        let group = SocketAddrV4::new(
            MDNS_ADDR.parse().unwrap_or(Ipv4Addr::new(224, 0, 0, 251)),
            MDNS_PORT,
        );
        let (shutdown, _) = watch::channel(false);
        let subscribers = Subscribers::new(config.recv_buffer);
        Self {
            inner: Arc::new(Inner {
                group,
                socket: Mutex::new(None),
                live: Mutex::new(HashMap::new()),
                reassembler: Reassembler::new(DEFAULT_IDLE_TIMEOUT),
                seen: SeenCache::default(),
                peers: Mutex::new(HashMap::new()),
                service: Mutex::new(None),
                subscribers,
                stats: StatsCounter::default(),
                running: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Chunks currently being announced.
    pub fn live_records(&self) -> usize {
        self.inner.live.lock().len()
    }
}

fn bind_multicast(group: SocketAddrV4) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port())).into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(255)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

impl Inner {
    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().clone()
    }

    async fn send_packet(&self, packet: &[u8]) -> Result<()> {
        let socket = self.socket().ok_or(TransportError::NotConnected)?;
        match socket.send_to(packet, SocketAddr::V4(self.group)).await {
            Ok(n) => {
                self.stats.record_sent(n);
                Ok(())
            }
            Err(e) => {
                self.stats.record_error();
                Err(e.into())
            }
        }
    }

    /// Register `msg` in the live table and build one response packet per
    /// chunk.
    fn publish(&self, msg: &TransportMessage) -> Result<Vec<Vec<u8>>> {
        let chunks = wire::chunk_message(msg)?;
        let mut packets = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            packets.push(wire::response_packet(chunk.to_records()?)?);
        }

        let mut live = self.live.lock();
        for chunk in chunks {
            live.insert(chunk.label(), chunk);
        }
        self.seen.insert(&msg.id);
        Ok(packets)
    }

    fn expire(&self, msg_id: &str) -> usize {
        let mut live = self.live.lock();
        let before = live.len();
        live.retain(|_, c| c.msg_id != msg_id);
        before - live.len()
    }

    /// Packets answering a PTR query: every live chunk plus our server
    /// instance if announced.
    fn answers(&self) -> Vec<Vec<u8>> {
        let mut record_sets = Vec::new();
        {
            let live = self.live.lock();
            for chunk in live.values() {
                match chunk.to_records() {
                    Ok(records) => record_sets.push(records),
                    Err(e) => warn!(error = %e, "failed to build chunk records"),
                }
            }
        }
        let service = self.service.lock().clone();
        if let Some(info) = service {
            match wire::server_records(&info) {
                Ok(records) => record_sets.push(records),
                Err(e) => warn!(error = %e, "failed to build server records"),
            }
        }

        record_sets
            .into_iter()
            .filter_map(|records| wire::response_packet(records).ok())
            .collect()
    }

    /// Process one received packet; returns response packets to send.
    fn handle_packet(&self, bytes: &[u8], src: SocketAddr) -> Vec<Vec<u8>> {
        self.stats.record_received(bytes.len());

        let parsed = match wire::parse_packet(bytes) {
            Ok(p) => p,
            Err(e) => {
                self.stats.record_error();
                trace!(error = %e, %src, "ignoring unparseable mDNS packet");
                return Vec::new();
            }
        };

        if parsed.is_service_query {
            return self.answers();
        }

        for observed in parsed.observed {
            match observed {
                Observed::Chunk(chunk) => self.handle_chunk(chunk, src),
                Observed::Server {
                    instance,
                    channel_hash,
                    version,
                    port,
                } => {
                    let address = SocketAddr::new(src.ip(), port).to_string();
                    self.peers.lock().insert(
                        instance.clone(),
                        PeerInfo {
                            id: instance,
                            address,
                            mode: TransportMode::Mdns,
                            last_seen: Utc::now(),
                            channel_id_hash: channel_hash,
                            version,
                        },
                    );
                }
            }
        }
        Vec::new()
    }

    fn handle_chunk(&self, chunk: ChunkRecord, src: SocketAddr) {
        if self.seen.contains(&chunk.msg_id) {
            return;
        }
        let Some(joined) = self.reassembler.insert(
            chunk.msg_id.clone(),
            chunk.seq,
            chunk.total,
            chunk.chunk.into_bytes(),
        ) else {
            return;
        };

        let mut msg = match wire::decode_message(&joined) {
            Ok(m) => m,
            Err(e) => {
                self.stats.record_error();
                debug!(error = %e, msg = %chunk.msg_id, "dropping malformed mDNS message");
                return;
            }
        };
        if !self.seen.insert(&msg.id) {
            return;
        }

        msg.sender_addr = src.to_string();
        self.stats.record_message_received();
        self.subscribers.deliver(msg);
    }
}

async fn receive_loop(inner: Arc<Inner>, socket: Arc<UdpSocket>, shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_PACKET];
    // The read timeout bounds how long shutdown can go unnoticed.
    while !*shutdown.borrow() {
        let (n, src) = match tokio::time::timeout(QUERY_TIMEOUT, socket.recv_from(&mut buf)).await {
            Err(_elapsed) => continue,
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                inner.stats.record_error();
                warn!(error = %e, "mDNS receive failed");
                continue;
            }
        };
        for packet in inner.handle_packet(&buf[..n], src) {
            if let Err(e) = inner.send_packet(&packet).await {
                debug!(error = %e, "failed to answer mDNS query");
            }
        }
    }
}

async fn query_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let query = match wire::query_packet() {
        Ok(q) => q,
        Err(e) => {
            warn!(error = %e, "cannot build mDNS query");
            return;
        }
    };
    let mut tick = tokio::time::interval(QUERY_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(e) = inner.send_packet(&query).await {
                    trace!(error = %e, "mDNS query failed");
                }
            }
        }
    }
}

async fn housekeeping_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut seen_tick = tokio::time::interval(SEEN_CLEANUP_INTERVAL);
    let mut gc_tick = tokio::time::interval(GC_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = seen_tick.tick() => { inner.seen.cleanup(); }
            _ = gc_tick.tick() => {
                let removed = inner.reassembler.gc();
                if removed > 0 {
                    debug!(removed, "dropped idle partial mDNS messages");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for MdnsTransport {
    async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let socket = match bind_multicast(self.inner.group) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.inner.socket.lock() = Some(Arc::clone(&socket));
        self.inner.shutdown.send_replace(false);
        self.inner.stats.mark_started();

        let inner = &self.inner;
        tokio::spawn(receive_loop(Arc::clone(inner), socket, inner.shutdown.subscribe()));
        tokio::spawn(query_loop(Arc::clone(inner), inner.shutdown.subscribe()));
        tokio::spawn(housekeeping_loop(Arc::clone(inner), inner.shutdown.subscribe()));

        info!(group = %self.inner.group, "mDNS transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.socket.lock().take();
        info!("mDNS transport stopped");
        Ok(())
    }

    async fn connect(&self, _target: &str) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn send_message(&self, msg: TransportMessage) -> Result<()> {
        let packets = self.inner.publish(&msg)?;

        let inner = Arc::clone(&self.inner);
        let msg_id = msg.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FORCE_EXPIRY).await;
            let removed = inner.expire(&msg_id);
            trace!(msg = %msg_id, removed, "mDNS chunks expired");
        });

        for packet in &packets {
            self.inner.send_packet(packet).await?;
        }
        self.inner.stats.record_message_sent();
        debug!(id = %msg.id, chunks = packets.len(), "published message over mDNS");
        Ok(())
    }

    /// Multicast has no unicast path; everything is broadcast.
    async fn send_to(&self, _addr: &str, msg: TransportMessage) -> Result<()> {
        self.send_message(msg).await
    }

    fn subscribe(&self) -> mpsc::Receiver<TransportMessage> {
        self.inner.subscribers.subscribe()
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<PeerInfo>> {
        let started = Utc::now();
        let query = wire::query_packet()?;
        self.inner.send_packet(&query).await?;
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
        let records = wire::server_records(&info)?;
        *self.inner.service.lock() = Some(info);
        if self.inner.socket().is_some() {
            self.inner.send_packet(&wire::response_packet(records)?).await?;
        }
        Ok(())
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Mdns
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> SocketAddr {
        "192.168.1.20:5353".parse().unwrap()
    }

    #[tokio::test]
    async fn test_chunks_reassemble_on_receiver() {
        let sender = MdnsTransport::new(TransportConfig::default());
        let receiver = MdnsTransport::new(TransportConfig::default());
        let mut rx = receiver.subscribe();

        let msg = TransportMessage::data("server", vec![0x42; 700]);
        let mut packets = sender.inner.publish(&msg).unwrap();
        assert!(packets.len() > 1);
        assert_eq!(sender.live_records(), packets.len());

        // Arrival order does not matter; duplicates are harmless.
        packets.reverse();
        let first = packets[0].clone();
        packets.push(first);
        for packet in &packets {
            assert!(receiver.inner.handle_packet(packet, src()).is_empty());
        }

        let got = rx.try_recv().unwrap();
        assert_eq!(got.payload, msg.payload);
        assert_eq!(got.sender_addr, src().to_string());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_query_answered_with_live_records() {
        let sender = MdnsTransport::new(TransportConfig::default());
        let msg = TransportMessage::data("server", b"short".to_vec());
        let published = sender.inner.publish(&msg).unwrap();

        let answers = sender
            .inner
            .handle_packet(&wire::query_packet().unwrap(), src());
        assert_eq!(answers.len(), published.len());

        assert_eq!(sender.inner.expire(&msg.id), published.len());
        assert!(sender
            .inner
            .handle_packet(&wire::query_packet().unwrap(), src())
            .is_empty());
    }

    #[tokio::test]
    async fn test_server_instance_discovered() {
        let server = MdnsTransport::new(TransportConfig::default());
        let client = MdnsTransport::new(TransportConfig::default());
        let info = ServiceInfo {
            channel_id: "chan-1".into(),
            channel_name: "ops".into(),
            mode: TransportMode::Mdns,
            port: 8443,
            interface: String::new(),
            version: 1,
            max_members: 100,
            current_members: 0,
        };
        server.announce(info.clone()).await.unwrap();

        for packet in server.inner.answers() {
            client.inner.handle_packet(&packet, src());
        }
        let peers = client.inner.peers.lock();
        let peer = peers.values().next().unwrap();
        assert_eq!(peer.channel_id_hash, info.channel_hash8());
        assert_eq!(peer.address, "192.168.1.20:8443");
    }

    #[tokio::test]
    async fn test_own_messages_not_delivered() {
        let node = MdnsTransport::new(TransportConfig::default());
        let mut rx = node.subscribe();

        let msg = TransportMessage::data("server", b"echo".to_vec());
        for packet in node.inner.publish(&msg).unwrap() {
            node.inner.handle_packet(&packet, src());
        }
        assert!(rx.try_recv().is_err());
    }
}
