//! The backend-agnostic transport surface.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crosswire_shared::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_WS_PORT, PROTOCOL_VERSION};
use crosswire_shared::protocol::b64;
use crosswire_shared::types::{FrameType, TransportMode};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The envelope every backend moves. `payload` is opaque to the transport:
/// for channel traffic it is an encrypted, serialized `SignedPayload` or
/// client message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportMessage {
    pub id: String,
    /// Unix milliseconds at creation.
    pub timestamp: i64,
    #[serde(default)]
    pub sequence: u32,
    pub sender_id: String,
    /// Filled in by the receiving transport: MAC, socket address or mDNS
    /// source, whatever `send_to` on the same backend accepts.
    #[serde(default)]
    pub sender_addr: String,
    pub kind: FrameType,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
}

impl TransportMessage {
    pub fn new(kind: FrameType, sender_id: &str, payload: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            sequence: 0,
            sender_id: sender_id.to_string(),
            sender_addr: String::new(),
            kind,
            payload,
        }
    }

    pub fn data(sender_id: &str, payload: Vec<u8>) -> Self {
        Self::new(FrameType::Data, sender_id, payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub address: String,
    pub mode: TransportMode,
    pub last_seen: DateTime<Utc>,
    pub channel_id_hash: String,
    pub version: u8,
}

/// What a server advertises to discovery probes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInfo {
    pub channel_id: String,
    pub channel_name: String,
    pub mode: TransportMode,
    pub port: u16,
    #[serde(default)]
    pub interface: String,
    pub version: u8,
    pub max_members: usize,
    pub current_members: usize,
}

impl ServiceInfo {
    pub fn channel_hash8(&self) -> String {
        crosswire_shared::crypto::channel_hash8(&self.channel_id)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub mode: TransportMode,
    /// Network interface for the raw backend.
    pub interface: String,
    /// Bind address for listening backends.
    pub listen_addr: SocketAddr,
    /// Server URL for client backends (`ws://host:port/ws`).
    pub url: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Capacity of each subscriber queue.
    pub recv_buffer: usize,
    /// Capacity of each outbound connection queue.
    pub send_buffer: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub chunk_size: usize,
    pub require_ack: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Https,
            interface: "eth0".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_WS_PORT)),
            url: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            recv_buffer: 1024,
            send_buffer: 256,
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
            chunk_size: DEFAULT_CHUNK_SIZE,
            require_ack: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub retries: u64,
    /// NACK frames observed. Nothing is retransmitted in response.
    pub nacks_received: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Lock-free counters behind [`TransportStats`].
#[derive(Debug, Default)]
pub struct StatsCounter {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    nacks_received: AtomicU64,
    started_at_ms: AtomicI64,
    last_activity_ms: AtomicI64,
}

impl StatsCounter {
    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn mark_started(&self) {
        self.started_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nack(&self) {
        self.nacks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        let ts = |v: i64| (v != 0).then(|| Utc.timestamp_millis_opt(v).single()).flatten();
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            nacks_received: self.nacks_received.load(Ordering::Relaxed),
            started_at: ts(self.started_at_ms.load(Ordering::Relaxed)),
            last_activity: ts(self.last_activity_ms.load(Ordering::Relaxed)),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Fan-out of inbound messages to every `subscribe()` receiver.
///
/// Delivery uses `try_send`: a subscriber that stops draining loses
/// messages rather than stalling the receive loop.
#[derive(Debug)]
pub struct Subscribers {
    senders: Mutex<Vec<mpsc::Sender<TransportMessage>>>,
    capacity: usize,
}

impl Subscribers {
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<TransportMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.lock().push(tx);
        rx
    }

    /// Returns the number of subscribers that accepted the message.
    pub fn deliver(&self, msg: TransportMessage) -> usize {
        let mut senders = self.senders.lock();
        senders.retain(|tx| !tx.is_closed());

        let mut delivered = 0;
        for tx in senders.iter() {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(id = %msg.id, "subscriber queue full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind sockets and spawn the receive and housekeeping loops.
    async fn start(&self) -> Result<()>;

    /// Signal every background loop to exit.
    async fn stop(&self) -> Result<()>;

    /// Connect to a server. Only meaningful for client backends.
    async fn connect(&self, target: &str) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Broadcast to everyone reachable on this medium.
    async fn send_message(&self, msg: TransportMessage) -> Result<()>;

    /// Unicast to an address previously seen in `sender_addr`. Backends
    /// without addressing fall back to broadcast.
    async fn send_to(&self, addr: &str, msg: TransportMessage) -> Result<()>;

    fn subscribe(&self) -> mpsc::Receiver<TransportMessage>;

    async fn discover(&self, timeout: Duration) -> Result<Vec<PeerInfo>>;

    async fn announce(&self, info: ServiceInfo) -> Result<()>;

    fn mode(&self) -> TransportMode;

    fn stats(&self) -> TransportStats;
}

/// Parse an `ANNOUNCE|<hash8>|<version>` discovery reply.
pub fn parse_announce(payload: &[u8]) -> Option<(String, u8)> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.split('|');
    if parts.next()? != "ANNOUNCE" {
        return None;
    }
    let hash = parts.next()?.to_string();
    let version = parts.next()?.parse().ok()?;
    Some((hash, version))
}

pub fn announce_payload(info: &ServiceInfo) -> Vec<u8> {
    format!("ANNOUNCE|{}|{}", info.channel_hash8(), PROTOCOL_VERSION).into_bytes()
}

pub const DISCOVER_PAYLOAD: &[u8] = b"DISCOVER|";
