//! Outbound fan-out. Every message leaving the server is encrypted under the
//! channel key and signed by the server before it reaches the transport.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, trace, warn};

use crosswire_shared::constants::SERVER_ID;
use crosswire_shared::protocol::Message;
use crosswire_shared::types::FrameType;
use crosswire_transport::{Transport, TransportMessage};

use crate::error::{Result, ServerError};
use crate::events::{EventBus, EventType};
use crate::keyring::Keyring;

pub const QUEUE_CAPACITY: usize = 100;
pub const MAX_RETRIES: u32 = 3;
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// How long sent ids are remembered for echo detection.
pub const SENT_TTL: Duration = Duration::from_secs(60 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BroadcastStats {
    pub total: u64,
    pub failed: u64,
    /// Running average from enqueue to hand-off, in milliseconds.
    pub average_latency_ms: f64,
    pub queue_len: usize,
    pub queue_capacity: usize,
}

struct Queued {
    message: Message,
    enqueued_at: Instant,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    failed: AtomicU64,
    latency: parking_lot::Mutex<f64>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    keyring: Arc<Keyring>,
    events: EventBus,
    /// Application message ids and transport envelope ids we emitted.
    sent: Mutex<HashMap<String, Instant>>,
    acks: Mutex<HashMap<String, HashSet<String>>>,
    counters: Counters,
}

pub struct BroadcastManager {
    inner: Arc<Inner>,
    queue: mpsc::Sender<Queued>,
}

impl BroadcastManager {
    /// Spawn the single drain worker and the sent-cache sweeper.
    pub fn start(
        transport: Arc<dyn Transport>,
        keyring: Arc<Keyring>,
        events: EventBus,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            transport,
            keyring,
            events,
            sent: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        });
        tokio::spawn(worker(Arc::clone(&inner), rx, shutdown));
        Self { inner, queue: tx }
    }

    /// Enqueue for fan-out. Never waits: a full queue is a capacity error.
    pub fn broadcast(&self, message: Message) -> Result<()> {
        let item = Queued {
            message,
            enqueued_at: Instant::now(),
        };
        self.queue.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ServerError::Capacity("broadcast queue is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                ServerError::Internal("broadcast worker stopped".into())
            }
        })
    }

    /// Enqueue, waiting for room. For bulk replays that must not drop.
    pub async fn broadcast_wait(&self, message: Message) -> Result<()> {
        let item = Queued {
            message,
            enqueued_at: Instant::now(),
        };
        self.queue
            .send(item)
            .await
            .map_err(|_| ServerError::Internal("broadcast worker stopped".into()))
    }

    /// Seal `value` as JSON and unicast it, bypassing the queue. Used for
    /// join and sync responses.
    pub async fn send_to<T: Serialize>(&self, addr: &str, kind: FrameType, value: &T) -> Result<()> {
        let payload = self.inner.keyring.seal_json(value)?;
        let envelope = TransportMessage::new(kind, SERVER_ID, payload);
        self.inner.remember(&envelope.id).await;
        self.inner
            .with_retries(|msg| {
                let transport = Arc::clone(&self.inner.transport);
                let addr = addr.to_string();
                async move { transport.send_to(&addr, msg).await }
            }, envelope)
            .await
    }

    /// True for ids of messages or envelopes this server emitted within the
    /// last hour.
    pub async fn is_sent_by_me(&self, id: &str) -> bool {
        self.inner.sent.lock().await.contains_key(id)
    }

    pub async fn record_ack(&self, message_id: &str, member_id: &str) {
        self.inner
            .acks
            .lock()
            .await
            .entry(message_id.to_string())
            .or_default()
            .insert(member_id.to_string());
    }

    pub async fn ack_count(&self, message_id: &str) -> usize {
        self.inner
            .acks
            .lock()
            .await
            .get(message_id)
            .map_or(0, HashSet::len)
    }

    /// Forget sent ids older than `ttl` and their ACKs. Returns how many.
    pub async fn cleanup_sent(&self, ttl: Duration) -> usize {
        self.inner.cleanup_sent(ttl).await
    }

    pub fn queue_len(&self) -> usize {
        QUEUE_CAPACITY - self.queue.capacity()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            total: self.inner.counters.total.load(Ordering::Relaxed),
            failed: self.inner.counters.failed.load(Ordering::Relaxed),
            average_latency_ms: *self.inner.counters.latency.lock(),
            queue_len: self.queue_len(),
            queue_capacity: QUEUE_CAPACITY,
        }
    }
}

impl Inner {
    async fn remember(&self, id: &str) {
        self.sent.lock().await.insert(id.to_string(), Instant::now());
    }

    async fn cleanup_sent(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let (removed, live): (usize, HashSet<String>) = {
            let mut sent = self.sent.lock().await;
            let before = sent.len();
            sent.retain(|_, at| now.saturating_duration_since(*at) < ttl);
            (before - sent.len(), sent.keys().cloned().collect())
        };
        self.acks.lock().await.retain(|id, _| live.contains(id));
        debug!(removed, remaining = live.len(), "sent cache cleanup");
        removed
    }

    /// One attempt plus up to [`MAX_RETRIES`] retries, [`RETRY_BACKOFF`] apart.
    async fn with_retries<F, Fut>(&self, send: F, envelope: TransportMessage) -> Result<()>
    where
        F: Fn(TransportMessage) -> Fut,
        Fut: std::future::Future<Output = crosswire_transport::Result<()>>,
    {
        let mut attempt = 0;
        loop {
            match send(envelope.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    debug!(id = %envelope.id, attempt, error = %e, "send failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn deliver(&self, item: Queued) {
        let Queued {
            message,
            enqueued_at,
        } = item;

        let payload = match self.keyring.seal_json(&message) {
            Ok(p) => p,
            Err(e) => {
                error!(message = %message.id, error = %e, "failed to seal broadcast");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let envelope = TransportMessage::new(FrameType::Data, SERVER_ID, payload);
        self.remember(&message.id).await;
        self.remember(&envelope.id).await;

        let transport = Arc::clone(&self.transport);
        let result = self
            .with_retries(
                |msg| {
                    let transport = Arc::clone(&transport);
                    async move { transport.send_message(msg).await }
                },
                envelope,
            )
            .await;

        match result {
            Ok(()) => {
                let latency_ms = enqueued_at.elapsed().as_secs_f64() * 1000.0;
                {
                    let mut avg = self.counters.latency.lock();
                    *avg = if *avg == 0.0 { latency_ms } else { (*avg + latency_ms) / 2.0 };
                }
                self.counters.total.fetch_add(1, Ordering::Relaxed);
                trace!(message = %message.id, latency_ms, "broadcast sent");
                self.events.publish(
                    EventType::MessageSent,
                    json!({ "message_id": message.id, "type": message.kind }),
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(message = %message.id, error = %e, "broadcast failed after retries");
            }
        }
    }
}

async fn worker(inner: Arc<Inner>, mut rx: mpsc::Receiver<Queued>, mut shutdown: watch::Receiver<bool>) {
    let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
    cleanup.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            item = rx.recv() => match item {
                Some(item) => inner.deliver(item).await,
                None => break,
            },
            _ = cleanup.tick() => {
                inner.cleanup_sent(SENT_TTL).await;
            }
        }
    }
    debug!("broadcast worker stopped");
}

#[cfg(test)]
mod tests {
    use crosswire_shared::protocol::SignedPayload;
    use crosswire_shared::Identity;

    use super::*;
    use crate::testing::{wait_until, RecordingTransport};

    fn manager(transport: Arc<RecordingTransport>) -> (BroadcastManager, Arc<Keyring>, watch::Sender<bool>) {
        let keyring = Arc::new(Keyring::new([3u8; 32], Identity::generate(), true));
        let (stop, shutdown) = watch::channel(false);
        let manager = BroadcastManager::start(transport, Arc::clone(&keyring), EventBus::new(), shutdown);
        (manager, keyring, stop)
    }

    #[tokio::test]
    async fn test_broadcast_is_sealed_and_signed() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, keyring, _stop) = manager(Arc::clone(&transport));

        let msg = Message::text("m1", "alice", "hi all");
        manager.broadcast(msg.clone()).unwrap();
        wait_until(|| manager.stats().total == 1).await;

        let (addr, envelope) = transport.sent()[0].clone();
        assert!(addr.is_none());
        assert_eq!(envelope.kind, FrameType::Data);
        assert_eq!(envelope.sender_id, SERVER_ID);

        let payload = SignedPayload::from_json(&envelope.payload).unwrap();
        assert_eq!(payload.server_id, SERVER_ID);
        let plain = payload.open(keyring.channel_key(), &keyring.public_key()).unwrap();
        let decoded: Message = serde_json::from_slice(&plain).unwrap();
        assert_eq!(decoded, msg);

        assert!(manager.is_sent_by_me(&msg.id).await);
        assert!(manager.is_sent_by_me(&envelope.id).await);
        assert!(!manager.is_sent_by_me("someone-else").await);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let transport = Arc::new(RecordingTransport::failing(2));
        let (manager, _keyring, _stop) = manager(Arc::clone(&transport));

        manager.broadcast(Message::text("m1", "a", "x")).unwrap();
        wait_until(|| manager.stats().total == 1).await;
        assert_eq!(transport.attempts(), 3);
        assert_eq!(manager.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_three_retries() {
        let transport = Arc::new(RecordingTransport::failing(usize::MAX));
        let (manager, _keyring, _stop) = manager(Arc::clone(&transport));

        manager.broadcast(Message::text("m1", "a", "x")).unwrap();
        wait_until(|| manager.stats().failed == 1).await;
        assert_eq!(transport.attempts(), 4);
    }

    #[tokio::test]
    async fn test_closed_queue_is_internal_error() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, _keyring, stop) = manager(transport);
        stop.send_replace(true);
        wait_until(|| manager.queue.is_closed()).await;

        assert!(matches!(
            manager.broadcast(Message::text("m1", "a", "late")),
            Err(ServerError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let transport = Arc::new(RecordingTransport::stalled());
        let (manager, _keyring, _stop) = manager(transport);

        // The worker takes the first message and hangs in the transport.
        manager.broadcast(Message::text("m1", "a", "first")).unwrap();
        wait_until(|| manager.queue_len() == 0).await;

        for i in 0..QUEUE_CAPACITY {
            manager.broadcast(Message::text("m1", "a", &i.to_string())).unwrap();
        }
        assert!(matches!(
            manager.broadcast(Message::text("m1", "a", "overflow")),
            Err(ServerError::Capacity(_))
        ));
        assert_eq!(manager.queue_len(), QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_send_to_unicasts() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, keyring, _stop) = manager(Arc::clone(&transport));

        manager
            .send_to("02:00:00:00:00:09", FrameType::Auth, &json!({ "ok": true }))
            .await
            .unwrap();
        let (addr, envelope) = transport.sent()[0].clone();
        assert_eq!(addr.as_deref(), Some("02:00:00:00:00:09"));
        assert_eq!(envelope.kind, FrameType::Auth);
        let payload = SignedPayload::from_json(&envelope.payload).unwrap();
        let plain = payload.open(keyring.channel_key(), &keyring.public_key()).unwrap();
        assert_eq!(plain, br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_acks_and_cleanup() {
        let transport = Arc::new(RecordingTransport::default());
        let (manager, _keyring, _stop) = manager(transport);

        let msg = Message::text("m1", "a", "ack me");
        manager.broadcast(msg.clone()).unwrap();
        wait_until(|| manager.stats().total == 1).await;

        manager.record_ack(&msg.id, "m2").await;
        manager.record_ack(&msg.id, "m2").await;
        manager.record_ack(&msg.id, "m3").await;
        assert_eq!(manager.ack_count(&msg.id).await, 2);

        assert_eq!(manager.cleanup_sent(Duration::ZERO).await, 2);
        assert!(!manager.is_sent_by_me(&msg.id).await);
        assert_eq!(manager.ack_count(&msg.id).await, 0);
    }
}
