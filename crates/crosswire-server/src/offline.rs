//! Per-member queues of messages broadcast while the member was offline.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crosswire_shared::protocol::Message;
use crosswire_store::{MessageRepository, Repository, StoreError};

use crate::broadcast::BroadcastManager;
use crate::error::{Result, ServerError};
use crate::events::{EventBus, EventType};

pub const MAX_QUEUE_SIZE: usize = 1000;
pub const MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DELIVERY_SPACING: Duration = Duration::from_millis(10);
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OfflineStats {
    pub total_queued: u64,
    pub total_delivered: u64,
    /// Evicted by the size bound or purged by age.
    pub total_expired: u64,
    pub current_queued: usize,
}

struct Entry {
    message: Message,
    queued_at: DateTime<Utc>,
}

/// Persist a message unless a row with its id already exists.
pub fn persist_once(repo: &dyn Repository, message: &Message) -> std::result::Result<(), StoreError> {
    match repo.get_message(&message.id) {
        Ok(_) => Ok(()),
        Err(StoreError::NotFound) => repo.create_message(message),
        Err(e) => Err(e),
    }
}

pub struct OfflineManager {
    repo: Arc<dyn Repository>,
    events: EventBus,
    enabled: bool,
    max_queue_size: usize,
    queues: Mutex<HashMap<String, VecDeque<Entry>>>,
    stats: Mutex<OfflineStats>,
}

impl OfflineManager {
    pub fn new(repo: Arc<dyn Repository>, events: EventBus, enabled: bool) -> Self {
        Self::with_capacity(repo, events, enabled, MAX_QUEUE_SIZE)
    }

    pub fn with_capacity(repo: Arc<dyn Repository>, events: EventBus, enabled: bool, max_queue_size: usize) -> Self {
        Self {
            repo,
            events,
            enabled,
            max_queue_size: max_queue_size.max(1),
            queues: Mutex::new(HashMap::new()),
            stats: Mutex::new(OfflineStats::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Queue `message` for `member_id`, evicting the oldest entry when the
    /// queue is full. The message is persisted either way; a storage failure
    /// is logged and does not undo the queueing.
    pub async fn store(&self, member_id: &str, message: Message) -> Result<()> {
        if !self.enabled {
            return Err(ServerError::Disabled("offline messages are disabled".into()));
        }

        let (evicted, len) = {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(member_id.to_string()).or_default();
            let mut evicted = 0;
            while queue.len() >= self.max_queue_size {
                queue.pop_front();
                evicted += 1;
            }
            queue.push_back(Entry {
                message: message.clone(),
                queued_at: Utc::now(),
            });
            (evicted, queue.len())
        };
        if evicted > 0 {
            warn!(member = member_id, evicted, "offline queue full, dropped oldest");
        }

        if let Err(e) = persist_once(self.repo.as_ref(), &message) {
            error!(member = member_id, message = %message.id, error = %e, "failed to persist offline message");
        }

        let current = self.current_total().await;
        {
            let mut stats = self.stats.lock().await;
            stats.total_queued += 1;
            stats.total_expired += evicted;
            stats.current_queued = current;
        }
        debug!(member = member_id, queue = len, "queued offline message");
        Ok(())
    }

    /// Remove and return everything queued for the member, oldest first.
    pub async fn take_messages(&self, member_id: &str) -> Vec<Message> {
        let taken: Vec<Message> = self
            .queues
            .lock()
            .await
            .remove(member_id)
            .map(|q| q.into_iter().map(|e| e.message).collect())
            .unwrap_or_default();
        if !taken.is_empty() {
            let current = self.current_total().await;
            let mut stats = self.stats.lock().await;
            stats.total_delivered += taken.len() as u64;
            stats.current_queued = current;
        }
        taken
    }

    /// Take the member's queue and re-broadcast it, [`DELIVERY_SPACING`]
    /// apart. Failures are logged and skipped. Returns how many were handed
    /// to the broadcaster.
    pub async fn deliver(&self, member_id: &str, broadcast: &BroadcastManager) -> usize {
        let messages = self.take_messages(member_id).await;
        if messages.is_empty() {
            return 0;
        }

        let total = messages.len();
        let mut delivered = 0;
        for (i, message) in messages.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(DELIVERY_SPACING).await;
            }
            let id = message.id.clone();
            match broadcast.broadcast_wait(message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(member = member_id, message = %id, error = %e, "offline delivery failed"),
            }
        }

        info!(member = member_id, delivered, total, "delivered offline messages");
        self.events.publish(
            EventType::SystemConnected,
            json!({
                "event": "offline_messages_delivered",
                "member_id": member_id,
                "delivered": delivered,
                "total": total,
            }),
        );
        delivered
    }

    pub async fn offline_message_count(&self, member_id: &str) -> usize {
        self.queues.lock().await.get(member_id).map_or(0, VecDeque::len)
    }

    /// Copy of the member's queue; nothing is removed.
    pub async fn offline_messages(&self, member_id: &str) -> Vec<Message> {
        self.queues
            .lock()
            .await
            .get(member_id)
            .map(|q| q.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn clear(&self, member_id: &str) {
        self.queues.lock().await.remove(member_id);
        let current = self.current_total().await;
        self.stats.lock().await.current_queued = current;
    }

    pub async fn queued_members(&self) -> Vec<String> {
        let mut members: Vec<String> = self
            .queues
            .lock()
            .await
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        members.sort();
        members
    }

    pub async fn is_queue_full(&self, member_id: &str) -> bool {
        self.offline_message_count(member_id).await >= self.max_queue_size
    }

    pub async fn purge_expired(&self) -> usize {
        self.purge_older_than(MAX_AGE).await
    }

    /// Drop entries queued more than `max_age` ago, across all members.
    pub async fn purge_older_than(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;
        let removed = {
            let mut queues = self.queues.lock().await;
            let mut removed = 0;
            for queue in queues.values_mut() {
                let before = queue.len();
                queue.retain(|e| e.queued_at > cutoff);
                removed += before - queue.len();
            }
            queues.retain(|_, q| !q.is_empty());
            removed
        };

        if removed > 0 {
            info!(removed, "purged old offline messages");
        }
        let current = self.current_total().await;
        let mut stats = self.stats.lock().await;
        stats.total_expired += removed as u64;
        stats.current_queued = current;
        removed
    }

    async fn current_total(&self) -> usize {
        self.queues.lock().await.values().map(VecDeque::len).sum()
    }

    pub async fn total_queued(&self) -> usize {
        self.current_total().await
    }

    pub async fn stats(&self) -> OfflineStats {
        *self.stats.lock().await
    }
}

#[cfg(test)]
mod tests {
    use crosswire_shared::protocol::SignedPayload;
    use crosswire_shared::types::TransportMode;
    use crosswire_shared::Identity;
    use crosswire_store::Database;
    use crosswire_transport::raw::{MemoryHub, RawTransport};
    use crosswire_transport::{MacAddr, Transport, TransportConfig};
    use tokio::sync::watch;

    use super::*;
    use crate::keyring::Keyring;
    use crate::testing::Harness;

    fn manager(capacity: usize) -> (OfflineManager, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        (
            OfflineManager::with_capacity(db.clone(), EventBus::new(), true, capacity),
            db,
        )
    }

    fn msg(text: &str) -> Message {
        let mut m = Message::text("sender", "s", text);
        m.channel_id = "chan".into();
        m
    }

    #[tokio::test]
    async fn test_bound_evicts_oldest() {
        let (offline, _db) = manager(3);
        for i in 0..5 {
            offline.store("m1", msg(&format!("msg-{i}"))).await.unwrap();
        }

        let queued = offline.offline_messages("m1").await;
        let texts: Vec<_> = queued.iter().map(|m| m.text_body().unwrap().to_string()).collect();
        assert_eq!(texts, vec!["msg-2", "msg-3", "msg-4"]);
        assert!(offline.is_queue_full("m1").await);

        let stats = offline.stats().await;
        assert_eq!(stats.total_queued, 5);
        assert_eq!(stats.total_expired, 2);
        assert_eq!(stats.current_queued, 3);
    }

    #[tokio::test]
    async fn test_take_is_exactly_once() {
        let (offline, _db) = manager(10);
        offline.store("m1", msg("a")).await.unwrap();
        offline.store("m1", msg("b")).await.unwrap();

        assert_eq!(offline.take_messages("m1").await.len(), 2);
        assert!(offline.take_messages("m1").await.is_empty());
        assert_eq!(offline.offline_message_count("m1").await, 0);
        assert_eq!(offline.stats().await.total_delivered, 2);
    }

    #[tokio::test]
    async fn test_persists_each_message_once() {
        let (offline, db) = manager(10);
        let m = msg("shared");
        offline.store("m1", m.clone()).await.unwrap();
        offline.store("m2", m.clone()).await.unwrap();

        assert_eq!(db.get_message(&m.id).unwrap().id, m.id);
        assert_eq!(offline.queued_members().await, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_disabled_rejects() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let offline = OfflineManager::new(db, EventBus::new(), false);
        assert!(matches!(
            offline.store("m1", msg("x")).await,
            Err(ServerError::Disabled(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_and_clear() {
        let (offline, _db) = manager(10);
        offline.store("m1", msg("old")).await.unwrap();
        offline.store("m2", msg("other")).await.unwrap();

        assert_eq!(offline.purge_older_than(Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(offline.purge_older_than(Duration::from_millis(1)).await, 2);
        assert!(offline.queued_members().await.is_empty());

        offline.store("m1", msg("new")).await.unwrap();
        offline.clear("m1").await;
        assert_eq!(offline.total_queued().await, 0);
    }

    #[tokio::test]
    async fn test_deliver_empty_queue_is_a_no_op() {
        let h = Harness::new().await;
        let offline = OfflineManager::new(h.db.clone(), h.events.clone(), true);
        assert_eq!(offline.deliver("nobody", &h.broadcast).await, 0);

        offline.store("m1", msg("already synced")).await.unwrap();
        offline.take_messages("m1").await;
        assert_eq!(offline.deliver("m1", &h.broadcast).await, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.transport.sent().is_empty());
        assert_eq!(offline.stats().await.total_delivered, 1);
    }

    fn hub_port(hub: &MemoryHub, last: u8) -> Arc<RawTransport> {
        let link = hub.attach(MacAddr([2, 0, 0, 0, 0, last]));
        let config = TransportConfig {
            mode: TransportMode::Arp,
            ..TransportConfig::default()
        };
        Arc::new(RawTransport::new(config, Arc::new(link)))
    }

    #[tokio::test]
    async fn test_deliver_rebroadcasts_in_queue_order() {
        let hub = MemoryHub::new();
        let server = hub_port(&hub, 1);
        let member = hub_port(&hub, 2);
        server.start().await.unwrap();
        member.start().await.unwrap();
        let mut inbox = member.subscribe();

        let keyring = Arc::new(Keyring::new([9u8; 32], Identity::generate(), true));
        let (_stop, shutdown) = watch::channel(false);
        let broadcast = BroadcastManager::start(server.clone(), Arc::clone(&keyring), EventBus::new(), shutdown);

        let (offline, _db) = manager(10);
        for text in ["one", "two", "three"] {
            offline.store("m1", msg(text)).await.unwrap();
        }
        assert_eq!(offline.deliver("m1", &broadcast).await, 3);
        assert_eq!(offline.offline_message_count("m1").await, 0);

        let mut texts = Vec::new();
        while texts.len() < 3 {
            let frame = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
                .await
                .unwrap()
                .unwrap();
            let payload = SignedPayload::from_json(&frame.payload).unwrap();
            let plain = payload.open(keyring.channel_key(), &keyring.public_key()).unwrap();
            let delivered: Message = serde_json::from_slice(&plain).unwrap();
            texts.push(delivered.text_body().unwrap().to_string());
        }
        assert_eq!(texts, vec!["one", "two", "three"]);
    }
}
