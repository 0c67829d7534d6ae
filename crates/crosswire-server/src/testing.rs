//! Shared fixtures for the unit tests in this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};

use crosswire_shared::crypto;
use crosswire_shared::protocol::{SignedMessage, SignedPayload};
use crosswire_shared::types::{FrameType, TransportMode};
use crosswire_shared::Identity;
use crosswire_store::Database;
use crosswire_transport::{
    PeerInfo, ServiceInfo, Transport, TransportError, TransportMessage, TransportStats,
};

use crate::broadcast::BroadcastManager;
use crate::channel::tests::test_manager_with;
use crate::channel::ChannelManager;
use crate::events::EventBus;
use crate::keyring::tests::test_secrets;
use crate::keyring::Keyring;

/// Records what it is asked to send. Can fail the first `fail_first`
/// attempts or hang forever.
#[derive(Default)]
pub struct RecordingTransport {
    sent: parking_lot::Mutex<Vec<(Option<String>, TransportMessage)>>,
    attempts: AtomicUsize,
    fail_first: usize,
    stall: bool,
}

impl RecordingTransport {
    pub fn failing(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Self::default()
        }
    }

    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(Option<String>, TransportMessage)> {
        self.sent.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Open every recorded envelope sent to `addr` (`None` for broadcasts)
    /// and decode those that parse as `T`.
    pub fn opened<T: DeserializeOwned>(&self, keyring: &Keyring, addr: Option<&str>) -> Vec<T> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to.as_deref() == addr)
            .filter_map(|(_, envelope)| {
                let payload = SignedPayload::from_json(&envelope.payload).ok()?;
                let plain = payload.open(keyring.channel_key(), &keyring.public_key()).ok()?;
                serde_json::from_slice(&plain).ok()
            })
            .collect()
    }

    async fn record(&self, addr: Option<&str>, msg: TransportMessage) -> crosswire_transport::Result<()> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push((addr.map(str::to_string), msg));
        Ok(())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn start(&self) -> crosswire_transport::Result<()> {
        Ok(())
    }
    async fn stop(&self) -> crosswire_transport::Result<()> {
        Ok(())
    }
    async fn connect(&self, _target: &str) -> crosswire_transport::Result<()> {
        Ok(())
    }
    fn is_connected(&self) -> bool {
        true
    }
    async fn send_message(&self, msg: TransportMessage) -> crosswire_transport::Result<()> {
        self.record(None, msg).await
    }
    async fn send_to(&self, addr: &str, msg: TransportMessage) -> crosswire_transport::Result<()> {
        self.record(Some(addr), msg).await
    }
    fn subscribe(&self) -> mpsc::Receiver<TransportMessage> {
        mpsc::channel(1).1
    }
    async fn discover(&self, _timeout: Duration) -> crosswire_transport::Result<Vec<PeerInfo>> {
        Ok(Vec::new())
    }
    async fn announce(&self, _info: ServiceInfo) -> crosswire_transport::Result<()> {
        Ok(())
    }
    fn mode(&self) -> TransportMode {
        TransportMode::Https
    }
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

/// A channel, a broadcaster over a [`RecordingTransport`] and a keyring
/// whose key matches the test channel password.
pub struct Harness {
    pub db: Arc<Database>,
    pub events: EventBus,
    pub keyring: Arc<Keyring>,
    pub channel: Arc<ChannelManager>,
    pub broadcast: Arc<BroadcastManager>,
    pub transport: Arc<RecordingTransport>,
    pub stop: watch::Sender<bool>,
}

impl Harness {
    pub async fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let events = EventBus::new();
        let identity = Identity::generate();
        let channel = Arc::new(test_manager_with(db.clone(), events.clone()).await);
        let keyring = Arc::new(Keyring::new(test_secrets().key, identity, true));
        let transport = Arc::new(RecordingTransport::default());
        let (stop, shutdown) = watch::channel(false);
        let broadcast = Arc::new(BroadcastManager::start(
            transport.clone(),
            Arc::clone(&keyring),
            events.clone(),
            shutdown,
        ));
        Self {
            db,
            events,
            keyring,
            channel,
            broadcast,
            transport,
            stop,
        }
    }

    /// Encrypt `plaintext` the way a member would and wrap it in a frame
    /// that arrived from `addr`.
    pub fn client_frame(&self, kind: FrameType, sender_id: &str, addr: &str, plaintext: &[u8]) -> TransportMessage {
        let payload = crypto::encrypt(self.keyring.channel_key(), plaintext).unwrap();
        let mut frame = TransportMessage::new(kind, sender_id, payload);
        frame.sender_addr = addr.to_string();
        frame
    }

    pub fn signed_frame(&self, identity: &Identity, member_id: &str, msg: &crosswire_shared::protocol::Message) -> TransportMessage {
        let signed = SignedMessage::sign(identity, member_id, msg).unwrap();
        let plain = serde_json::to_vec(&signed).unwrap();
        self.client_frame(FrameType::Data, member_id, "02:00:00:00:00:aa", &plain)
    }

    /// A member-signed control request arriving from `addr`.
    pub fn signed_control<T: serde::Serialize>(
        &self,
        identity: &Identity,
        member_id: &str,
        addr: &str,
        body: &T,
    ) -> TransportMessage {
        let signed = SignedMessage::sign(identity, member_id, body).unwrap();
        let plain = serde_json::to_vec(&signed).unwrap();
        self.client_frame(FrameType::Control, member_id, addr, &plain)
    }
}
