//! WebSocket dialer with automatic reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crosswire_shared::types::TransportMode;

use crate::error::{Result, TransportError};
use crate::seen::SeenCache;
use crate::transport::{
    PeerInfo, ServiceInfo, StatsCounter, Subscribers, Transport, TransportConfig,
    TransportMessage, TransportStats,
};

use super::{info_url, PING_INTERVAL};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(15);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct WsClientTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    url: Mutex<Option<String>>,
    /// Outbound queue of the live connection, if any.
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    connected: AtomicBool,
    seen: SeenCache,
    subscribers: Subscribers,
    stats: StatsCounter,
    shutdown: watch::Sender<bool>,
}

impl WsClientTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let subscribers = Subscribers::new(config.recv_buffer);
        let url = config.url.clone();
        Self {
            inner: Arc::new(Inner {
                config,
                url: Mutex::new(url),
                outbound: Mutex::new(None),
                connected: AtomicBool::new(false),
                seen: SeenCache::default(),
                subscribers,
                stats: StatsCounter::default(),
                shutdown,
            }),
        }
    }
}

impl Inner {
    fn handle_inbound(&self, data: &[u8], url: &str) {
        self.stats.record_received(data.len());
        let mut msg = match TransportMessage::from_bytes(data) {
            Ok(m) => m,
            Err(e) => {
                self.stats.record_error();
                debug!(error = %e, "dropping malformed envelope");
                return;
            }
        };
        if !self.seen.insert(&msg.id) {
            return;
        }
        msg.sender_addr = url.to_string();
        self.stats.record_message_received();
        self.subscribers.deliver(msg);
    }

    /// Pump one established connection until it fails or shutdown fires.
    async fn run_connection(&self, stream: WsStream, url: &str) {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.send_buffer.max(1));
        *self.outbound.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        info!(url, "websocket connected");

        let mut shutdown = self.shutdown.subscribe();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                outbound = rx.recv() => match outbound {
                    Some(msg) => {
                        let sent = tokio::time::timeout(self.config.write_timeout, sink.send(msg)).await;
                        if !matches!(sent, Ok(Ok(()))) {
                            self.stats.record_error();
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                inbound = tokio::time::timeout(self.config.read_timeout, source.next()) => match inbound {
                    Ok(Some(Ok(Message::Binary(data)))) => self.handle_inbound(&data, url),
                    Ok(Some(Ok(Message::Text(text)))) => self.handle_inbound(text.as_bytes(), url),
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        debug!(url, error = %e, "websocket read failed");
                        break;
                    }
                    Err(_) => {
                        warn!(url, "websocket read timed out");
                        break;
                    }
                },
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        *self.outbound.lock() = None;
        info!(url, "websocket disconnected");
    }
}

async fn dial(url: &str, timeout: Duration) -> Result<WsStream> {
    let (stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| TransportError::Timeout("websocket connect"))??;
    Ok(stream)
}

async fn connection_loop(inner: Arc<Inner>, first: WsStream, url: String) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut stream = Some(first);
    let mut backoff = BACKOFF_START;

    loop {
        if let Some(s) = stream.take() {
            inner.run_connection(s, &url).await;
            backoff = BACKOFF_START;
        }
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        inner.stats.record_retry();
        match dial(&url, inner.config.connect_timeout).await {
            Ok(s) => stream = Some(s),
            Err(e) => {
                warn!(url, error = %e, delay = ?backoff, "websocket reconnect failed");
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
}

#[async_trait]
impl Transport for WsClientTransport {
    async fn start(&self) -> Result<()> {
        self.inner.shutdown.send_replace(false);
        self.inner.stats.mark_started();
        let url = self.inner.url.lock().clone();
        match url {
            Some(url) => self.connect(&url).await,
            None => Ok(()),
        }
    }

    async fn stop(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        self.inner.connected.store(false, Ordering::SeqCst);
        *self.inner.outbound.lock() = None;
        Ok(())
    }

    async fn connect(&self, target: &str) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let stream = dial(target, self.inner.config.connect_timeout).await?;
        *self.inner.url.lock() = Some(target.to_string());
        self.inner.shutdown.send_replace(false);
        tokio::spawn(connection_loop(
            Arc::clone(&self.inner),
            stream,
            target.to_string(),
        ));

        // Wait for the connection task to publish its queue.
        let deadline = tokio::time::Instant::now() + self.inner.config.connect_timeout;
        while !self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::Timeout("websocket handshake"));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn send_message(&self, msg: TransportMessage) -> Result<()> {
        let tx = self
            .inner
            .outbound
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let bytes = msg.to_bytes()?;
        let len = bytes.len();
        tx.try_send(Message::Binary(bytes)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected,
        })?;
        self.inner.seen.insert(&msg.id);
        self.inner.stats.record_sent(len);
        self.inner.stats.record_message_sent();
        Ok(())
    }

    /// A client has one peer: the server.
    async fn send_to(&self, _addr: &str, msg: TransportMessage) -> Result<()> {
        self.send_message(msg).await
    }

    fn subscribe(&self) -> mpsc::Receiver<TransportMessage> {
        self.inner.subscribers.subscribe()
    }

    /// Ask the configured server's `/info` endpoint what it hosts.
    async fn discover(&self, timeout: Duration) -> Result<Vec<PeerInfo>> {
        let Some(url) = self.inner.url.lock().clone() else {
            return Ok(Vec::new());
        };
        let endpoint = info_url(&url)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let response = client.get(&endpoint).send().await?;
        if !response.status().is_success() {
            debug!(endpoint, status = %response.status(), "server has no channel to advertise");
            return Ok(Vec::new());
        }
        let info: ServiceInfo = response.json().await?;
        Ok(vec![PeerInfo {
            id: info.channel_id.clone(),
            address: url,
            mode: TransportMode::Https,
            last_seen: Utc::now(),
            channel_id_hash: info.channel_hash8(),
            version: info.version,
        }])
    }

    async fn announce(&self, _info: ServiceInfo) -> Result<()> {
        Err(TransportError::Unsupported(
            "websocket clients do not announce".into(),
        ))
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Https
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }
}
