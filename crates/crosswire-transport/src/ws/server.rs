//! WebSocket listener: `/ws` upgrades, `/info` describes the channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crosswire_shared::types::TransportMode;

use crate::error::{Result, TransportError};
use crate::seen::{SeenCache, SEEN_CLEANUP_INTERVAL};
use crate::transport::{
    PeerInfo, ServiceInfo, StatsCounter, Subscribers, Transport, TransportConfig,
    TransportMessage, TransportStats,
};

use super::{IDLE_TIMEOUT, PING_INTERVAL};

pub struct WsServerTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    connections: RwLock<HashMap<SocketAddr, mpsc::Sender<Message>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    service: Mutex<Option<ServiceInfo>>,
    seen: SeenCache,
    subscribers: Subscribers,
    stats: StatsCounter,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl WsServerTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let subscribers = Subscribers::new(config.recv_buffer);
        Self {
            inner: Arc::new(Inner {
                config,
                connections: RwLock::new(HashMap::new()),
                local_addr: Mutex::new(None),
                service: Mutex::new(None),
                seen: SeenCache::default(),
                subscribers,
                stats: StatsCounter::default(),
                running: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.inner.connections.read().keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(inner): State<Arc<Inner>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(inner, socket, addr))
}

async fn info_handler(State(inner): State<Arc<Inner>>) -> impl IntoResponse {
    let service = inner.service.lock().clone();
    match service {
        Some(mut info) => {
            info.current_members = info.current_members.max(inner.connections.read().len());
            Json(info).into_response()
        }
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn handle_socket(inner: Arc<Inner>, socket: WebSocket, addr: SocketAddr) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(inner.config.send_buffer.max(1));
    inner.connections.write().insert(addr, tx);
    info!(%addr, "websocket client connected");

    let mut shutdown = inner.shutdown.subscribe();
    let writer = tokio::spawn(async move {
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
                        if sink.send(msg).await.is_err() {
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
            }
        }
    });

    loop {
        let next = match tokio::time::timeout(IDLE_TIMEOUT, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!(%addr, "websocket client idle, dropping");
                break;
            }
        };
        match next {
            Some(Ok(Message::Binary(data))) => inner.handle_inbound(&data, addr),
            Some(Ok(Message::Text(text))) => inner.handle_inbound(text.as_bytes(), addr),
            Some(Ok(Message::Close(_))) | None => break,
            // Pings are answered by axum; any frame counts as liveness.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(%addr, error = %e, "websocket read failed");
                break;
            }
        }
    }

    writer.abort();
    inner.connections.write().remove(&addr);
    info!(%addr, "websocket client disconnected");
}

impl Inner {
    fn handle_inbound(&self, data: &[u8], addr: SocketAddr) {
        self.stats.record_received(data.len());
        let mut msg = match TransportMessage::from_bytes(data) {
            Ok(m) => m,
            Err(e) => {
                self.stats.record_error();
                debug!(%addr, error = %e, "dropping malformed envelope");
                return;
            }
        };
        if !self.seen.insert(&msg.id) {
            trace!(id = %msg.id, "duplicate message");
            return;
        }
        msg.sender_addr = addr.to_string();
        self.stats.record_message_received();
        self.subscribers.deliver(msg);
    }

    fn enqueue(&self, tx: &mpsc::Sender<Message>, bytes: &[u8], addr: SocketAddr) -> bool {
        match tx.try_send(Message::Binary(bytes.to_vec())) {
            Ok(()) => {
                self.stats.record_sent(bytes.len());
                true
            }
            Err(e) => {
                self.stats.record_error();
                warn!(%addr, error = %e, "websocket outbound queue rejected message");
                false
            }
        }
    }
}

async fn seen_cleanup_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(SEEN_CLEANUP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => { inner.seen.cleanup(); }
        }
    }
}

#[async_trait]
impl Transport for WsServerTransport {
    async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = match tokio::net::TcpListener::bind(self.inner.config.listen_addr).await {
            Ok(l) => l,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let bound = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(bound);
        self.inner.shutdown.send_replace(false);
        self.inner.stats.mark_started();

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/info", get(info_handler))
            .with_state(Arc::clone(&self.inner));

        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(e) = server.await {
                warn!(error = %e, "websocket server exited with error");
            }
        });
        tokio::spawn(seen_cleanup_loop(
            Arc::clone(&self.inner),
            self.inner.shutdown.subscribe(),
        ));

        info!(addr = %bound, "websocket transport listening");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.connections.write().clear();
        info!("websocket transport stopped");
        Ok(())
    }

    async fn connect(&self, _target: &str) -> Result<()> {
        Err(TransportError::Unsupported(
            "the websocket server accepts connections, it does not dial".into(),
        ))
    }

    fn is_connected(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn send_message(&self, msg: TransportMessage) -> Result<()> {
        let bytes = msg.to_bytes()?;
        let targets: Vec<(SocketAddr, mpsc::Sender<Message>)> = self
            .inner
            .connections
            .read()
            .iter()
            .map(|(addr, tx)| (*addr, tx.clone()))
            .collect();

        for (addr, tx) in &targets {
            self.inner.enqueue(tx, &bytes, *addr);
        }
        self.inner.seen.insert(&msg.id);
        self.inner.stats.record_message_sent();
        Ok(())
    }

    async fn send_to(&self, addr: &str, msg: TransportMessage) -> Result<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;
        let tx = self
            .inner
            .connections
            .read()
            .get(&addr)
            .cloned()
            .ok_or(TransportError::NotConnected)?;

        let bytes = msg.to_bytes()?;
        if !self.inner.enqueue(&tx, &bytes, addr) {
            return Err(TransportError::QueueFull);
        }
        self.inner.stats.record_message_sent();
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<TransportMessage> {
        self.inner.subscribers.subscribe()
    }

    /// A listener has nothing to discover.
    async fn discover(&self, _timeout: Duration) -> Result<Vec<PeerInfo>> {
        Ok(Vec::new())
    }

    async fn announce(&self, info: ServiceInfo) -> Result<()> {
        *self.inner.service.lock() = Some(info);
        Ok(())
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Https
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }
}
