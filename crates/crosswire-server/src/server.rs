//! Wires the managers together around one transport and runs the
//! background loops.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crosswire_shared::constants::{PROTOCOL_VERSION, SERVER_ID};
use crosswire_shared::protocol::Message;
use crosswire_shared::types::{FrameType, Role};
use crosswire_store::{Database, Member, Repository, Restriction};
use crosswire_transport::{
    build_transport, ServiceInfo, Transport, TransportMessage, TransportStats,
};

use crate::auth::{AuthManager, SESSION_CLEANUP_INTERVAL};
use crate::broadcast::{BroadcastManager, BroadcastStats, SENT_TTL};
use crate::channel::ChannelManager;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::events::EventBus;
use crate::keyring::{ChannelSecrets, Keyring};
use crate::offline::{OfflineManager, OfflineStats, PURGE_INTERVAL};
use crate::rate_limit::RateLimiter;
use crate::router::{MessageRouter, RouterContext, RouterStats};
use crate::spam::{SpamConfig, SpamDetector, SpamStats};

pub const STATS_INTERVAL: Duration = Duration::from_secs(60);
pub const OFFLINE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// Members silent for longer than this are marked offline.
pub const OFFLINE_THRESHOLD: Duration = Duration::from_secs(90);
pub const SPAM_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const RATE_PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Window of the per-member message rate limit.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub channel_id: String,
    pub channel_name: String,
    pub uptime_secs: u64,
    pub total_members: usize,
    pub online_members: usize,
    pub sessions: usize,
    pub broadcast: BroadcastStats,
    pub router: RouterStats,
    pub offline: OfflineStats,
    pub spam: SpamStats,
    pub transport: TransportStats,
}

pub struct Server {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    keyring: Arc<Keyring>,
    events: EventBus,
    channel: Arc<ChannelManager>,
    broadcast: Arc<BroadcastManager>,
    auth: Arc<AuthManager>,
    offline: Arc<OfflineManager>,
    rate_limiter: Option<RateLimiter>,
    spam: Arc<SpamDetector>,
    router: MessageRouter,
    shutdown: watch::Sender<bool>,
    started_at: Instant,
}

impl Server {
    /// Open the configured database and transport, then build the server.
    pub async fn open(config: ServerConfig) -> Result<Arc<Self>> {
        let db = match &config.database_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        let transport = build_transport(config.transport_config())?;
        Self::new(config, Arc::new(db), transport).await
    }

    /// Build every manager over the given repository and transport. Nothing
    /// is received until [`Server::start`].
    pub async fn new(
        config: ServerConfig,
        repo: Arc<dyn Repository>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let identity = config.server_identity()?;
        let server_public_key = identity.public_key_bytes();

        // Argon2 runs on the blocking pool.
        let password = config.channel_password.clone();
        let channel_id = config.channel_id.clone();
        let secrets = tokio::task::spawn_blocking(move || ChannelSecrets::derive(&password, &channel_id))
            .await
            .map_err(|e| ServerError::Internal(format!("key derivation task failed: {e}")))??;

        let events = EventBus::new();
        let channel = Arc::new(
            ChannelManager::initialize(repo.clone(), events.clone(), &config, &secrets, server_public_key)
                .await?,
        );
        let keyring = Arc::new(Keyring::new(secrets.key, identity, config.enable_signature));
        info!(
            channel = %config.channel_id,
            key = %keyring.fingerprint(),
            signing = keyring.signs(),
            "channel keys ready"
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let broadcast = Arc::new(BroadcastManager::start(
            transport.clone(),
            Arc::clone(&keyring),
            events.clone(),
            shutdown_rx.clone(),
        ));
        let offline = Arc::new(OfflineManager::new(repo.clone(), events.clone(), config.enable_offline));
        let auth = Arc::new(AuthManager::new(
            Arc::clone(&channel),
            Arc::clone(&broadcast),
            Arc::clone(&keyring),
            Arc::clone(&offline),
            events.clone(),
            config.session_timeout,
        ));
        let rate_limiter = config
            .enable_rate_limit
            .then(|| RateLimiter::new(config.max_message_rate, RATE_WINDOW));
        let spam = Arc::new(SpamDetector::new(SpamConfig::default()));

        let router = MessageRouter::start(
            RouterContext {
                repo,
                channel: Arc::clone(&channel),
                broadcast: Arc::clone(&broadcast),
                auth: Arc::clone(&auth),
                offline: Arc::clone(&offline),
                keyring: Arc::clone(&keyring),
                rate_limiter: rate_limiter.clone(),
                spam: Arc::clone(&spam),
                events: events.clone(),
            },
            shutdown_rx,
        );

        Ok(Arc::new(Self {
            config,
            transport,
            keyring,
            events,
            channel,
            broadcast,
            auth,
            offline,
            rate_limiter,
            spam,
            router,
            shutdown,
            started_at: Instant::now(),
        }))
    }

    /// Start the transport, the inbound dispatch loop and the maintenance
    /// loops, then announce the channel.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.transport.start().await?;
        self.spawn_dispatch();
        self.spawn_maintenance();

        if let Err(e) = self.transport.announce(self.service_info().await).await {
            warn!(error = %e, "service announcement failed");
        }
        info!(
            channel = %self.config.channel_id,
            name = %self.config.channel_name,
            mode = %self.transport.mode(),
            "server started"
        );
        Ok(())
    }

    /// Stop every loop and the transport.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.transport.stop().await {
            warn!(error = %e, "transport stop failed");
        }
        info!("server stopped");
    }

    fn spawn_dispatch(self: &Arc<Self>) {
        let server = Arc::clone(self);
        let mut inbound = self.transport.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    frame = inbound.recv() => match frame {
                        Some(frame) => server.dispatch(frame).await,
                        None => {
                            warn!("transport closed its inbound queue");
                            break;
                        }
                    },
                }
            }
            debug!("dispatch loop stopped");
        });
    }

    /// Route one inbound frame by type.
    pub async fn dispatch(self: &Arc<Self>, frame: TransportMessage) {
        if self.broadcast.is_sent_by_me(&frame.id).await {
            trace!(id = %frame.id, "ignoring own broadcast");
            return;
        }

        match frame.kind {
            FrameType::Auth => {
                let auth = Arc::clone(&self.auth);
                tokio::spawn(async move {
                    if let Err(e) = auth.handle_join(&frame).await {
                        debug!(from = %frame.sender_addr, error = %e, "join refused");
                    }
                });
            }
            FrameType::Data | FrameType::Control => {
                if let Err(e) = self.router.handle_client_message(frame) {
                    debug!(error = %e, "frame not queued");
                }
            }
            other => trace!(kind = ?other, "frame type handled by the transport"),
        }
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let server = Arc::clone(self);
        self.spawn_periodic("stats", STATS_INTERVAL, move || {
            let server = Arc::clone(&server);
            async move { server.report_stats().await }
        });

        let server = Arc::clone(self);
        self.spawn_periodic("offline-check", OFFLINE_CHECK_INTERVAL, move || {
            let server = Arc::clone(&server);
            async move {
                let gone = server.channel.check_offline_members(OFFLINE_THRESHOLD).await;
                if !gone.is_empty() {
                    debug!(count = gone.len(), "marked silent members offline");
                }
            }
        });

        let server = Arc::clone(self);
        self.spawn_periodic("session-cleanup", SESSION_CLEANUP_INTERVAL, move || {
            let server = Arc::clone(&server);
            async move {
                server.auth.cleanup_expired_sessions().await;
                server.broadcast.cleanup_sent(SENT_TTL).await;
            }
        });

        let server = Arc::clone(self);
        self.spawn_periodic("spam-cleanup", SPAM_CLEANUP_INTERVAL, move || {
            let server = Arc::clone(&server);
            async move {
                server.spam.cleanup().await;
            }
        });

        if self.offline.is_enabled() {
            let server = Arc::clone(self);
            self.spawn_periodic("offline-purge", PURGE_INTERVAL, move || {
                let server = Arc::clone(&server);
                async move {
                    server.offline.purge_expired().await;
                }
            });
        }

        if let Some(limiter) = self.rate_limiter.clone() {
            self.spawn_periodic("rate-purge", RATE_PURGE_INTERVAL, move || {
                let limiter = limiter.clone();
                async move { limiter.purge_stale().await }
            });
        }
    }

    /// Run `task` every `period` until shutdown. The first run is one
    /// period after start.
    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, task: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => task().await,
                }
            }
            debug!(task = name, "periodic task stopped");
        });
    }

    async fn report_stats(&self) {
        let stats = self.stats().await;
        info!(
            members = stats.total_members,
            online = stats.online_members,
            sessions = stats.sessions,
            broadcast_sent = stats.broadcast.total,
            broadcast_failed = stats.broadcast.failed,
            routed = stats.router.processed,
            rejected = stats.router.rejected,
            dropped = stats.router.dropped,
            offline_queued = stats.offline.current_queued,
            "server stats"
        );
        if let Err(e) = self.transport.announce(self.service_info().await).await {
            debug!(error = %e, "service re-announcement failed");
        }
    }

    async fn service_info(&self) -> ServiceInfo {
        let channel = self.channel.channel().await;
        ServiceInfo {
            channel_id: channel.id,
            channel_name: channel.name,
            mode: self.transport.mode(),
            port: self.config.listen_addr.port(),
            interface: self.config.interface.clone(),
            version: PROTOCOL_VERSION,
            max_members: channel.max_members,
            current_members: self.channel.total_count().await,
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let channel = self.channel.channel().await;
        ServerStats {
            channel_id: channel.id,
            channel_name: channel.name,
            uptime_secs: self.started_at.elapsed().as_secs(),
            total_members: self.channel.total_count().await,
            online_members: self.channel.online_count().await,
            sessions: self.auth.session_count().await,
            broadcast: self.broadcast.stats(),
            router: self.router.stats(),
            offline: self.offline.stats().await,
            spam: self.spam.stats().await,
            transport: self.transport.stats(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<ChannelManager> {
        &self.channel
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn spam(&self) -> &Arc<SpamDetector> {
        &self.spam
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keyring.public_key()
    }

    // -----------------------------------------------------------------------
    // Moderation
    // -----------------------------------------------------------------------

    /// Tell the channel about a moderation action.
    async fn notify(&self, event: &str, member_id: &str, extra: serde_json::Value) {
        let channel_id = self.channel.channel_id().await;
        let notice = Message::system(&channel_id, event, member_id, extra);
        if let Err(e) = self.broadcast.broadcast(notice) {
            error!(event, member = member_id, error = %e, "failed to broadcast notice");
        }
    }

    pub async fn kick(&self, member_id: &str, reason: &str, kicked_by: &str) -> Result<Member> {
        let member = self.channel.kick_member(member_id, reason, kicked_by).await?;
        self.auth.remove_session(member_id).await;
        self.forget_history(member_id).await;
        self.offline.clear(member_id).await;
        self.notify(
            "member_kicked",
            member_id,
            json!({ "nickname": member.nickname, "reason": reason, "kicked_by": kicked_by }),
        )
        .await;
        Ok(member)
    }

    pub async fn mute(&self, member_id: &str, duration: Option<Duration>, reason: &str) -> Result<Restriction> {
        let restriction = self.channel.mute_member(member_id, duration, reason).await?;
        self.notify(
            "member_muted",
            member_id,
            json!({ "reason": reason, "expires_at": restriction.expires_at }),
        )
        .await;
        Ok(restriction)
    }

    pub async fn unmute(&self, member_id: &str) -> Result<()> {
        self.channel.unmute_member(member_id).await?;
        self.notify("member_unmuted", member_id, json!({})).await;
        Ok(())
    }

    pub async fn ban(
        &self,
        member_id: &str,
        reason: &str,
        banned_by: &str,
        duration: Option<Duration>,
    ) -> Result<Restriction> {
        let restriction = self.channel.ban_member(member_id, reason, banned_by, duration).await?;
        self.auth.remove_session(member_id).await;
        self.forget_history(member_id).await;
        self.offline.clear(member_id).await;
        self.notify(
            "member_banned",
            member_id,
            json!({ "reason": reason, "banned_by": banned_by, "expires_at": restriction.expires_at }),
        )
        .await;
        Ok(restriction)
    }

    pub async fn unban(&self, member_id: &str) -> Result<()> {
        self.channel.unban_member(member_id).await
    }

    pub async fn set_role(&self, member_id: &str, role: Role) -> Result<Member> {
        let member = self.channel.update_member_role(member_id, role).await?;
        self.notify("member_role_changed", member_id, json!({ "role": role })).await;
        Ok(member)
    }

    async fn forget_history(&self, member_id: &str) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.reset(member_id).await;
        }
        self.spam.clear_member_history(member_id).await;
    }
}
