//! Inbound path. Every member frame is decrypted, authenticated and run
//! through the abuse controls before anything is persisted or rebroadcast.
//!
//! Frames are queued and handled by one worker so that messages from a
//! member leave the server in the order they arrived.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use crosswire_shared::constants::SERVER_ID;
use crosswire_shared::identity::verify_signature;
use crosswire_shared::protocol::{
    AckMessage, ControlHeader, LeaveRequest, Message, SignedMessage, StatusUpdate, SyncRequest,
    SyncResponse, ACK_TYPE, LEAVE_TYPE, STATUS_UPDATE_TYPE, SYNC_REQUEST_TYPE, SYNC_RESPONSE_TYPE,
};
use crosswire_shared::types::{FrameType, MessageType, UserStatus};
use crosswire_store::{Member, MessageRepository, Reaction, Repository, StoreError};
use crosswire_transport::TransportMessage;

use crate::auth::AuthManager;
use crate::broadcast::BroadcastManager;
use crate::channel::ChannelManager;
use crate::error::{Result, ServerError};
use crate::events::{EventBus, EventType};
use crate::keyring::Keyring;
use crate::offline::{persist_once, OfflineManager};
use crate::rate_limit::RateLimiter;
use crate::spam::SpamDetector;

pub const QUEUE_CAPACITY: usize = 200;
pub const DEFAULT_SYNC_LIMIT: usize = 100;
/// Upper bound on rows scanned for one sync request.
const SYNC_SCAN_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RouterStats {
    pub processed: u64,
    pub rejected: u64,
    /// Frames refused because the queue was full.
    pub dropped: u64,
    pub queue_len: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SyncStats {
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub offline_messages: usize,
}

/// Everything the router talks to.
pub struct RouterContext {
    pub repo: Arc<dyn Repository>,
    pub channel: Arc<ChannelManager>,
    pub broadcast: Arc<BroadcastManager>,
    pub auth: Arc<AuthManager>,
    pub offline: Arc<OfflineManager>,
    pub keyring: Arc<Keyring>,
    /// `None` when rate limiting is disabled.
    pub rate_limiter: Option<RateLimiter>,
    pub spam: Arc<SpamDetector>,
    pub events: EventBus,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

struct Inner {
    ctx: RouterContext,
    counters: Counters,
}

pub struct MessageRouter {
    inner: Arc<Inner>,
    queue: mpsc::Sender<TransportMessage>,
}

enum ReactionChange {
    Add { target: String, emoji: String },
    Remove { target: String, emoji: String },
}

impl ReactionChange {
    fn parse(msg: &Message) -> Result<Option<Self>> {
        if msg.kind != MessageType::Reaction {
            return Ok(None);
        }
        let target = msg
            .content_str("message_id")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServerError::Protocol("reaction without message_id".into()))?
            .to_string();
        let emoji = msg
            .content_str("emoji")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServerError::Protocol("reaction without emoji".into()))?
            .to_string();
        match msg.content_str("action").unwrap_or("add") {
            "add" => Ok(Some(Self::Add { target, emoji })),
            "remove" => Ok(Some(Self::Remove { target, emoji })),
            other => Err(ServerError::Protocol(format!("unknown reaction action {other:?}"))),
        }
    }
}

/// Out-of-range cursors sort after everything.
fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs.max(0), 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Messages after the client's cursor, oldest first, and whether more
/// remain. The cursor is `(seconds, id)`; a message in the cursor's second
/// is newer only if its id sorts after `last_id`.
pub fn select_since(
    mut messages: Vec<Message>,
    since_secs: i64,
    last_id: &str,
    limit: usize,
) -> (Vec<Message>, bool) {
    messages.retain(|m| {
        let secs = m.timestamp.map_or(0, |t| t.timestamp());
        secs > since_secs || (secs == since_secs && m.id.as_str() > last_id)
    });
    messages.sort_by(|a, b| {
        let secs = |m: &Message| m.timestamp.map_or(0, |t| t.timestamp());
        secs(a).cmp(&secs(b)).then_with(|| a.id.cmp(&b.id))
    });
    let has_more = messages.len() > limit;
    messages.truncate(limit);
    (messages, has_more)
}

impl MessageRouter {
    pub fn start(ctx: RouterContext, shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            ctx,
            counters: Counters::default(),
        });
        tokio::spawn(worker(Arc::clone(&inner), rx, shutdown));
        Self { inner, queue: tx }
    }

    /// Enqueue a Data or Control frame. Never waits.
    pub fn handle_client_message(&self, frame: TransportMessage) -> Result<()> {
        self.queue.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(frame) => {
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(id = %frame.id, sender = %frame.sender_id, "router queue full, dropping frame");
                ServerError::Capacity("router queue is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                ServerError::Internal("router worker stopped".into())
            }
        })
    }

    /// Run one frame through the pipeline inline, bypassing the queue.
    pub async fn process(&self, frame: TransportMessage) -> Result<()> {
        self.inner.process(frame).await
    }

    pub fn queue_len(&self) -> usize {
        QUEUE_CAPACITY - self.queue.capacity()
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.inner.counters;
        RouterStats {
            processed: c.processed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            queue_len: self.queue_len(),
            queue_capacity: QUEUE_CAPACITY,
        }
    }

    pub async fn sync_stats(&self) -> SyncStats {
        SyncStats {
            queue_len: self.queue_len(),
            queue_capacity: QUEUE_CAPACITY,
            offline_messages: self.inner.ctx.offline.total_queued().await,
        }
    }
}

impl Inner {
    async fn process(&self, frame: TransportMessage) -> Result<()> {
        let result = match frame.kind {
            FrameType::Data => self.handle_data(&frame).await.map(|_| ()),
            FrameType::Control => self.handle_control(&frame).await,
            other => {
                trace!(kind = ?other, "router ignores frame");
                return Ok(());
            }
        };
        match &result {
            Ok(()) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(id = %frame.id, sender = %frame.sender_id, reason = %e, "frame rejected");
            }
        }
        result
    }

    async fn handle_data(&self, frame: &TransportMessage) -> Result<Message> {
        let ctx = &self.ctx;

        let signed = self.open_signed(frame)?;
        let member = self.verified_signer(&signed).await?;

        let mut msg: Message = serde_json::from_slice(&signed.message)?;
        if msg.sender_id != signed.sender_id {
            return Err(ServerError::Policy(format!(
                "sender mismatch: envelope {} carries message from {}",
                signed.sender_id, msg.sender_id
            )));
        }
        let reaction = ReactionChange::parse(&msg)?;
        match ctx.repo.get_message(&msg.id) {
            Ok(_) => return Err(ServerError::Policy("duplicate message id".into())),
            Err(StoreError::NotFound) => {}
            Err(e) => warn!(message = %msg.id, error = %e, "duplicate lookup failed"),
        }

        if ctx.channel.is_muted(&member.id).await {
            return Err(ServerError::Policy("sender is muted".into()));
        }
        if let Some(limiter) = &ctx.rate_limiter {
            if !limiter.check(&member.id).await {
                return Err(ServerError::Policy("rate limit exceeded".into()));
            }
        }
        ctx.spam
            .check(&msg, &member.id)
            .await
            .map_err(|reason| ServerError::Policy(reason.to_string()))?;

        msg.channel_id = ctx.channel.channel_id().await;
        msg.timestamp.get_or_insert_with(Utc::now);
        msg.original_sender_id = Some(member.id.clone());
        if msg.sender_nickname.is_empty() {
            msg.sender_nickname = member.nickname.clone();
        }

        if let Err(e) = persist_once(ctx.repo.as_ref(), &msg) {
            error!(message = %msg.id, error = %e, "failed to persist message, broadcasting anyway");
        }
        if let Some(change) = reaction {
            self.apply_reaction(&member.id, change);
        }

        match ctx.channel.touch_heartbeat(&member.id).await {
            Ok(UserStatus::Offline) => self.spawn_offline_delivery(&member.id),
            Ok(_) => {}
            Err(e) => warn!(member = %member.id, error = %e, "heartbeat update failed"),
        }

        ctx.broadcast.broadcast(msg.clone())?;

        if ctx.offline.is_enabled() {
            for absent in ctx.channel.members().await {
                if absent.status != UserStatus::Offline || absent.id == member.id || absent.id == SERVER_ID {
                    continue;
                }
                if let Err(e) = ctx.offline.store(&absent.id, msg.clone()).await {
                    warn!(member = %absent.id, error = %e, "failed to queue offline message");
                }
            }
        }

        ctx.events.publish(EventType::MessageReceived, json!({ "message": msg }));
        trace!(message = %msg.id, sender = %member.id, "message routed");
        Ok(msg)
    }

    fn open_signed(&self, frame: &TransportMessage) -> Result<SignedMessage> {
        let plaintext = self.ctx.keyring.decrypt(&frame.payload)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// The member named in the envelope, once its signature checks out
    /// against that member's registered key.
    async fn verified_signer(&self, signed: &SignedMessage) -> Result<Member> {
        let member = self
            .ctx
            .channel
            .get_member(&signed.sender_id)
            .await
            .map_err(|_| ServerError::Policy(format!("unknown sender {}", signed.sender_id)))?;
        let public_key = member
            .public_key
            .as_deref()
            .ok_or_else(|| ServerError::Policy("sender has no registered key".into()))?;
        verify_signature(public_key, &signed.message, &signed.signature)?;
        Ok(member)
    }

    fn apply_reaction(&self, member_id: &str, change: ReactionChange) {
        let repo = self.ctx.repo.as_ref();
        let (result, kind, target, emoji) = match change {
            ReactionChange::Add { target, emoji } => {
                let reaction = Reaction {
                    message_id: target.clone(),
                    member_id: member_id.to_string(),
                    emoji: emoji.clone(),
                    created_at: Utc::now(),
                };
                (repo.add_reaction(&reaction), EventType::ReactionAdded, target, emoji)
            }
            ReactionChange::Remove { target, emoji } => (
                repo.remove_reaction(&target, member_id, &emoji),
                EventType::ReactionRemoved,
                target,
                emoji,
            ),
        };
        match result {
            Ok(true) => self.ctx.events.publish(
                kind,
                json!({ "message_id": target, "member_id": member_id, "emoji": emoji }),
            ),
            Ok(false) => trace!(message = %target, member = member_id, "reaction unchanged"),
            Err(e) => error!(message = %target, member = member_id, error = %e, "reaction update failed"),
        }
    }

    fn spawn_offline_delivery(&self, member_id: &str) {
        if !self.ctx.offline.is_enabled() {
            return;
        }
        let offline = Arc::clone(&self.ctx.offline);
        let broadcast = Arc::clone(&self.ctx.broadcast);
        let member_id = member_id.to_string();
        tokio::spawn(async move {
            offline.deliver(&member_id, &broadcast).await;
        });
    }

    async fn handle_control(&self, frame: &TransportMessage) -> Result<()> {
        let signed = self.open_signed(frame)?;
        let signer = self.verified_signer(&signed).await?;
        let body = signed.message.as_slice();
        let header: ControlHeader = serde_json::from_slice(body)?;
        match header.kind.as_str() {
            SYNC_REQUEST_TYPE => {
                let request: SyncRequest = serde_json::from_slice(body)?;
                self.handle_sync(frame, &signer.id, request).await
            }
            STATUS_UPDATE_TYPE => {
                let update: StatusUpdate = serde_json::from_slice(body)?;
                ensure_signer(&signer.id, &update.member_id)?;
                self.handle_status(update).await
            }
            ACK_TYPE => {
                let ack: AckMessage = serde_json::from_slice(body)?;
                ensure_signer(&signer.id, &ack.member_id)?;
                self.ctx.broadcast.record_ack(&ack.message_id, &ack.member_id).await;
                Ok(())
            }
            LEAVE_TYPE => {
                let leave: LeaveRequest = serde_json::from_slice(body)?;
                ensure_signer(&signer.id, &leave.member_id)?;
                self.ctx.auth.handle_leave(&leave.member_id).await
            }
            other => Err(ServerError::Protocol(format!("unknown control message {other:?}"))),
        }
    }

    async fn handle_status(&self, update: StatusUpdate) -> Result<()> {
        let channel = &self.ctx.channel;
        let before = channel.touch_heartbeat(&update.member_id).await?;
        channel.update_member_status(&update.member_id, update.status).await?;
        if before == UserStatus::Offline && update.status.is_present() {
            self.spawn_offline_delivery(&update.member_id);
        }
        Ok(())
    }

    async fn handle_sync(&self, frame: &TransportMessage, signer: &str, request: SyncRequest) -> Result<()> {
        let ctx = &self.ctx;
        let member_id = if request.member_id.is_empty() {
            signer.to_string()
        } else {
            request.member_id.clone()
        };
        ensure_signer(signer, &member_id)?;

        let channel = ctx.channel.channel().await;
        let limit = request.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_SYNC_LIMIT);

        // Fetch from the start of the cursor's second; `select_since` does
        // the exact comparison.
        let cursor = from_unix(request.last_timestamp);
        let floor = cursor
            .checked_sub_signed(chrono::Duration::milliseconds(1))
            .unwrap_or(cursor);
        let candidates = ctx.repo.messages_since(&channel.id, floor, SYNC_SCAN_LIMIT)?;
        let (messages, has_more) =
            select_since(candidates, request.last_timestamp, &request.last_message_id, limit);

        let members_since = from_unix(request.last_member_timestamp);
        let members = ctx
            .channel
            .members()
            .await
            .into_iter()
            .filter(|m| m.last_activity() >= members_since)
            .map(|m| m.info())
            .collect();

        let offline_messages = if ctx.offline.is_enabled() {
            ctx.offline.take_messages(&member_id).await
        } else {
            Vec::new()
        };

        let response = SyncResponse {
            kind: SYNC_RESPONSE_TYPE.to_string(),
            request_id: request.request_id,
            channel_id: channel.id.clone(),
            timestamp: Utc::now().timestamp(),
            messages,
            members,
            channel: channel.info(),
            has_more,
            offline_messages,
        };
        debug!(
            member = %member_id,
            messages = response.messages.len(),
            members = response.members.len(),
            offline = response.offline_messages.len(),
            has_more,
            "answering sync request"
        );
        ctx.broadcast
            .send_to(&frame.sender_addr, FrameType::Control, &response)
            .await
    }
}

/// A control request may only act for the member who signed it.
fn ensure_signer(signer: &str, member_id: &str) -> Result<()> {
    if signer != member_id {
        return Err(ServerError::Policy(format!("{signer} cannot act for {member_id}")));
    }
    Ok(())
}

async fn worker(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<TransportMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = rx.recv() => match frame {
                // Errors are counted and logged in `process`.
                Some(frame) => { let _ = inner.process(frame).await; }
                None => break,
            },
        }
    }
    debug!("router worker stopped");
}
