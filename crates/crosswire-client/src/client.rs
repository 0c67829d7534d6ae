//! A channel member over any [`Transport`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crosswire_shared::constants::SERVER_ID;
use crosswire_shared::crypto::{self, SymmetricKey};
use crosswire_shared::protocol::{
    AckMessage, ControlHeader, JoinRequest, JoinResponse, LeaveRequest, MemberInfo, Message,
    StatusUpdate, SyncRequest, SyncResponse, LEAVE_TYPE, STATUS_UPDATE_TYPE, SYNC_REQUEST_TYPE,
    SYNC_RESPONSE_TYPE,
};
use crosswire_shared::types::{FrameType, UserStatus};
use crosswire_shared::Identity;
use crosswire_transport::{Transport, TransportMessage};

use crate::envelope;
use crate::error::{ClientError, Result};

#[derive(Clone)]
pub struct ClientConfig {
    pub channel_id: String,
    pub password: String,
    pub nickname: String,
    /// Server key from a previous session. When set, a server presenting a
    /// different key is refused.
    pub server_public_key: Option<Vec<u8>>,
    /// Refuse unsigned server envelopes.
    pub require_signature: bool,
    /// How long to wait for the join response.
    pub response_timeout: Duration,
}

impl ClientConfig {
    pub fn new(channel_id: &str, password: &str, nickname: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            password: password.to_string(),
            nickname: nickname.to_string(),
            server_public_key: None,
            require_signature: true,
            response_timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("channel_id", &self.channel_id)
            .field("nickname", &self.nickname)
            .field("pinned", &self.server_public_key.is_some())
            .field("require_signature", &self.require_signature)
            .finish_non_exhaustive()
    }
}

/// Something the server sent us, already verified and decrypted.
#[derive(Debug, Clone)]
pub enum Incoming {
    Message(Message),
    Sync(SyncResponse),
    Join(JoinResponse),
}

#[derive(Debug, Clone)]
struct Joined {
    member_id: String,
    nickname: String,
    server_key: Vec<u8>,
    /// Transport address the join response came from.
    server_addr: String,
    members: Vec<MemberInfo>,
}

/// Newest message seen, as `(seconds, id)`. Sync requests resume after it.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
struct Cursor {
    secs: i64,
    id: String,
}

impl Cursor {
    fn advance(&mut self, msg: &Message) {
        let next = Cursor {
            secs: msg.timestamp.map_or(0, |t| t.timestamp()),
            id: msg.id.clone(),
        };
        if next > *self {
            *self = next;
        }
    }
}

pub struct ChannelClient {
    config: ClientConfig,
    identity: Identity,
    key: SymmetricKey,
    transport: Arc<dyn Transport>,
    inbound: Mutex<mpsc::Receiver<TransportMessage>>,
    joined: RwLock<Option<Joined>>,
    cursor: parking_lot::Mutex<Cursor>,
}

impl ChannelClient {
    /// Derive the channel key and subscribe to the transport. The transport
    /// must already be started.
    pub async fn new(config: ClientConfig, identity: Identity, transport: Arc<dyn Transport>) -> Result<Self> {
        let password = config.password.clone();
        let channel_id = config.channel_id.clone();
        let key = tokio::task::spawn_blocking(move || crypto::channel_key(&password, &channel_id))
            .await
            .map_err(|e| ClientError::Crypto(format!("key derivation task failed: {e}")))??;

        let inbound = transport.subscribe();
        Ok(Self {
            config,
            identity,
            key,
            transport,
            inbound: Mutex::new(inbound),
            joined: RwLock::new(None),
            cursor: parking_lot::Mutex::new(Cursor::default()),
        })
    }

    pub fn member_id(&self) -> Option<String> {
        self.joined.read().as_ref().map(|j| j.member_id.clone())
    }

    pub fn is_joined(&self) -> bool {
        self.joined.read().is_some()
    }

    pub fn server_public_key(&self) -> Option<Vec<u8>> {
        self.joined.read().as_ref().map(|j| j.server_key.clone())
    }

    /// Member list from the join response.
    pub fn members(&self) -> Vec<MemberInfo> {
        self.joined
            .read()
            .as_ref()
            .map(|j| j.members.clone())
            .unwrap_or_default()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    fn session(&self) -> Result<Joined> {
        self.joined.read().clone().ok_or(ClientError::NotJoined)
    }

    /// Broadcast a signed join request and wait for the server's answer.
    pub async fn join(&self) -> Result<JoinResponse> {
        let request = JoinRequest::new(&self.identity, &self.config.nickname);
        let payload = envelope::seal_json(&self.key, &request)?;
        self.transport
            .send_message(TransportMessage::new(FrameType::Auth, "", payload))
            .await?;
        debug!(nickname = %self.config.nickname, "join request sent");

        let deadline = Instant::now() + self.config.response_timeout;
        let mut inbound = self.inbound.lock().await;
        loop {
            let frame = match tokio::time::timeout_at(deadline, inbound.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(ClientError::Transport(crosswire_transport::TransportError::Closed)),
                Err(_) => return Err(ClientError::Timeout("join response")),
            };
            if frame.kind != FrameType::Auth || frame.sender_id != SERVER_ID {
                continue;
            }

            let response = envelope::open_join_response(
                &self.key,
                self.config.server_public_key.as_deref(),
                self.config.require_signature,
                &frame.payload,
            )?;
            if !response.success {
                let reason = response.error.unwrap_or_else(|| "no reason given".into());
                warn!(reason = %reason, "join rejected");
                return Err(ClientError::Rejected(reason));
            }

            let member = response
                .member
                .clone()
                .ok_or_else(|| ClientError::Protocol("join response without member".into()))?;
            let server_key = self
                .config
                .server_public_key
                .clone()
                .or_else(|| response.server_public_key.clone())
                .ok_or_else(|| ClientError::Protocol("join response without server key".into()))?;

            info!(member = %member.id, server = %frame.sender_addr, "joined channel");
            *self.joined.write() = Some(Joined {
                member_id: member.id,
                nickname: member.nickname,
                server_key,
                server_addr: frame.sender_addr.clone(),
                members: response.member_list.clone().unwrap_or_default(),
            });
            return Ok(response);
        }
    }

    /// Sign, encrypt and send a text message. Returns the message as sent.
    pub async fn send_text(&self, text: &str) -> Result<Message> {
        let session = self.session()?;
        let msg = Message::text(&session.member_id, &session.nickname, text);
        self.send_message(msg).await
    }

    pub async fn send_reaction(&self, target_message_id: &str, emoji: &str, add: bool) -> Result<Message> {
        let session = self.session()?;
        let msg = Message::reaction(&session.member_id, target_message_id, emoji, add);
        self.send_message(msg).await
    }

    /// Send any message authored by us. Sender fields are overwritten with
    /// our own.
    pub async fn send_message(&self, mut msg: Message) -> Result<Message> {
        let session = self.session()?;
        msg.sender_id = session.member_id.clone();
        if msg.sender_nickname.is_empty() {
            msg.sender_nickname = session.nickname.clone();
        }
        msg.channel_id = self.config.channel_id.clone();

        let payload = envelope::seal_message(&self.key, &self.identity, &session.member_id, &msg)?;
        self.deliver(&session, FrameType::Data, payload).await?;
        Ok(msg)
    }

    /// Ask for everything after the newest message we have seen. Returns
    /// the request id echoed in the response.
    pub async fn request_sync(&self, limit: Option<usize>) -> Result<String> {
        let session = self.session()?;
        let cursor = self.cursor.lock().clone();
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = SyncRequest {
            kind: SYNC_REQUEST_TYPE.to_string(),
            member_id: session.member_id.clone(),
            last_message_id: cursor.id,
            last_timestamp: cursor.secs,
            last_member_timestamp: 0,
            limit,
            request_id: Some(request_id.clone()),
        };
        self.send_control(&session, &request).await?;
        Ok(request_id)
    }

    pub async fn ack(&self, message_id: &str) -> Result<()> {
        let session = self.session()?;
        let ack = AckMessage::new(message_id, &session.member_id);
        self.send_control(&session, &ack).await
    }

    pub async fn set_status(&self, status: UserStatus) -> Result<()> {
        let session = self.session()?;
        let update = StatusUpdate {
            kind: STATUS_UPDATE_TYPE.to_string(),
            member_id: session.member_id.clone(),
            status,
        };
        self.send_control(&session, &update).await
    }

    /// Tell the server we are leaving and forget the session.
    pub async fn leave(&self) -> Result<()> {
        let session = self.session()?;
        let leave = LeaveRequest {
            kind: LEAVE_TYPE.to_string(),
            member_id: session.member_id.clone(),
        };
        self.send_control(&session, &leave).await?;
        *self.joined.write() = None;
        info!(member = %session.member_id, "left channel");
        Ok(())
    }

    async fn send_control<T: Serialize>(&self, session: &Joined, value: &T) -> Result<()> {
        let payload = envelope::seal_message(&self.key, &self.identity, &session.member_id, value)?;
        self.deliver(session, FrameType::Control, payload).await
    }

    async fn deliver(&self, session: &Joined, kind: FrameType, payload: Vec<u8>) -> Result<()> {
        let frame = TransportMessage::new(kind, &session.member_id, payload);
        if session.server_addr.is_empty() {
            self.transport.send_message(frame).await?;
        } else {
            self.transport.send_to(&session.server_addr, frame).await?;
        }
        Ok(())
    }

    /// Next verified frame from the server. Frames from anyone else and
    /// frames that fail verification are skipped.
    pub async fn recv(&self, timeout: Duration) -> Result<Incoming> {
        let deadline = Instant::now() + timeout;
        let mut inbound = self.inbound.lock().await;
        loop {
            let frame = match tokio::time::timeout_at(deadline, inbound.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(ClientError::Transport(crosswire_transport::TransportError::Closed)),
                Err(_) => return Err(ClientError::Timeout("server frame")),
            };
            if frame.sender_id != SERVER_ID {
                continue;
            }
            match self.open_frame(&frame) {
                Ok(incoming) => return Ok(incoming),
                Err(e) => warn!(id = %frame.id, kind = ?frame.kind, error = %e, "dropping server frame"),
            }
        }
    }

    /// Wait for the next broadcast message, skipping sync and join frames.
    pub async fn recv_message(&self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Incoming::Message(msg) = self.recv(remaining).await? {
                return Ok(msg);
            }
        }
    }

    /// Verify and decode one server frame.
    pub fn open_frame(&self, frame: &TransportMessage) -> Result<Incoming> {
        let session = self.session()?;
        let plain = envelope::open_from_server(
            &self.key,
            &session.server_key,
            self.config.require_signature,
            &frame.payload,
        )?;

        match frame.kind {
            FrameType::Data => {
                let msg: Message = serde_json::from_slice(&plain)?;
                self.cursor.lock().advance(&msg);
                Ok(Incoming::Message(msg))
            }
            FrameType::Control => {
                let header: ControlHeader = serde_json::from_slice(&plain)?;
                if header.kind != SYNC_RESPONSE_TYPE {
                    return Err(ClientError::Protocol(format!("unexpected control type {:?}", header.kind)));
                }
                let sync: SyncResponse = serde_json::from_slice(&plain)?;
                let mut cursor = self.cursor.lock();
                for msg in sync.messages.iter().chain(&sync.offline_messages) {
                    cursor.advance(msg);
                }
                drop(cursor);
                Ok(Incoming::Sync(sync))
            }
            FrameType::Auth => Ok(Incoming::Join(serde_json::from_slice(&plain)?)),
            other => Err(ClientError::Protocol(format!("unexpected frame type {other:?}"))),
        }
    }

    /// Timestamp and id of the newest message seen.
    pub fn last_seen(&self) -> Option<(DateTime<Utc>, String)> {
        let cursor = self.cursor.lock();
        if cursor.id.is_empty() {
            return None;
        }
        Utc.timestamp_opt(cursor.secs, 0)
            .single()
            .map(|t| (t, cursor.id.clone()))
    }
}
