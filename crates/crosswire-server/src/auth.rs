//! Join/leave handshake and the session table.
//!
//! A join request arrives as an Auth frame whose payload is a
//! [`JoinRequest`] encrypted under the channel key. Validation runs in a
//! fixed order and stops at the first failure; the joiner is told why with
//! a sealed `success = false` [`JoinResponse`] sent to its transport
//! address.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crosswire_shared::constants::{JOIN_MAX_AGE_SECS, JOIN_MAX_SKEW_SECS, MAX_NICKNAME_LEN, PUBKEY_SIZE};
use crosswire_shared::identity::verify_signature;
use crosswire_shared::protocol::{JoinRequest, JoinResponse, MemberRef, Message, JOIN_RESPONSE_TYPE};
use crosswire_shared::types::{FrameType, Role, UserStatus};
use crosswire_store::Member;
use crosswire_transport::TransportMessage;

use crate::broadcast::BroadcastManager;
use crate::channel::ChannelManager;
use crate::error::{Result, ServerError};
use crate::events::{EventBus, EventType};
use crate::keyring::Keyring;
use crate::offline::OfflineManager;

pub const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub member_id: String,
    #[serde(with = "crosswire_shared::protocol::b64")]
    pub public_key: Vec<u8>,
    /// Transport address the join arrived from.
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_verified: bool,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

pub struct AuthManager {
    channel: Arc<ChannelManager>,
    broadcast: Arc<BroadcastManager>,
    keyring: Arc<Keyring>,
    offline: Arc<OfflineManager>,
    events: EventBus,
    sessions: RwLock<HashMap<String, Session>>,
    session_timeout: chrono::Duration,
    seq: AtomicU64,
}

/// Reason string sent back to a rejected joiner.
fn rejection_reason(err: &ServerError) -> &str {
    match err {
        ServerError::Crypto(reason)
        | ServerError::Protocol(reason)
        | ServerError::Policy(reason)
        | ServerError::Capacity(reason)
        | ServerError::BadRequest(reason) => reason,
        _ => "internal error",
    }
}

/// Replay window: at most five minutes old, at most one minute ahead.
pub fn timestamp_is_fresh(ts: i64, now: i64) -> bool {
    now.checked_sub(ts).is_some_and(|age| age <= JOIN_MAX_AGE_SECS)
        && ts <= now.saturating_add(JOIN_MAX_SKEW_SECS)
}

impl AuthManager {
    pub fn new(
        channel: Arc<ChannelManager>,
        broadcast: Arc<BroadcastManager>,
        keyring: Arc<Keyring>,
        offline: Arc<OfflineManager>,
        events: EventBus,
        session_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            broadcast,
            keyring,
            offline,
            events,
            sessions: RwLock::new(HashMap::new()),
            session_timeout: chrono::Duration::from_std(session_timeout)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            seq: AtomicU64::new(0),
        }
    }

    /// Validate a join request, admit the member and answer the joiner.
    ///
    /// A public key that already belongs to a member re-admits that member
    /// (its session is replaced and the capacity check is skipped). A member
    /// coming back from offline gets its queued messages afterwards.
    pub async fn handle_join(&self, frame: &TransportMessage) -> Result<Member> {
        let channel_id = self.channel.channel_id().await;
        let (member, request, previous) = match self.admit(frame).await {
            Ok(admitted) => admitted,
            Err(e) => {
                let reason = rejection_reason(&e);
                warn!(addr = %frame.sender_addr, reason, "join rejected");
                let response = JoinResponse::rejected(&channel_id, reason);
                if let Err(send_err) = self.reply(&frame.sender_addr, &response).await {
                    warn!(addr = %frame.sender_addr, error = %send_err, "failed to send join rejection");
                }
                return Err(e);
            }
        };

        let now = Utc::now();
        let session = Session {
            member_id: member.id.clone(),
            public_key: request.public_key.clone(),
            address: frame.sender_addr.clone(),
            created_at: now,
            last_seen: now,
            expires_at: now + self.session_timeout,
            is_verified: true,
        };
        self.sessions.write().await.insert(member.id.clone(), session);

        let member_list = self.channel.members().await.iter().map(Member::info).collect();
        let response = JoinResponse {
            kind: JOIN_RESPONSE_TYPE.to_string(),
            success: true,
            channel_id: channel_id.clone(),
            timestamp: now.timestamp(),
            error: None,
            member: Some(MemberRef {
                id: member.id.clone(),
                nickname: member.nickname.clone(),
            }),
            server_public_key: Some(self.keyring.public_key().to_vec()),
            member_list: Some(member_list),
            channel_key: Some(self.keyring.channel_key().to_vec()),
        };
        if let Err(e) = self.reply(&frame.sender_addr, &response).await {
            warn!(member = %member.id, error = %e, "failed to send join response");
        }

        let notice = Message::system(
            &channel_id,
            "member_joined",
            &member.id,
            json!({ "nickname": member.nickname, "joined_at": member.joined_at }),
        );
        if let Err(e) = self.broadcast.broadcast(notice) {
            warn!(member = %member.id, error = %e, "failed to announce join");
        }

        if previous == Some(UserStatus::Offline) && self.offline.is_enabled() {
            let offline = Arc::clone(&self.offline);
            let broadcast = Arc::clone(&self.broadcast);
            let member_id = member.id.clone();
            tokio::spawn(async move {
                offline.deliver(&member_id, &broadcast).await;
            });
        }

        info!(member = %member.id, nickname = %member.nickname, addr = %frame.sender_addr, "member joined");
        Ok(member)
    }

    /// The admitted member, the request, and the member's status before the
    /// join (`None` for a new member).
    async fn admit(&self, frame: &TransportMessage) -> Result<(Member, JoinRequest, Option<UserStatus>)> {
        let plaintext = self.keyring.decrypt(&frame.payload).map_err(|e| {
            warn!(
                addr = %frame.sender_addr,
                key = %self.keyring.fingerprint(),
                error = %e,
                "cannot decrypt join request"
            );
            ServerError::Crypto("invalid password or encryption".into())
        })?;

        let request: JoinRequest = serde_json::from_slice(&plaintext)
            .map_err(|_| ServerError::Protocol("invalid request format".into()))?;

        if !timestamp_is_fresh(request.timestamp, Utc::now().timestamp()) {
            return Err(ServerError::Policy("invalid timestamp".into()));
        }

        let nickname = request.nickname.trim();
        if nickname.is_empty() || nickname.chars().count() > MAX_NICKNAME_LEN {
            return Err(ServerError::Policy("invalid nickname".into()));
        }

        if request.public_key.len() != PUBKEY_SIZE {
            return Err(ServerError::Protocol("invalid public key".into()));
        }
        if let Some(signature) = &request.signature {
            verify_signature(&request.public_key, &request.signing_bytes(), signature)
                .map_err(|_| ServerError::Policy("invalid signature".into()))?;
        }

        if let Some(existing) = self.channel.member_by_public_key(&request.public_key).await {
            // Taking over an existing member needs proof of its key.
            if request.signature.is_none() {
                return Err(ServerError::Policy("signature required".into()));
            }
            if self.channel.is_banned(&existing.id).await {
                return Err(ServerError::Policy("banned".into()));
            }
            let previous = self.channel.touch_heartbeat(&existing.id).await?;
            debug!(member = %existing.id, previous = previous.as_str(), "known key rejoined");
            let member = self.channel.get_member(&existing.id).await?;
            return Ok((member, request, Some(previous)));
        }

        let (total, max) = (self.channel.total_count().await, self.channel.channel().await.max_members);
        if total >= max {
            return Err(ServerError::Capacity("channel is full".into()));
        }

        let mut member = Member::new(&self.next_member_id(), "", nickname, Role::Member);
        member.public_key = Some(request.public_key.clone());
        self.channel.add_member(member.clone()).await?;
        let member = self.channel.get_member(&member.id).await?;
        Ok((member, request, None))
    }

    /// `member_<unix nanos>_<n>`; the counter keeps ids unique within a
    /// nanosecond.
    fn next_member_id(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("member_{nanos}_{n}")
    }

    async fn reply(&self, addr: &str, response: &JoinResponse) -> Result<()> {
        self.broadcast.send_to(addr, FrameType::Auth, response).await
    }

    /// Client-initiated leave. The member record stays; only the session
    /// goes and the member is marked offline.
    pub async fn handle_leave(&self, member_id: &str) -> Result<()> {
        self.remove_session(member_id).await;
        let member = self.channel.get_member(member_id).await?;
        self.channel
            .update_member_status(member_id, UserStatus::Offline)
            .await?;

        let notice = Message::system(
            &member.channel_id,
            "member_left",
            member_id,
            json!({ "nickname": member.nickname }),
        );
        if let Err(e) = self.broadcast.broadcast(notice) {
            warn!(member = member_id, error = %e, "failed to announce leave");
        }
        self.events.publish(
            EventType::MemberLeft,
            json!({ "member": member.info(), "reason": "leave" }),
        );
        info!(member = member_id, nickname = %member.nickname, "member left");
        Ok(())
    }

    /// True for a live session; refreshes `last_seen`. An expired session is
    /// removed.
    pub async fn verify_session(&self, member_id: &str) -> bool {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(member_id) {
            Some(session) if session.is_expired_at(now) => {
                sessions.remove(member_id);
                debug!(member = member_id, "session expired");
                false
            }
            Some(session) => {
                session.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub async fn get_session(&self, member_id: &str) -> Option<Session> {
        self.sessions.read().await.get(member_id).cloned()
    }

    pub async fn remove_session(&self, member_id: &str) -> Option<Session> {
        self.sessions.write().await.remove(member_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn cleanup_expired_sessions(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, remaining = sessions.len(), "expired sessions removed");
        }
        removed
    }

    /// Owners and admins pass everything; others need `role >= required`.
    pub async fn check_permission(&self, member_id: &str, required: Role) -> bool {
        match self.channel.get_member(member_id).await {
            Ok(member) => member.role.is_admin() || member.role >= required,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crosswire_shared::protocol::SignedPayload;
    use crosswire_shared::Identity;

    use super::*;
    use crate::testing::{wait_until, Harness};

    const ADDR: &str = "02:00:00:00:00:0a";

    fn auth(h: &Harness, timeout: Duration) -> AuthManager {
        let offline = Arc::new(OfflineManager::new(h.db.clone(), h.events.clone(), true));
        auth_with(h, timeout, offline)
    }

    fn auth_with(h: &Harness, timeout: Duration, offline: Arc<OfflineManager>) -> AuthManager {
        AuthManager::new(
            Arc::clone(&h.channel),
            Arc::clone(&h.broadcast),
            Arc::clone(&h.keyring),
            offline,
            h.events.clone(),
            timeout,
        )
    }

    fn join_frame(h: &Harness, request: &JoinRequest) -> TransportMessage {
        let plain = serde_json::to_vec(request).unwrap();
        h.client_frame(FrameType::Auth, "", ADDR, &plain)
    }

    fn responses(h: &Harness) -> Vec<JoinResponse> {
        h.transport.opened(&h.keyring, Some(ADDR))
    }

    #[tokio::test]
    async fn test_join_admits_and_answers() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_secs(60));
        let identity = Identity::generate();
        let mut events = h.events.subscribe();

        let member = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&identity, "alice")))
            .await
            .unwrap();
        assert!(member.id.starts_with("member_"));
        assert_eq!(member.role, Role::Member);
        assert!(auth.verify_session(&member.id).await);

        let response = &responses(&h)[0];
        assert!(response.success);
        assert_eq!(response.member.as_ref().unwrap().id, member.id);
        assert_eq!(response.channel_key.as_deref(), Some(&h.keyring.channel_key()[..]));
        assert_eq!(
            response.server_public_key.as_deref(),
            Some(&h.keyring.public_key()[..])
        );
        assert!(response
            .member_list
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.id == member.id));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventType::MemberJoined);

        wait_until(|| !h.transport.opened::<Message>(&h.keyring, None).is_empty()).await;
        let notice = &h.transport.opened::<Message>(&h.keyring, None)[0];
        assert_eq!(notice.content_str("event"), Some("member_joined"));
        assert_eq!(notice.content_str("actor_id"), Some(member.id.as_str()));
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected_with_reason() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_secs(60));
        let request = JoinRequest::new(&Identity::generate(), "mallory");
        let payload = crosswire_shared::crypto::encrypt(&[1u8; 32], &serde_json::to_vec(&request).unwrap()).unwrap();
        let mut frame = TransportMessage::new(FrameType::Auth, "", payload);
        frame.sender_addr = ADDR.into();

        assert!(matches!(auth.handle_join(&frame).await, Err(ServerError::Crypto(_))));
        let response = &responses(&h)[0];
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("invalid password or encryption"));
        assert!(response.channel_key.is_none());
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_secs(60));
        let frame = h.client_frame(FrameType::Auth, "", ADDR, b"{not json");
        assert!(auth.handle_join(&frame).await.is_err());
        assert_eq!(responses(&h)[0].error.as_deref(), Some("invalid request format"));
    }

    #[tokio::test]
    async fn test_replay_window() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_secs(60));
        let identity = Identity::generate();
        let now = Utc::now().timestamp();

        for ts in [now - JOIN_MAX_AGE_SECS - 5, now + JOIN_MAX_SKEW_SECS + 5] {
            let mut request = JoinRequest::new(&identity, "late");
            request.timestamp = ts;
            request.signature = Some(identity.sign_bytes(&request.signing_bytes()));
            assert!(auth.handle_join(&join_frame(&h, &request)).await.is_err());
        }
        for response in responses(&h) {
            assert_eq!(response.error.as_deref(), Some("invalid timestamp"));
        }
        assert_eq!(h.channel.total_count().await, 0);

        assert!(timestamp_is_fresh(now - JOIN_MAX_AGE_SECS, now));
        assert!(timestamp_is_fresh(now + JOIN_MAX_SKEW_SECS, now));
    }

    #[tokio::test]
    async fn test_nickname_rules() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_secs(60));

        let long = "x".repeat(MAX_NICKNAME_LEN + 1);
        for nick in ["", "   ", long.as_str()] {
            let request = JoinRequest::new(&Identity::generate(), nick);
            assert!(auth.handle_join(&join_frame(&h, &request)).await.is_err());
        }
        let exact = "é".repeat(MAX_NICKNAME_LEN);
        let request = JoinRequest::new(&Identity::generate(), &exact);
        assert!(auth.handle_join(&join_frame(&h, &request)).await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_signature() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_secs(60));
        let mut request = JoinRequest::new(&Identity::generate(), "alice");
        request.nickname = "mallory".into();

        assert!(auth.handle_join(&join_frame(&h, &request)).await.is_err());
        assert_eq!(responses(&h)[0].error.as_deref(), Some("invalid signature"));
    }

    #[tokio::test]
    async fn test_capacity_and_rejoin() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_secs(60));
        let first = Identity::generate();

        let alice = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&first, "alice")))
            .await
            .unwrap();
        for nick in ["bob", "carol"] {
            auth.handle_join(&join_frame(&h, &JoinRequest::new(&Identity::generate(), nick)))
                .await
                .unwrap();
        }

        let err = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&Identity::generate(), "dave")))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Capacity(_)));

        // Same key comes back while the channel is full.
        let again = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&first, "alice")))
            .await
            .unwrap();
        assert_eq!(again.id, alice.id);
        assert_eq!(h.channel.total_count().await, 3);
    }

    #[tokio::test]
    async fn test_banned_key_cannot_rejoin() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_secs(60));
        let identity = Identity::generate();
        let member = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&identity, "troll")))
            .await
            .unwrap();
        h.channel
            .ban_member(&member.id, "spam", "server", None)
            .await
            .unwrap();

        let err = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&identity, "troll")))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Policy(ref r) if r == "banned"));
    }

    #[tokio::test]
    async fn test_known_key_needs_signature() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_secs(60));
        let identity = Identity::generate();
        let mut unsigned = JoinRequest::new(&identity, "alice");
        unsigned.signature = None;

        let member = auth.handle_join(&join_frame(&h, &unsigned)).await.unwrap();
        let err = auth.handle_join(&join_frame(&h, &unsigned)).await.unwrap_err();
        assert!(matches!(err, ServerError::Policy(ref r) if r == "signature required"));
        assert_eq!(
            responses(&h).last().unwrap().error.as_deref(),
            Some("signature required")
        );

        let again = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&identity, "alice")))
            .await
            .unwrap();
        assert_eq!(again.id, member.id);
    }

    #[tokio::test]
    async fn test_rejoin_delivers_offline_queue() {
        let h = Harness::new().await;
        let offline = Arc::new(OfflineManager::new(h.db.clone(), h.events.clone(), true));
        let auth = auth_with(&h, Duration::from_secs(60), Arc::clone(&offline));
        let identity = Identity::generate();

        let member = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&identity, "alice")))
            .await
            .unwrap();
        auth.handle_leave(&member.id).await.unwrap();
        let mut missed = Message::text("bob", "bob", "while you were away");
        missed.channel_id = "test-channel".into();
        offline.store(&member.id, missed).await.unwrap();

        auth.handle_join(&join_frame(&h, &JoinRequest::new(&identity, "alice")))
            .await
            .unwrap();
        wait_until(|| {
            h.transport
                .opened::<Message>(&h.keyring, None)
                .iter()
                .any(|m| m.text_body() == Some("while you were away"))
        })
        .await;
        assert_eq!(offline.offline_message_count(&member.id).await, 0);
        assert_eq!(
            h.channel.get_member(&member.id).await.unwrap().status,
            UserStatus::Online
        );
    }

    #[tokio::test]
    async fn test_leave_marks_offline() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_secs(60));
        let member = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&Identity::generate(), "alice")))
            .await
            .unwrap();

        auth.handle_leave(&member.id).await.unwrap();
        assert!(auth.get_session(&member.id).await.is_none());
        assert_eq!(
            h.channel.get_member(&member.id).await.unwrap().status,
            UserStatus::Offline
        );
        assert!(auth.handle_leave("nobody").await.is_err());
    }

    #[tokio::test]
    async fn test_session_expiry() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_millis(1));
        let a = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&Identity::generate(), "a")))
            .await
            .unwrap();
        let b = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&Identity::generate(), "b")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!auth.verify_session(&a.id).await);
        assert!(auth.get_session(&a.id).await.is_none());
        assert_eq!(auth.cleanup_expired_sessions().await, 1);
        assert!(auth.get_session(&b.id).await.is_none());
    }

    #[tokio::test]
    async fn test_permission_ordering() {
        let h = Harness::new().await;
        let auth = auth(&h, Duration::from_secs(60));
        let member = auth
            .handle_join(&join_frame(&h, &JoinRequest::new(&Identity::generate(), "mod")))
            .await
            .unwrap();

        assert!(auth.check_permission(&member.id, Role::Member).await);
        assert!(!auth.check_permission(&member.id, Role::Moderator).await);
        h.channel
            .update_member_role(&member.id, Role::Moderator)
            .await
            .unwrap();
        assert!(auth.check_permission(&member.id, Role::Moderator).await);
        assert!(!auth.check_permission(&member.id, Role::Owner).await);
        assert!(auth.check_permission("server", Role::Owner).await);
        assert!(!auth.check_permission("ghost", Role::ReadOnly).await);
    }

    #[test]
    fn test_rejection_payload_is_verifiable() {
        let keyring = Keyring::new([5u8; 32], Identity::generate(), true);
        let sealed = keyring.seal_json(&JoinResponse::rejected("c", "banned")).unwrap();
        let payload = SignedPayload::from_json(&sealed).unwrap();
        let plain = payload.open(keyring.channel_key(), &keyring.public_key()).unwrap();
        let response: JoinResponse = serde_json::from_slice(&plain).unwrap();
        assert_eq!(response.error.as_deref(), Some("banned"));
    }

    #[test]
    fn test_extreme_timestamps_are_stale() {
        let now = Utc::now().timestamp();
        assert!(!timestamp_is_fresh(i64::MIN, now));
        assert!(!timestamp_is_fresh(i64::MAX, now));
        assert!(!timestamp_is_fresh(i64::MIN, i64::MAX));
        assert!(timestamp_is_fresh(i64::MAX, i64::MAX));
    }

    proptest::proptest! {
        #[test]
        fn test_freshness_window(now in 1_000_000i64..2_000_000_000, delta in -1_000i64..1_000) {
            let fresh = timestamp_is_fresh(now + delta, now);
            proptest::prop_assert_eq!(fresh, (-JOIN_MAX_AGE_SECS..=JOIN_MAX_SKEW_SECS).contains(&delta));
        }

        #[test]
        fn test_freshness_never_panics(ts in proptest::num::i64::ANY, now in proptest::num::i64::ANY) {
            let fresh = timestamp_is_fresh(ts, now);
            let age = i128::from(now) - i128::from(ts);
            proptest::prop_assert_eq!(
                fresh,
                age <= i128::from(JOIN_MAX_AGE_SECS) && age >= -i128::from(JOIN_MAX_SKEW_SECS)
            );
        }
    }
}
