//! Domain model structs persisted by the server.
//!
//! Chat messages themselves are [`crosswire_shared::protocol::Message`];
//! everything else the server keeps durable lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crosswire_shared::protocol::{ChannelInfo, MemberInfo};
use crosswire_shared::types::{Role, TransportMode, UserStatus};

/// Reason prefix that marks a restriction as a ban.
pub const BAN_REASON_PREFIX: &str = "BANNED:";

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// The single channel a server instance hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Hex Argon2id hash of the channel password.
    pub password_hash: String,
    pub salt: Vec<u8>,
    /// Argon2id(password, salt); never serialized to clients except in a
    /// successful join response.
    #[serde(skip_serializing)]
    pub encryption_key: Vec<u8>,
    pub key_version: u32,
    pub max_members: usize,
    pub transport_mode: TransportMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            max_members: self.max_members,
            transport_mode: self.transport_mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Member
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub channel_id: String,
    pub nickname: String,
    /// Ed25519 public key; `None` for members that never completed a join.
    pub public_key: Option<Vec<u8>>,
    pub role: Role,
    pub status: UserStatus,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Member {
    pub fn new(id: &str, channel_id: &str, nickname: &str, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            channel_id: channel_id.to_string(),
            nickname: nickname.to_string(),
            public_key: None,
            role,
            status: UserStatus::Online,
            joined_at: now,
            last_seen_at: now,
            last_heartbeat: now,
        }
    }

    /// Most recent of join, last-seen and heartbeat times.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.joined_at.max(self.last_seen_at).max(self.last_heartbeat)
    }

    pub fn info(&self) -> MemberInfo {
        MemberInfo {
            id: self.id.clone(),
            nickname: self.nickname.clone(),
            role: self.role,
            status: self.status,
            joined_at: Some(self.joined_at),
            last_seen_at: Some(self.last_seen_at),
        }
    }
}

// ---------------------------------------------------------------------------
// Restriction (mute / ban)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RestrictionKind {
    Mute,
    Ban,
}

impl RestrictionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestrictionKind::Mute => "mute",
            RestrictionKind::Ban => "ban",
        }
    }
}

impl std::str::FromStr for RestrictionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mute" => Ok(RestrictionKind::Mute),
            "ban" => Ok(RestrictionKind::Ban),
            other => Err(format!("unknown restriction kind: {other}")),
        }
    }
}

/// A mute or ban placed on a member. `expires_at == None` means permanent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Restriction {
    pub channel_id: String,
    pub member_id: String,
    pub kind: RestrictionKind,
    /// Reason without the ban prefix.
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Restriction {
    pub fn mute(
        channel_id: &str,
        member_id: &str,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            member_id: member_id.to_string(),
            kind: RestrictionKind::Mute,
            reason: reason.to_string(),
            created_at: Utc::now(),
            expires_at,
        }
    }

    pub fn ban(
        channel_id: &str,
        member_id: &str,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            kind: RestrictionKind::Ban,
            ..Self::mute(channel_id, member_id, reason, expires_at)
        }
    }

    /// Classify a legacy reason string: anything starting with `BANNED:`
    /// is a ban, everything else is a mute.
    pub fn from_reason(
        channel_id: &str,
        member_id: &str,
        raw_reason: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        match raw_reason.strip_prefix(BAN_REASON_PREFIX) {
            Some(rest) => Self::ban(channel_id, member_id, rest.trim_start(), expires_at),
            None => Self::mute(channel_id, member_id, raw_reason, expires_at),
        }
    }

    /// The reason as displayed to moderators, ban prefix included.
    pub fn display_reason(&self) -> String {
        match self.kind {
            RestrictionKind::Ban => format!("{} {}", BAN_REASON_PREFIX, self.reason),
            RestrictionKind::Mute => self.reason.clone(),
        }
    }

    pub fn is_ban(&self) -> bool {
        self.kind == RestrictionKind::Ban
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now > at).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub message_id: String,
    pub member_id: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}
