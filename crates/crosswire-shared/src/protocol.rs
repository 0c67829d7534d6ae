//! JSON envelopes exchanged between clients and the server.
//!
//! Every transport carries the same payloads: the outer layer is either a
//! server-signed [`SignedPayload`] (server → clients) or a member-signed
//! [`SignedMessage`] encrypted with the channel key (client → server).
//! Byte fields are base64 strings on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{SERVER_ID, SYSTEM_SENDER_ID};
use crate::crypto::{self, SymmetricKey};
use crate::error::CrosswireError;
use crate::identity::{verify_signature, Identity};
use crate::types::{MessageType, Role, TransportMode, UserStatus};

/// Serde adapter for `Vec<u8>` fields encoded as standard base64.
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }

    /// Same encoding for optional fields.
    pub mod option {
        use base64::{engine::general_purpose::STANDARD, Engine};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let s: Option<String> = Option::deserialize(deserializer)?;
            s.map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

// ---------------------------------------------------------------------------
// Application message
// ---------------------------------------------------------------------------

/// A chat message as authored by a member (or by the server for system
/// notices). This is what gets persisted and rebroadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub channel_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_nickname: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub content: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// The member whose signature the server verified before rebroadcasting.
    /// Set by the server; the rebroadcast copy is signed by the server only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_sender_id: Option<String>,
}

impl Message {
    pub fn new(sender_id: &str, sender_nickname: &str, kind: MessageType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: String::new(),
            sender_id: sender_id.to_string(),
            sender_nickname: sender_nickname.to_string(),
            kind,
            content: Map::new(),
            reply_to_id: None,
            timestamp: Some(Utc::now()),
            original_sender_id: None,
        }
    }

    pub fn text(sender_id: &str, sender_nickname: &str, text: &str) -> Self {
        let mut msg = Self::new(sender_id, sender_nickname, MessageType::Text);
        msg.content.insert("text".into(), Value::String(text.to_string()));
        msg
    }

    /// A server-originated notice such as `member_joined`.
    pub fn system(channel_id: &str, event: &str, actor_id: &str, extra: Value) -> Self {
        let mut msg = Self::new(SYSTEM_SENDER_ID, "System", MessageType::System);
        msg.channel_id = channel_id.to_string();
        msg.content.insert("event".into(), Value::String(event.to_string()));
        msg.content
            .insert("actor_id".into(), Value::String(actor_id.to_string()));
        msg.content.insert("extra".into(), extra);
        msg
    }

    pub fn reaction(sender_id: &str, target_message_id: &str, emoji: &str, add: bool) -> Self {
        let mut msg = Self::new(sender_id, "", MessageType::Reaction);
        msg.content.insert(
            "message_id".into(),
            Value::String(target_message_id.to_string()),
        );
        msg.content.insert("emoji".into(), Value::String(emoji.to_string()));
        msg.content.insert(
            "action".into(),
            Value::String(if add { "add" } else { "remove" }.to_string()),
        );
        msg
    }

    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }

    /// The text body of a text message, if any.
    pub fn text_body(&self) -> Option<&str> {
        match self.kind {
            MessageType::Text => self.content_str("text"),
            _ => None,
        }
    }

    /// Content that spam fingerprinting hashes: text for text messages,
    /// source for code messages, nothing otherwise.
    pub fn fingerprint_content(&self) -> &str {
        match self.kind {
            MessageType::Text => self.content_str("text").unwrap_or(""),
            MessageType::Code => self.content_str("code").unwrap_or(""),
            _ => "",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Server → clients envelope. `message` is AES-GCM ciphertext under the
/// channel key; `signature` is the server's Ed25519 signature over that
/// ciphertext (empty when signing is disabled).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedPayload {
    #[serde(with = "b64")]
    pub message: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    pub timestamp: i64,
    pub server_id: String,
}

impl SignedPayload {
    /// Encrypt `plaintext` and optionally sign the ciphertext.
    pub fn seal(
        key: &SymmetricKey,
        signer: Option<&Identity>,
        plaintext: &[u8],
    ) -> Result<Self, CrosswireError> {
        let message = crypto::encrypt(key, plaintext)?;
        let signature = signer.map(|id| id.sign_bytes(&message)).unwrap_or_default();
        Ok(Self {
            message,
            signature,
            timestamp: Utc::now().timestamp(),
            server_id: SERVER_ID.to_string(),
        })
    }

    /// Verify the server signature over the ciphertext, then decrypt.
    pub fn open(&self, key: &SymmetricKey, server_pubkey: &[u8]) -> Result<Vec<u8>, CrosswireError> {
        verify_signature(server_pubkey, &self.message, &self.signature)?;
        Ok(crypto::decrypt(key, &self.message)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CrosswireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, CrosswireError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Client → server envelope (the plaintext inside the channel-key
/// ciphertext). `message` is the JSON of a [`Message`]; `signature` is the
/// member's Ed25519 signature over exactly those bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedMessage {
    #[serde(with = "b64")]
    pub message: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    pub sender_id: String,
}

impl SignedMessage {
    /// Sign the JSON of `value`. Chat messages and control requests both
    /// travel this way.
    pub fn sign<T: Serialize>(identity: &Identity, sender_id: &str, value: &T) -> Result<Self, CrosswireError> {
        let message = serde_json::to_vec(value)?;
        let signature = identity.sign_bytes(&message);
        Ok(Self {
            message,
            signature,
            sender_id: sender_id.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Join handshake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    pub nickname: String,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default, with = "b64::option", skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
}

impl JoinRequest {
    /// Build a request signed by the joining member's identity.
    pub fn new(identity: &Identity, nickname: &str) -> Self {
        let mut req = Self {
            nickname: nickname.to_string(),
            public_key: identity.public_key_bytes().to_vec(),
            timestamp: Utc::now().timestamp(),
            signature: None,
        };
        req.signature = Some(identity.sign_bytes(&req.signing_bytes()));
        req
    }

    /// `nickname || public_key || timestamp (big-endian i64)`
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.nickname.len() + self.public_key.len() + 8);
        buf.extend_from_slice(self.nickname.as_bytes());
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberRef {
    pub id: String,
    pub nickname: String,
}

/// Public view of a member, as sent in join responses and sync responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberInfo {
    pub id: String,
    pub nickname: String,
    pub role: Role,
    pub status: UserStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    pub channel_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<MemberRef>,
    #[serde(default, with = "b64::option", skip_serializing_if = "Option::is_none")]
    pub server_public_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_list: Option<Vec<MemberInfo>>,
    #[serde(default, with = "b64::option", skip_serializing_if = "Option::is_none")]
    pub channel_key: Option<Vec<u8>>,
}

pub const JOIN_RESPONSE_TYPE: &str = "auth.join_response";

impl JoinResponse {
    pub fn rejected(channel_id: &str, reason: &str) -> Self {
        Self {
            kind: JOIN_RESPONSE_TYPE.to_string(),
            success: false,
            channel_id: channel_id.to_string(),
            timestamp: Utc::now().timestamp(),
            error: Some(reason.to_string()),
            member: None,
            server_public_key: None,
            member_list: None,
            channel_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

/// Only the discriminator of a control message, for routing.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlHeader {
    #[serde(rename = "type")]
    pub kind: String,
}

pub const SYNC_REQUEST_TYPE: &str = "sync.request";
pub const SYNC_RESPONSE_TYPE: &str = "sync.response";
pub const STATUS_UPDATE_TYPE: &str = "status.update";
pub const ACK_TYPE: &str = "ack";
pub const LEAVE_TYPE: &str = "auth.leave";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub member_id: String,
    #[serde(default)]
    pub last_message_id: String,
    /// Unix seconds.
    #[serde(default)]
    pub last_timestamp: i64,
    #[serde(default)]
    pub last_member_timestamp: i64,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub max_members: usize,
    pub transport_mode: TransportMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub channel_id: String,
    pub timestamp: i64,
    pub messages: Vec<Message>,
    pub members: Vec<MemberInfo>,
    pub channel: ChannelInfo,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offline_messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub message_id: String,
    pub member_id: String,
    pub timestamp: i64,
}

impl AckMessage {
    pub fn new(message_id: &str, member_id: &str) -> Self {
        Self {
            kind: ACK_TYPE.to_string(),
            message_id: message_id.to_string(),
            member_id: member_id.to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    pub member_id: String,
    pub status: UserStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaveRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub member_id: String,
}
