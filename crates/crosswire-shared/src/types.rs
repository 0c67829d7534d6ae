use serde::{Deserialize, Serialize};

/// Member role, ordered by privilege (`ReadOnly` lowest, `Owner` highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(rename = "readonly")]
    ReadOnly,
    Member,
    Moderator,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ReadOnly => "readonly",
            Role::Member => "member",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }

    /// Owners and admins pass every permission check.
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::Owner)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readonly" => Ok(Role::ReadOnly),
            "member" => Ok(Role::Member),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Busy,
    Away,
    Offline,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Busy => "busy",
            UserStatus::Away => "away",
            UserStatus::Offline => "offline",
        }
    }

    /// Online and busy members count as reachable.
    pub fn is_present(&self) -> bool {
        matches!(self, UserStatus::Online | UserStatus::Busy)
    }
}

impl std::str::FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(UserStatus::Online),
            "busy" => Ok(UserStatus::Busy),
            "away" => Ok(UserStatus::Away),
            "offline" => Ok(UserStatus::Offline),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Application-level message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Code,
    File,
    System,
    Control,
    Reaction,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Code => "code",
            MessageType::File => "file",
            MessageType::System => "system",
            MessageType::Control => "control",
            MessageType::Reaction => "reaction",
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "code" => Ok(MessageType::Code),
            "file" => Ok(MessageType::File),
            "system" => Ok(MessageType::System),
            "control" => Ok(MessageType::Control),
            "reaction" => Ok(MessageType::Reaction),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Which medium carries channel traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Raw Ethernet broadcast frames
    Arp,
    /// Payload smuggled through mDNS service records
    Mdns,
    /// WebSocket over HTTP(S)
    Https,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Arp => "arp",
            TransportMode::Mdns => "mdns",
            TransportMode::Https => "https",
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "arp" | "raw" => Ok(TransportMode::Arp),
            "mdns" => Ok(TransportMode::Mdns),
            "https" | "ws" | "websocket" => Ok(TransportMode::Https),
            other => Err(format!("unknown transport mode: {other}")),
        }
    }
}

/// Transport-level frame kind, shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x01,
    Ack = 0x02,
    Nack = 0x03,
    Control = 0x04,
    Discover = 0x05,
    Auth = 0x06,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Ack),
            0x03 => Some(Self::Nack),
            0x04 => Some(Self::Control),
            0x05 => Some(Self::Discover),
            0x06 => Some(Self::Auth),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}
