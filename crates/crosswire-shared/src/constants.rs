/// Wire protocol version carried in frame headers and discovery announcements
pub const PROTOCOL_VERSION: u8 = 1;

/// Application name
pub const APP_NAME: &str = "crosswire";

/// Custom EtherType used by the raw-broadcast transport
pub const ETHER_TYPE: u16 = 0x88B5;

/// AES-256-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-256-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Symmetric channel key size in bytes (AES-256)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Salt length generated for new channels
pub const SALT_SIZE: usize = 32;

/// Argon2id parameters: time cost, memory cost (KiB), parallelism
pub const ARGON2_TIME_COST: u32 = 1;
pub const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
pub const ARGON2_PARALLELISM: u32 = 4;

/// Default raw-broadcast chunk size (Ethernet MTU minus framing overhead)
pub const DEFAULT_CHUNK_SIZE: usize = 1470;

/// Identifier the server signs broadcasts with and its synthetic member id
pub const SERVER_ID: &str = "server";

/// Sender id used for server-originated system messages
pub const SYSTEM_SENDER_ID: &str = "system";

/// Maximum nickname length, in characters
pub const MAX_NICKNAME_LEN: usize = 50;

/// Join request freshness window (seconds in the past / in the future)
pub const JOIN_MAX_AGE_SECS: i64 = 300;
pub const JOIN_MAX_SKEW_SECS: i64 = 60;

/// Default channel capacity
pub const DEFAULT_MAX_MEMBERS: usize = 100;

/// Default WebSocket listen port
pub const DEFAULT_WS_PORT: u16 = 8443;

/// Default admin HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// mDNS multicast group, port and service type
pub const MDNS_ADDR: &str = "224.0.0.251";
pub const MDNS_PORT: u16 = 5353;
pub const MDNS_SERVICE: &str = "_crosswire._udp.local.";
