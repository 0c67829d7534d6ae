//! Server configuration loaded from environment variables.
//!
//! Everything except the channel password has a default, so a local
//! server starts with just `CROSSWIRE_PASSWORD` set.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crosswire_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_MAX_MEMBERS, DEFAULT_WS_PORT};
use crosswire_shared::types::TransportMode;
use crosswire_shared::Identity;
use crosswire_transport::TransportConfig;

use crate::error::{Result, ServerError};

#[derive(Clone)]
pub struct ServerConfig {
    /// Env: `CROSSWIRE_CHANNEL_ID`
    /// Default: a random UUID (a fresh channel on every start).
    pub channel_id: String,

    /// Env: `CROSSWIRE_CHANNEL_NAME`
    /// Default: `"crosswire"`
    pub channel_name: String,

    /// Every member derives the channel key from this.
    /// Env: `CROSSWIRE_PASSWORD`
    /// Default: empty, which [`ServerConfig::validate`] refuses.
    pub channel_password: String,

    /// Env: `CROSSWIRE_MAX_MEMBERS`
    /// Default: `100`
    pub max_members: usize,

    /// Env: `CROSSWIRE_TRANSPORT` (`arp`, `mdns`, `https`)
    /// Default: `https`
    pub transport_mode: TransportMode,

    /// Interface for the raw Ethernet backend.
    /// Env: `CROSSWIRE_INTERFACE`
    /// Default: `eth0`
    pub interface: String,

    /// WebSocket listen address.
    /// Env: `CROSSWIRE_LISTEN_ADDR`
    /// Default: `0.0.0.0:8443`
    pub listen_addr: SocketAddr,

    /// Admin HTTP API address.
    /// Env: `CROSSWIRE_ADMIN_ADDR`
    /// Default: `127.0.0.1:8080`
    pub admin_addr: SocketAddr,

    /// Bearer token for admin mutations.
    /// Env: `CROSSWIRE_ADMIN_TOKEN`
    /// Default: none (mutating endpoints refuse every request).
    pub admin_token: Option<String>,

    /// Env: `CROSSWIRE_DB_PATH`
    /// Default: the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Env: `CROSSWIRE_SESSION_TIMEOUT_SECS`
    /// Default: `86400`
    pub session_timeout: Duration,

    /// Env: `CROSSWIRE_ENABLE_OFFLINE`
    /// Default: `true`
    pub enable_offline: bool,

    /// Env: `CROSSWIRE_ENABLE_RATE_LIMIT`
    /// Default: `true`
    pub enable_rate_limit: bool,

    /// Messages per member per minute.
    /// Env: `CROSSWIRE_MAX_MESSAGE_RATE`
    /// Default: `60`
    pub max_message_rate: usize,

    /// Sign every broadcast with the server key.
    /// Env: `CROSSWIRE_ENABLE_SIGNATURE`
    /// Default: `true`
    pub enable_signature: bool,

    /// Hex Ed25519 secret for the server identity.
    /// Env: `CROSSWIRE_SERVER_KEY`
    /// Default: none (a new identity per start).
    pub server_key_hex: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            channel_id: uuid::Uuid::new_v4().to_string(),
            channel_name: "crosswire".to_string(),
            channel_password: String::new(),
            max_members: DEFAULT_MAX_MEMBERS,
            transport_mode: TransportMode::Https,
            interface: "eth0".to_string(),
            listen_addr: ([0, 0, 0, 0], DEFAULT_WS_PORT).into(),
            admin_addr: ([127, 0, 0, 1], DEFAULT_HTTP_PORT).into(),
            admin_token: None,
            database_path: None,
            session_timeout: Duration::from_secs(24 * 60 * 60),
            enable_offline: true,
            enable_rate_limit: true,
            max_message_rate: 60,
            enable_signature: true,
            server_key_hex: None,
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("channel_id", &self.channel_id)
            .field("channel_name", &self.channel_name)
            .field("max_members", &self.max_members)
            .field("transport_mode", &self.transport_mode)
            .field("interface", &self.interface)
            .field("listen_addr", &self.listen_addr)
            .field("admin_addr", &self.admin_addr)
            .field("admin_enabled", &self.admin_token.is_some())
            .field("database_path", &self.database_path)
            .field("session_timeout", &self.session_timeout)
            .field("enable_offline", &self.enable_offline)
            .field("enable_rate_limit", &self.enable_rate_limit)
            .field("max_message_rate", &self.max_message_rate)
            .field("enable_signature", &self.enable_signature)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(id) = lookup("CROSSWIRE_CHANNEL_ID").filter(|v| !v.is_empty()) {
            config.channel_id = id;
        }
        if let Some(name) = lookup("CROSSWIRE_CHANNEL_NAME").filter(|v| !v.is_empty()) {
            config.channel_name = name;
        }
        if let Some(password) = lookup("CROSSWIRE_PASSWORD") {
            config.channel_password = password;
        }
        parse_into(&lookup, "CROSSWIRE_MAX_MEMBERS", &mut config.max_members);
        parse_into(&lookup, "CROSSWIRE_TRANSPORT", &mut config.transport_mode);
        if let Some(interface) = lookup("CROSSWIRE_INTERFACE").filter(|v| !v.is_empty()) {
            config.interface = interface;
        }
        parse_into(&lookup, "CROSSWIRE_LISTEN_ADDR", &mut config.listen_addr);
        parse_into(&lookup, "CROSSWIRE_ADMIN_ADDR", &mut config.admin_addr);

        if let Some(token) = lookup("CROSSWIRE_ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }
        if let Some(path) = lookup("CROSSWIRE_DB_PATH").filter(|v| !v.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        let mut timeout_secs = config.session_timeout.as_secs();
        parse_into(&lookup, "CROSSWIRE_SESSION_TIMEOUT_SECS", &mut timeout_secs);
        config.session_timeout = Duration::from_secs(timeout_secs);

        if let Some(val) = lookup("CROSSWIRE_ENABLE_OFFLINE") {
            config.enable_offline = parse_flag(&val);
        }
        if let Some(val) = lookup("CROSSWIRE_ENABLE_RATE_LIMIT") {
            config.enable_rate_limit = parse_flag(&val);
        }
        parse_into(&lookup, "CROSSWIRE_MAX_MESSAGE_RATE", &mut config.max_message_rate);
        if let Some(val) = lookup("CROSSWIRE_ENABLE_SIGNATURE") {
            config.enable_signature = parse_flag(&val);
        }
        if let Some(key) = lookup("CROSSWIRE_SERVER_KEY").filter(|v| !v.is_empty()) {
            config.server_key_hex = Some(key);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// Refuse configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.channel_password.is_empty() {
            return Err(ServerError::BadRequest(
                "CROSSWIRE_PASSWORD must be set".into(),
            ));
        }
        if self.channel_id.is_empty() {
            return Err(ServerError::BadRequest("channel id must not be empty".into()));
        }
        if self.max_members == 0 {
            return Err(ServerError::BadRequest("max members must be positive".into()));
        }
        Ok(())
    }

    /// The configured identity, or a freshly generated one.
    pub fn server_identity(&self) -> Result<Identity> {
        match &self.server_key_hex {
            Some(hex_key) => Ok(Identity::from_secret_hex(hex_key)?),
            None => Ok(Identity::generate()),
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            mode: self.transport_mode,
            interface: self.interface.clone(),
            listen_addr: self.listen_addr,
            ..TransportConfig::default()
        }
    }
}

fn parse_flag(val: &str) -> bool {
    val != "false" && val != "0"
}

fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(e) => tracing::warn!(key, value = %raw, error = %e, "Invalid value, using default"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_members, 100);
        assert_eq!(config.transport_mode, TransportMode::Https);
        assert_eq!(config.listen_addr, ([0, 0, 0, 0], 8443).into());
        assert_eq!(config.admin_addr, ([127, 0, 0, 1], 8080).into());
        assert!(config.enable_signature);
        assert!(config.validate().is_err(), "empty password must be refused");
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("CROSSWIRE_CHANNEL_ID", "ops"),
            ("CROSSWIRE_PASSWORD", "hunter2"),
            ("CROSSWIRE_MAX_MEMBERS", "12"),
            ("CROSSWIRE_TRANSPORT", "mdns"),
            ("CROSSWIRE_ENABLE_RATE_LIMIT", "0"),
            ("CROSSWIRE_SESSION_TIMEOUT_SECS", "90"),
            ("CROSSWIRE_ADMIN_TOKEN", "secret"),
        ]));
        assert_eq!(config.channel_id, "ops");
        assert_eq!(config.max_members, 12);
        assert_eq!(config.transport_mode, TransportMode::Mdns);
        assert!(!config.enable_rate_limit);
        assert_eq!(config.session_timeout, Duration::from_secs(90));
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("CROSSWIRE_MAX_MEMBERS", "lots"),
            ("CROSSWIRE_LISTEN_ADDR", "not-an-addr"),
            ("CROSSWIRE_TRANSPORT", "carrier-pigeon"),
            ("CROSSWIRE_ADMIN_TOKEN", ""),
        ]));
        assert_eq!(config.max_members, 100);
        assert_eq!(config.listen_addr, ([0, 0, 0, 0], 8443).into());
        assert_eq!(config.transport_mode, TransportMode::Https);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_server_identity_from_hex() {
        let id = Identity::generate();
        let config = ServerConfig {
            server_key_hex: Some(hex::encode(id.secret_bytes())),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.server_identity().unwrap().public_key_bytes(),
            id.public_key_bytes()
        );

        let bad = ServerConfig {
            server_key_hex: Some("abcd".into()),
            ..ServerConfig::default()
        };
        assert!(bad.server_identity().is_err());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = ServerConfig {
            channel_password: "hunter2".into(),
            admin_token: Some("tok".into()),
            ..ServerConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("tok\""));
    }
}
