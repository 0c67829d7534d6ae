//! Channel secrets and the server's signing identity.

use serde::Serialize;
use subtle::ConstantTimeEq;

use crosswire_shared::crypto::{self, SymmetricKey};
use crosswire_shared::protocol::SignedPayload;
use crosswire_shared::Identity;

use crate::error::{Result, ServerError};

/// Everything derived from the channel password when a channel is created.
#[derive(Clone)]
pub struct ChannelSecrets {
    pub key: SymmetricKey,
    pub password_hash: String,
    pub salt: Vec<u8>,
}

impl ChannelSecrets {
    /// Two Argon2id runs: the channel key (salted by channel id, so every
    /// member can derive it) and a separately salted password hash.
    pub fn derive(password: &str, channel_id: &str) -> Result<Self> {
        let key = crypto::channel_key(password, channel_id)?;
        let salt = crypto::generate_salt();
        let password_hash = crypto::hash_password(password, &salt)?;
        Ok(Self {
            key,
            password_hash,
            salt,
        })
    }

    /// Does a stored channel key match the one derived from the configured
    /// password? A mismatch means the password changed since creation.
    pub fn matches_stored(&self, stored: &[u8]) -> bool {
        stored.len() == self.key.len() && bool::from(self.key.ct_eq(stored))
    }
}

/// The channel key plus the server identity. Every outbound envelope is
/// sealed here.
pub struct Keyring {
    channel_key: SymmetricKey,
    identity: Identity,
    sign: bool,
}

impl Keyring {
    pub fn new(channel_key: SymmetricKey, identity: Identity, sign: bool) -> Self {
        Self {
            channel_key,
            identity,
            sign,
        }
    }

    pub fn channel_key(&self) -> &SymmetricKey {
        &self.channel_key
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    pub fn signs(&self) -> bool {
        self.sign
    }

    /// Safe to log.
    pub fn fingerprint(&self) -> String {
        crypto::key_fingerprint(&self.channel_key)
    }

    /// Encrypt, sign (when enabled) and serialize to wire bytes.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let signer = self.sign.then_some(&self.identity);
        let payload = SignedPayload::seal(&self.channel_key, signer, plaintext)?;
        Ok(payload.to_json()?)
    }

    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(value)?;
        self.seal(&plaintext)
    }

    /// Decrypt a client payload. Callers log [`Keyring::fingerprint`] on
    /// failure to diagnose password mismatches.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        crypto::decrypt(&self.channel_key, data).map_err(|e| ServerError::Crypto(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::OnceLock;

    use super::*;

    pub const TEST_PASSWORD: &str = "correct horse";
    pub const TEST_CHANNEL: &str = "test-channel";

    /// Argon2id at 64 MiB is slow; derive once per test binary.
    pub fn test_secrets() -> ChannelSecrets {
        static SECRETS: OnceLock<ChannelSecrets> = OnceLock::new();
        SECRETS
            .get_or_init(|| ChannelSecrets::derive(TEST_PASSWORD, TEST_CHANNEL).unwrap())
            .clone()
    }

    #[test]
    fn test_secrets_match_channel_key() {
        let secrets = test_secrets();
        assert_eq!(
            secrets.key,
            crypto::channel_key(TEST_PASSWORD, TEST_CHANNEL).unwrap()
        );
        assert!(secrets.matches_stored(&secrets.key));
        assert!(!secrets.matches_stored(&[0u8; 32]));
        assert!(!secrets.matches_stored(&[0u8; 4]));
        assert_ne!(secrets.password_hash, hex::encode(secrets.key));
        assert!(crypto::verify_password(TEST_PASSWORD, &secrets.password_hash, &secrets.salt));
    }

    #[test]
    fn test_seal_is_verifiable() {
        let identity = Identity::generate();
        let keyring = Keyring::new([9u8; 32], identity, true);

        let wire = keyring.seal(b"hello").unwrap();
        let payload = SignedPayload::from_json(&wire).unwrap();
        let opened = payload.open(keyring.channel_key(), &keyring.public_key()).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn test_unsigned_seal() {
        let keyring = Keyring::new([9u8; 32], Identity::generate(), false);
        let wire = keyring.seal(b"x").unwrap();
        let payload = SignedPayload::from_json(&wire).unwrap();
        assert!(payload.signature.is_empty());
        assert_eq!(keyring.decrypt(&payload.message).unwrap(), b"x");
    }
}
