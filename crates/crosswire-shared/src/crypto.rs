use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::constants::{
    ARGON2_MEMORY_KIB, ARGON2_PARALLELISM, ARGON2_TIME_COST, NONCE_SIZE, SALT_SIZE,
    SYMMETRIC_KEY_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> Vec<u8> {
    random_bytes(SALT_SIZE)
}

pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Interpret an arbitrary byte slice as a channel key.
pub fn key_from_slice(bytes: &[u8]) -> Result<SymmetricKey, CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: SYMMETRIC_KEY_SIZE,
            actual: bytes.len(),
        })
}

// Returns nonce || ciphertext (12 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

fn argon2id() -> Result<Argon2<'static>, CryptoError> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(SYMMETRIC_KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Derive the 32-byte channel key from the channel password and salt
/// with Argon2id (t=1, m=64 MiB, p=4).
pub fn derive_key(password: &str, salt: &[u8]) -> Result<SymmetricKey, CryptoError> {
    if salt.is_empty() {
        return Err(CryptoError::EmptySalt);
    }
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    argon2id()?
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// The key every member of a channel derives from its password. The salt
/// is a hash of the channel id so clients need nothing else, and short ids
/// still meet Argon2's minimum salt length.
pub fn channel_key(password: &str, channel_id: &str) -> Result<SymmetricKey, CryptoError> {
    if channel_id.is_empty() {
        return Err(CryptoError::EmptySalt);
    }
    derive_key(password, &sha256(channel_id.as_bytes()))
}

/// Hex-encoded Argon2id password hash, same parameters as [`derive_key`].
pub fn hash_password(password: &str, salt: &[u8]) -> Result<String, CryptoError> {
    derive_key(password, salt).map(hex::encode)
}

/// Constant-time comparison of a password against a stored hex hash.
pub fn verify_password(password: &str, hash_hex: &str, salt: &[u8]) -> bool {
    let Ok(expected) = hex::decode(hash_hex) else {
        return false;
    };
    let Ok(actual) = derive_key(password, salt) else {
        return false;
    };
    if expected.len() != actual.len() {
        return false;
    }
    actual.ct_eq(&expected).into()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// First 4 bytes of SHA-256 over the key, hex-encoded. Safe to log.
pub fn key_fingerprint(key: &SymmetricKey) -> String {
    hex::encode(&sha256(key)[..4])
}

/// First 8 hex characters of SHA-256 over the channel id, as advertised
/// in discovery announcements.
pub fn channel_hash8(channel_id: &str) -> String {
    sha256_hex(channel_id.as_bytes())[..8].to_string()
}
