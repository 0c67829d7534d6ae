use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::constants::{PUBKEY_SIZE, SIGNATURE_SIZE};
use crate::error::IdentityError;

/// An Ed25519 signing identity. The server holds one to sign every
/// broadcast; each member holds one to sign what it sends to the server.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    /// Restore identity from a hex-encoded 32-byte secret
    pub fn from_secret_hex(hex_secret: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(hex_secret.trim()).map_err(|_| IdentityError::InvalidKeyBytes)?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self::from_secret_bytes(&secret))
    }

    /// Get the raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; PUBKEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Sign a message and return the 64 signature bytes
    pub fn sign_bytes(&self, message: &[u8]) -> Vec<u8> {
        self.sign(message).to_bytes().to_vec()
    }

    /// Get the verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}

/// Verify a signature against a public key.
///
/// Accepts raw slices because keys and signatures arrive inside JSON
/// envelopes; wrong lengths are reported as errors rather than panics.
pub fn verify_signature(
    pubkey_bytes: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let pubkey: &[u8; PUBKEY_SIZE] = pubkey_bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyBytes)?;
    let sig_bytes: &[u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| IdentityError::InvalidSignature)?;

    let verifying_key =
        VerifyingKey::from_bytes(pubkey).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature = Signature::from_bytes(sig_bytes);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"Hello, crosswire!";
        let signature = id.sign_bytes(message);

        assert_eq!(signature.len(), SIGNATURE_SIZE);
        assert!(verify_signature(&id.public_key_bytes(), message, &signature).is_ok());
        assert!(verify_signature(&id.public_key_bytes(), b"wrong", &signature).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = Identity::generate();
        let other = Identity::generate();
        let signature = signer.sign_bytes(b"payload");

        assert!(matches!(
            verify_signature(&other.public_key_bytes(), b"payload", &signature),
            Err(IdentityError::VerificationFailed)
        ));
    }

    #[test]
    fn test_malformed_inputs() {
        let id = Identity::generate();
        let signature = id.sign_bytes(b"x");

        assert!(matches!(
            verify_signature(&[0u8; 5], b"x", &signature),
            Err(IdentityError::InvalidKeyBytes)
        ));
        assert!(matches!(
            verify_signature(&id.public_key_bytes(), b"x", &signature[..10]),
            Err(IdentityError::InvalidSignature)
        ));
    }

    #[test]
    fn test_secret_hex_roundtrip() {
        let id = Identity::generate();
        let restored = Identity::from_secret_hex(&hex::encode(id.secret_bytes())).unwrap();
        assert_eq!(id.public_key_bytes(), restored.public_key_bytes());
        assert!(Identity::from_secret_hex("abcd").is_err());
    }

    proptest! {
        #[test]
        fn prop_bit_flip_breaks_signature(
            payload in proptest::collection::vec(any::<u8>(), 1..512),
            bit in any::<usize>(),
        ) {
            let id = Identity::generate();
            let signature = id.sign_bytes(&payload);

            let mut tampered = payload.clone();
            let bit = bit % (tampered.len() * 8);
            tampered[bit / 8] ^= 1 << (bit % 8);

            prop_assert!(verify_signature(&id.public_key_bytes(), &tampered, &signature).is_err());
        }
    }
}
