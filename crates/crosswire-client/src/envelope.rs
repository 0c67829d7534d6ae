//! Sealing requests for the server and opening what it sends back.

use serde::Serialize;

use crosswire_shared::crypto::{self, SymmetricKey};
use crosswire_shared::identity::verify_signature;
use crosswire_shared::protocol::{JoinResponse, SignedMessage, SignedPayload};
use crosswire_shared::Identity;

use crate::error::{ClientError, Result};

/// Encrypt the JSON of `value` under the channel key. Join requests travel
/// like this.
pub fn seal_json<T: Serialize>(key: &SymmetricKey, value: &T) -> Result<Vec<u8>> {
    let plain = serde_json::to_vec(value)?;
    Ok(crypto::encrypt(key, &plain)?)
}

/// Sign `value` as `member_id` and encrypt the signed envelope. Chat
/// messages and control requests are both sent this way.
pub fn seal_message<T: Serialize>(
    key: &SymmetricKey,
    identity: &Identity,
    member_id: &str,
    value: &T,
) -> Result<Vec<u8>> {
    let signed = SignedMessage::sign(identity, member_id, value)?;
    seal_json(key, &signed)
}

/// Verify and decrypt a server envelope.
///
/// An empty signature is accepted only when `require_signature` is off.
pub fn open_from_server(
    key: &SymmetricKey,
    server_key: &[u8],
    require_signature: bool,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let envelope = SignedPayload::from_json(payload)?;
    if envelope.signature.is_empty() {
        if require_signature {
            return Err(ClientError::Crypto("unsigned server envelope".into()));
        }
        return Ok(crypto::decrypt(key, &envelope.message)?);
    }
    Ok(envelope.open(key, server_key)?)
}

/// Open a join response.
///
/// The server's key arrives inside the response, so without a pinned key
/// the signature is checked against the key the response itself carries.
/// A pinned key must match. Rejections carry no key and are returned as
/// they are unless a key is pinned.
pub fn open_join_response(
    key: &SymmetricKey,
    pinned: Option<&[u8]>,
    require_signature: bool,
    payload: &[u8],
) -> Result<JoinResponse> {
    let envelope = SignedPayload::from_json(payload)?;
    let plain = crypto::decrypt(key, &envelope.message)
        .map_err(|_| ClientError::Crypto("cannot decrypt join response (wrong password?)".into()))?;
    let response: JoinResponse = serde_json::from_slice(&plain)?;

    if let (Some(pinned), Some(offered)) = (pinned, response.server_public_key.as_deref()) {
        if pinned != offered {
            return Err(ClientError::Crypto("server key does not match the pinned key".into()));
        }
    }

    let verify_with = pinned.or(response.server_public_key.as_deref());
    match verify_with {
        Some(server_key) if !envelope.signature.is_empty() || require_signature => {
            verify_signature(server_key, &envelope.message, &envelope.signature)?;
        }
        Some(_) => {}
        None if response.success => {
            return Err(ClientError::Protocol("join response without server key".into()));
        }
        None => {}
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use crosswire_shared::protocol::{MemberRef, Message};

    use super::*;

    const KEY: SymmetricKey = [7u8; 32];

    fn accepted(server: &Identity) -> JoinResponse {
        let mut response = JoinResponse::rejected("chan", "");
        response.success = true;
        response.error = None;
        response.member = Some(MemberRef {
            id: "member_1".into(),
            nickname: "alice".into(),
        });
        response.server_public_key = Some(server.public_key_bytes().to_vec());
        response
    }

    fn sealed<T: Serialize>(signer: Option<&Identity>, value: &T) -> Vec<u8> {
        let plain = serde_json::to_vec(value).unwrap();
        SignedPayload::seal(&KEY, signer, &plain).unwrap().to_json().unwrap()
    }

    #[test]
    fn test_open_verifies_server_signature() {
        let server = Identity::generate();
        let impostor = Identity::generate();
        let msg = Message::text("server", "Server", "hi");

        let genuine = sealed(Some(&server), &msg);
        let plain = open_from_server(&KEY, &server.public_key_bytes(), true, &genuine).unwrap();
        let opened: Message = serde_json::from_slice(&plain).unwrap();
        assert_eq!(opened.id, msg.id);

        let forged = sealed(Some(&impostor), &msg);
        assert!(matches!(
            open_from_server(&KEY, &server.public_key_bytes(), true, &forged),
            Err(ClientError::Crypto(_))
        ));
    }

    #[test]
    fn test_unsigned_needs_opt_out() {
        let server = Identity::generate();
        let unsigned = sealed(None, &Message::text("server", "Server", "hi"));
        assert!(open_from_server(&KEY, &server.public_key_bytes(), true, &unsigned).is_err());
        assert!(open_from_server(&KEY, &server.public_key_bytes(), false, &unsigned).is_ok());
    }

    #[test]
    fn test_join_response_against_pinned_key() {
        let server = Identity::generate();
        let payload = sealed(Some(&server), &accepted(&server));

        let response = open_join_response(&KEY, None, true, &payload).unwrap();
        assert!(response.success);
        assert!(open_join_response(&KEY, Some(&server.public_key_bytes()), true, &payload).is_ok());

        let other = Identity::generate();
        assert!(matches!(
            open_join_response(&KEY, Some(&other.public_key_bytes()), true, &payload),
            Err(ClientError::Crypto(_))
        ));
    }

    #[test]
    fn test_join_response_signed_by_someone_else() {
        let server = Identity::generate();
        let impostor = Identity::generate();
        let payload = sealed(Some(&impostor), &accepted(&server));
        assert!(open_join_response(&KEY, None, true, &payload).is_err());
    }

    #[test]
    fn test_wrong_password_is_crypto_error() {
        let server = Identity::generate();
        let payload = sealed(Some(&server), &accepted(&server));
        assert!(matches!(
            open_join_response(&[8u8; 32], None, true, &payload),
            Err(ClientError::Crypto(_))
        ));
    }

    #[test]
    fn test_rejection_reason_survives() {
        let server = Identity::generate();
        let payload = sealed(Some(&server), &JoinResponse::rejected("chan", "channel is full"));
        let response = open_join_response(&KEY, None, true, &payload).unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("channel is full"));
    }

    #[test]
    fn test_sealed_message_is_signed_by_member() {
        let member = Identity::generate();
        let msg = Message::text("member_1", "alice", "hello");
        let sealed = seal_message(&KEY, &member, "member_1", &msg).unwrap();

        let plain = crypto::decrypt(&KEY, &sealed).unwrap();
        let signed: SignedMessage = serde_json::from_slice(&plain).unwrap();
        assert_eq!(signed.sender_id, "member_1");
        verify_signature(&member.public_key_bytes(), &signed.message, &signed.signature).unwrap();
    }
}
