//! Signed message envelope exchanged between users, the gateway and DON nodes.
//!
//! Signatures follow the Ethereum personal-message scheme: the body is
//! flattened into fixed-width fields, hashed with keccak256 under the
//! `"\x19Ethereum Signed Message:\n"` prefix and signed with a recoverable
//! secp256k1 signature, so the sender's address can be recovered from the
//! signature alone.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use super::address::Address;
use crate::error::{GatewayError, GatewayResult};

/// Maximum byte length of a message id.
pub const MESSAGE_ID_MAX_LEN: usize = 128;
/// Maximum byte length of a method name.
pub const MESSAGE_METHOD_MAX_LEN: usize = 64;
/// Maximum byte length of a DON id.
pub const MESSAGE_DON_ID_MAX_LEN: usize = 64;

const SIGNATURE_LEN: usize = 65;
const ETH_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";

/// Message body covered by the signature.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageBody {
    /// Caller-chosen id, unique per sender while a request is in flight.
    pub message_id: String,
    /// Method name selecting the request handler.
    pub method: String,
    /// Target DON.
    #[serde(default)]
    pub don_id: String,
    /// Lowercase hex address of the signer.
    #[serde(default)]
    pub sender: String,
    /// Method-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A message body plus its detachable signature.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    pub body: MessageBody,
    /// `0x`-prefixed hex of `r || s || v`; empty when unsigned.
    #[serde(default)]
    pub signature: String,
}

impl Message {
    /// Create an unsigned message.
    pub fn new(
        message_id: impl Into<String>,
        method: impl Into<String>,
        don_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            body: MessageBody {
                message_id: message_id.into(),
                method: method.into(),
                don_id: don_id.into(),
                sender: String::new(),
                payload,
            },
            signature: String::new(),
        }
    }

    /// Sign the body with `key`, setting both the signature and the sender.
    pub fn sign(&mut self, key: &SigningKey) -> GatewayResult<()> {
        let digest = self.body.signing_digest()?;
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| GatewayError::Signing(e.to_string()))?;

        let mut raw = Vec::with_capacity(SIGNATURE_LEN);
        raw.extend_from_slice(&signature.to_bytes());
        raw.push(recovery_id.to_byte() + 27);

        self.signature = format!("0x{}", hex::encode(raw));
        self.body.sender = Address::from_verifying_key(key.verifying_key()).to_string();
        Ok(())
    }

    /// Full validation: required fields plus signature recovery.
    pub fn validate(&self) -> GatewayResult<()> {
        self.validate_fields()?;
        self.verify_signature()
    }

    /// Structural checks only. No cryptography is performed.
    pub fn validate_fields(&self) -> GatewayResult<()> {
        let body = &self.body;
        if body.message_id.is_empty() {
            return Err(GatewayError::InvalidMessage("empty message id".to_string()));
        }
        if body.message_id.len() > MESSAGE_ID_MAX_LEN {
            return Err(GatewayError::InvalidMessage(format!(
                "message id exceeds {MESSAGE_ID_MAX_LEN} bytes"
            )));
        }
        if body.method.is_empty() {
            return Err(GatewayError::InvalidMessage("empty method".to_string()));
        }
        if body.method.len() > MESSAGE_METHOD_MAX_LEN {
            return Err(GatewayError::InvalidMessage(format!(
                "method exceeds {MESSAGE_METHOD_MAX_LEN} bytes"
            )));
        }
        if body.don_id.len() > MESSAGE_DON_ID_MAX_LEN {
            return Err(GatewayError::InvalidMessage(format!(
                "DON id exceeds {MESSAGE_DON_ID_MAX_LEN} bytes"
            )));
        }
        if body.sender.is_empty() {
            return Err(GatewayError::InvalidMessage("empty sender".to_string()));
        }
        Ok(())
    }

    /// Recover the signer and check it matches the declared sender.
    pub fn verify_signature(&self) -> GatewayResult<()> {
        let declared: Address = self
            .body
            .sender
            .parse()
            .map_err(|e: super::address::ParseAddressError| {
                GatewayError::InvalidMessage(e.to_string())
            })?;
        let signer = self.recover_signer()?;
        if signer != declared {
            return Err(GatewayError::InvalidMessage(format!(
                "signer {signer} does not match sender {declared}"
            )));
        }
        Ok(())
    }

    /// Recover the address that produced the signature.
    pub fn recover_signer(&self) -> GatewayResult<Address> {
        let hex_part = self
            .signature
            .strip_prefix("0x")
            .unwrap_or(&self.signature);
        let raw = hex::decode(hex_part)
            .map_err(|e| GatewayError::InvalidMessage(format!("malformed signature: {e}")))?;
        if raw.len() != SIGNATURE_LEN {
            return Err(GatewayError::InvalidMessage(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                raw.len()
            )));
        }

        let signature = Signature::from_slice(&raw[..64])
            .map_err(|e| GatewayError::InvalidMessage(format!("malformed signature: {e}")))?;
        let v = raw[64];
        let recovery_id = RecoveryId::from_byte(if v >= 27 { v - 27 } else { v })
            .ok_or_else(|| GatewayError::InvalidMessage(format!("invalid recovery id {v}")))?;

        let digest = self.body.signing_digest()?;
        let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
            .map_err(|e| GatewayError::InvalidMessage(format!("signature recovery failed: {e}")))?;
        Ok(Address::from_verifying_key(&key))
    }
}

impl MessageBody {
    /// Fixed-width flattening of the signed fields.
    ///
    /// Oversized fields are truncated here; `validate_fields` rejects them
    /// before any signature is checked.
    pub fn raw_bytes(&self) -> GatewayResult<Vec<u8>> {
        let payload = if self.payload.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.payload)
                .map_err(|e| GatewayError::InvalidMessage(format!("unencodable payload: {e}")))?
        };

        let mut raw = Vec::with_capacity(
            MESSAGE_ID_MAX_LEN + MESSAGE_METHOD_MAX_LEN + MESSAGE_DON_ID_MAX_LEN + payload.len(),
        );
        push_padded(&mut raw, &self.message_id, MESSAGE_ID_MAX_LEN);
        push_padded(&mut raw, &self.method, MESSAGE_METHOD_MAX_LEN);
        push_padded(&mut raw, &self.don_id, MESSAGE_DON_ID_MAX_LEN);
        raw.extend_from_slice(&payload);
        Ok(raw)
    }

    fn signing_digest(&self) -> GatewayResult<[u8; 32]> {
        let raw = self.raw_bytes()?;
        let mut hasher = Keccak256::new();
        hasher.update(ETH_MESSAGE_PREFIX.as_bytes());
        hasher.update(raw.len().to_string().as_bytes());
        hasher.update(&raw);
        Ok(hasher.finalize().into())
    }
}

fn push_padded(buf: &mut Vec<u8>, field: &str, width: usize) {
    let bytes = field.as_bytes();
    let take = bytes.len().min(width);
    buf.extend_from_slice(&bytes[..take]);
    buf.resize(buf.len() + (width - take), 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_key(seed: u8) -> SigningKey {
        let mut secret = [0u8; 32];
        secret[31] = seed;
        SigningKey::from_slice(&secret).unwrap()
    }

    fn signed_message() -> Message {
        let mut msg = Message::new("1234", "secrets_set", "don_id", json!({"slot": 1}));
        msg.sign(&test_key(7)).unwrap();
        msg
    }

    #[test]
    fn test_sign_sets_sender_and_validates() {
        let msg = signed_message();
        let expected = Address::from_verifying_key(test_key(7).verifying_key());
        assert_eq!(msg.body.sender, expected.to_string());
        assert!(msg.signature.starts_with("0x"));
        assert_eq!(msg.signature.len(), 2 + SIGNATURE_LEN * 2);
        msg.validate().unwrap();
    }

    #[test]
    fn test_tampered_payload_fails_validation() {
        let mut msg = signed_message();
        msg.body.payload = json!({"slot": 2});
        let err = msg.validate().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidMessage(_)));
    }

    #[test]
    fn test_foreign_sender_fails_validation() {
        let mut msg = signed_message();
        msg.body.sender = Address::from_verifying_key(test_key(9).verifying_key()).to_string();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_sender_comparison_ignores_case() {
        let mut msg = signed_message();
        msg.body.sender = msg.body.sender.to_uppercase().replacen("0X", "0x", 1);
        msg.validate().unwrap();
    }

    #[test]
    fn test_missing_fields_rejected() {
        let mut msg = signed_message();
        msg.body.message_id.clear();
        assert!(msg.validate_fields().is_err());

        let mut msg = signed_message();
        msg.body.method = "m".repeat(MESSAGE_METHOD_MAX_LEN + 1);
        assert!(msg.validate_fields().is_err());

        let mut msg = Message::new("1", "secrets_list", "", serde_json::Value::Null);
        assert!(msg.validate_fields().is_err(), "unsigned message has no sender");
        msg.sign(&test_key(3)).unwrap();
        msg.validate().unwrap();
    }

    #[test]
    fn test_garbage_signature_rejected() {
        let mut msg = signed_message();
        msg.signature = "0x1234".to_string();
        assert!(msg.verify_signature().is_err());
        msg.signature = "not hex".to_string();
        assert!(msg.verify_signature().is_err());
    }

    #[test]
    fn test_raw_bytes_layout() {
        let msg = Message::new("id", "m", "d", serde_json::Value::Null);
        let raw = msg.body.raw_bytes().unwrap();
        assert_eq!(
            raw.len(),
            MESSAGE_ID_MAX_LEN + MESSAGE_METHOD_MAX_LEN + MESSAGE_DON_ID_MAX_LEN
        );
        assert_eq!(&raw[..2], b"id");
        assert_eq!(raw[2], 0);
        assert_eq!(raw[MESSAGE_ID_MAX_LEN], b'm');
    }

    #[test]
    fn test_json_field_names() {
        let msg = signed_message();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["body"]["message_id"], "1234");
        assert_eq!(value["body"]["don_id"], "don_id");
        let decoded: Message = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, msg);
    }
}
