//! Ed25519 signing identities.

use base64::prelude::*;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::CryptoError;

/// An Ed25519 keypair held in process memory.
///
/// Used by the [`LocalKms`](crate::LocalKms) provider and by tests; the
/// production path keeps private keys behind the KMS boundary and hands
/// out only [`KeyHandle`](crate::KeyHandle)s.
pub struct SigningIdentity {
    signing_key: SigningKey,
}

// Key material stays out of Debug output.
impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

impl SigningIdentity {
    /// Generates a fresh keypair from system randomness.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Derives a keypair from a 32-byte seed. Deterministic; test use only.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Signs `data`, returning the base64 detached signature.
    pub fn sign(&self, data: &[u8]) -> String {
        encode_signature(&self.signing_key.sign(data))
    }
}

/// Base64-encodes a detached signature.
pub fn encode_signature(signature: &Signature) -> String {
    BASE64_STANDARD.encode(signature.to_bytes())
}

/// Decodes a base64 detached signature.
pub fn decode_signature(encoded: &str) -> Result<Signature, CryptoError> {
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::Malformed {
            what: "signature",
            reason: e.to_string(),
        })?;
    let bytes: [u8; 64] = bytes.try_into().map_err(|_| CryptoError::Malformed {
        what: "signature",
        reason: "expected 64 bytes".to_string(),
    })?;
    Ok(Signature::from_bytes(&bytes))
}

/// Verifies a detached base64 signature against a verifying key.
pub fn verify_detached(
    key: &VerifyingKey,
    data: &[u8],
    signature_b64: &str,
    agent_id: &str,
) -> Result<(), CryptoError> {
    let signature = decode_signature(signature_b64)?;
    key.verify(data, &signature)
        .map_err(|_| CryptoError::BadSignature {
            agent_id: agent_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let identity = SigningIdentity::generate();
        let sig = identity.sign(b"decide: restart-db");
        assert!(verify_detached(&identity.verifying_key(), b"decide: restart-db", &sig, "a1").is_ok());
    }

    #[test]
    fn tampered_message_fails() {
        let identity = SigningIdentity::generate();
        let sig = identity.sign(b"original");
        let err = verify_detached(&identity.verifying_key(), b"tampered", &sig, "a1").unwrap_err();
        assert!(matches!(err, CryptoError::BadSignature { .. }));
    }

    #[test]
    fn wrong_key_fails() {
        let signer = SigningIdentity::generate();
        let other = SigningIdentity::generate();
        let sig = signer.sign(b"msg");
        assert!(verify_detached(&other.verifying_key(), b"msg", &sig, "a1").is_err());
    }

    #[test]
    fn malformed_signature_is_rejected_cleanly() {
        let identity = SigningIdentity::generate();
        let err =
            verify_detached(&identity.verifying_key(), b"msg", "not-base64!!!", "a1").unwrap_err();
        assert!(matches!(err, CryptoError::Malformed { .. }));
    }

    #[test]
    fn seeded_identity_is_deterministic() {
        let a = SigningIdentity::from_seed([7u8; 32]);
        let b = SigningIdentity::from_seed([7u8; 32]);
        assert_eq!(a.verifying_key(), b.verifying_key());
    }
}
