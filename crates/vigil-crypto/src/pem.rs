//! Minimal PEM encoding for Ed25519 public keys.
//!
//! Certificates persist public keys as PEM blocks (RFC 7468 framing around
//! the raw 32-byte key). Only the `PUBLIC KEY` label is accepted.

use base64::prelude::*;
use ed25519_dalek::VerifyingKey;

const LABEL: &str = "PUBLIC KEY";

/// PEM parsing error.
#[derive(Debug, thiserror::Error)]
pub enum PemError {
    #[error("invalid PEM format: {0}")]
    InvalidFormat(String),
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
    #[error("invalid Ed25519 public key")]
    InvalidKey,
}

/// Renders a verifying key as a PEM block.
pub fn encode_public_key_pem(key: &VerifyingKey) -> String {
    let body = BASE64_STANDARD.encode(key.as_bytes());
    format!("-----BEGIN {LABEL}-----\n{body}\n-----END {LABEL}-----\n")
}

/// Parses a PEM block back into a verifying key.
pub fn decode_public_key_pem(pem: &str) -> Result<VerifyingKey, PemError> {
    let begin = format!("-----BEGIN {LABEL}-----");
    let end = format!("-----END {LABEL}-----");

    let mut body = String::new();
    let mut inside = false;
    for line in pem.lines() {
        let line = line.trim();
        if line == begin {
            inside = true;
        } else if line == end {
            if !inside {
                return Err(PemError::InvalidFormat("END before BEGIN".to_string()));
            }
            let bytes = BASE64_STANDARD.decode(body.as_bytes())?;
            let bytes: [u8; 32] = bytes.try_into().map_err(|_| PemError::InvalidKey)?;
            return VerifyingKey::from_bytes(&bytes).map_err(|_| PemError::InvalidKey);
        } else if inside && !line.is_empty() {
            body.push_str(line);
        }
    }
    Err(PemError::InvalidFormat(format!(
        "no {LABEL} block found"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SigningIdentity;

    #[test]
    fn round_trip() {
        let key = SigningIdentity::generate().verifying_key();
        let pem = encode_public_key_pem(&key);
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(decode_public_key_pem(&pem).unwrap(), key);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_public_key_pem("not a pem").is_err());
        assert!(decode_public_key_pem("-----BEGIN PUBLIC KEY-----\n!!!\n-----END PUBLIC KEY-----").is_err());
    }
}
