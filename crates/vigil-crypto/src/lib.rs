//! # vigil-crypto: Digests, signatures, and agent identity
//!
//! Cryptographic primitives shared by the event store, message bus,
//! consensus engine, and audit log:
//!
//! - SHA-256 digests over canonical JSON ([`sha256`], [`event_integrity_hash`])
//! - Hash chaining ([`chain_hash`])
//! - HMAC-SHA256 for keyed integrity ([`hmac_sha256`])
//! - Ed25519 signing and verification ([`SigningIdentity`], [`verify_detached`])
//! - Agent certificates with expiry and revocation ([`AgentCertificate`],
//!   [`CertificateDirectory`])
//! - The KMS boundary ([`KmsProvider`], [`LocalKms`]); private keys never
//!   leave the provider

mod certificate;
mod digest;
mod keys;
mod kms;
mod pem;

pub use certificate::{
    AgentCertificate, CertificateDirectory, CertificateStatus, DEFAULT_CERT_LIFETIME_MS,
};
pub use digest::{chain_hash, event_integrity_hash, hmac_sha256, sha256, sha256_json};
pub use keys::{decode_signature, encode_signature, verify_detached, SigningIdentity};
pub use kms::{KeyHandle, KmsProvider, LocalKms};
pub use pem::{decode_public_key_pem, encode_public_key_pem, PemError};

use thiserror::Error;

/// Errors from signing, verification, and certificate operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Signature bytes failed verification against the given key.
    #[error("signature verification failed for {agent_id}")]
    BadSignature { agent_id: String },

    /// Signature or key material could not be decoded.
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    /// No active certificate exists for the agent.
    #[error("no active certificate for {agent_id}")]
    NoCertificate { agent_id: String },

    /// Certificate exists but is expired or revoked.
    #[error("certificate {certificate_id} for {agent_id} is {status}")]
    CertificateInvalid {
        agent_id: String,
        certificate_id: String,
        status: &'static str,
    },

    /// Unknown KMS key handle.
    #[error("unknown key handle: {0}")]
    UnknownKeyHandle(String),

    #[error("PEM error: {0}")]
    Pem(#[from] PemError),
}

impl CryptoError {
    /// Maps the failure onto the workspace taxonomy.
    pub fn kind(&self) -> vigil_types::ErrorKind {
        match self {
            CryptoError::BadSignature { .. } | CryptoError::CertificateInvalid { .. } => {
                vigil_types::ErrorKind::Authentication
            }
            CryptoError::Malformed { .. } => vigil_types::ErrorKind::Validation,
            CryptoError::NoCertificate { .. } => vigil_types::ErrorKind::Authentication,
            CryptoError::UnknownKeyHandle(_) | CryptoError::Pem(_) => {
                vigil_types::ErrorKind::Internal
            }
        }
    }
}
