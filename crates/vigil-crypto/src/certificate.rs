//! Agent certificates: issuance, expiry, revocation, and verification.
//!
//! Certificates are the identity behind every recommendation and every
//! consensus message. The [`CertificateDirectory`] is the authoritative
//! in-process registry; readers go through it on every verification so a
//! revocation takes effect immediately (spec: revocations invalidate on
//! write, no stale-cache quorum contributions).

use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_types::{AgentId, Timestamp};

use crate::pem::{decode_public_key_pem, encode_public_key_pem};
use crate::{verify_detached, CryptoError};

/// Lifecycle status of one certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Active,
    Revoked,
    Expired,
}

impl CertificateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CertificateStatus::Active => "active",
            CertificateStatus::Revoked => "revoked",
            CertificateStatus::Expired => "expired",
        }
    }
}

/// One issued certificate binding an agent id to a public key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCertificate {
    pub agent_id: AgentId,
    pub certificate_id: Uuid,
    /// PEM-encoded Ed25519 public key.
    pub public_key: String,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
    pub status: CertificateStatus,
    pub revoked_at: Option<Timestamp>,
    pub revocation_reason: Option<String>,
}

impl AgentCertificate {
    /// True if the certificate can vouch for signatures at `now`.
    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        self.status == CertificateStatus::Active && now < self.expires_at
    }

    /// Decodes the PEM public key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        Ok(decode_public_key_pem(&self.public_key)?)
    }
}

/// Default certificate lifetime: 90 days.
pub const DEFAULT_CERT_LIFETIME_MS: u64 = 90 * 24 * 60 * 60 * 1_000;

/// In-process certificate registry.
///
/// One certificate per agent is active at a time; rotation issues the
/// replacement before marking the predecessor expired, so verification
/// never sees a gap.
#[derive(Debug, Default)]
pub struct CertificateDirectory {
    by_agent: HashMap<AgentId, Vec<AgentCertificate>>,
}

impl CertificateDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a certificate for `agent_id` over the given public key.
    pub fn issue(
        &mut self,
        agent_id: AgentId,
        key: &VerifyingKey,
        lifetime_ms: u64,
        now: Timestamp,
    ) -> AgentCertificate {
        let certificate = AgentCertificate {
            agent_id: agent_id.clone(),
            certificate_id: Uuid::new_v4(),
            public_key: encode_public_key_pem(key),
            issued_at: now,
            expires_at: now.add_millis(lifetime_ms),
            status: CertificateStatus::Active,
            revoked_at: None,
            revocation_reason: None,
        };
        tracing::info!(
            agent = %agent_id,
            certificate = %certificate.certificate_id,
            expires_at = %certificate.expires_at,
            "issued agent certificate"
        );
        self.by_agent
            .entry(agent_id)
            .or_default()
            .push(certificate.clone());
        certificate
    }

    /// Rotates the agent's identity: issues a new certificate for `key`
    /// and expires the previous active one.
    pub fn rotate(
        &mut self,
        agent_id: &AgentId,
        key: &VerifyingKey,
        lifetime_ms: u64,
        now: Timestamp,
    ) -> AgentCertificate {
        let replacement = self.issue(agent_id.clone(), key, lifetime_ms, now);
        if let Some(certs) = self.by_agent.get_mut(agent_id) {
            for cert in certs.iter_mut() {
                if cert.certificate_id != replacement.certificate_id
                    && cert.status == CertificateStatus::Active
                {
                    cert.status = CertificateStatus::Expired;
                }
            }
        }
        replacement
    }

    /// Revokes every active certificate of the agent.
    ///
    /// Messages signed by a revoked certificate and received after this
    /// point never contribute to a quorum.
    pub fn revoke(&mut self, agent_id: &AgentId, reason: impl Into<String>, now: Timestamp) {
        let reason = reason.into();
        if let Some(certs) = self.by_agent.get_mut(agent_id) {
            for cert in certs.iter_mut() {
                if cert.status == CertificateStatus::Active {
                    cert.status = CertificateStatus::Revoked;
                    cert.revoked_at = Some(now);
                    cert.revocation_reason = Some(reason.clone());
                    tracing::warn!(
                        agent = %agent_id,
                        certificate = %cert.certificate_id,
                        reason = %reason,
                        "revoked agent certificate"
                    );
                }
            }
        }
    }

    /// The agent's currently valid certificate, if any.
    ///
    /// Expiry is lazily applied here: a certificate past `expires_at` is
    /// marked expired on first observation.
    pub fn active_certificate(
        &mut self,
        agent_id: &AgentId,
        now: Timestamp,
    ) -> Option<&AgentCertificate> {
        let certs = self.by_agent.get_mut(agent_id)?;
        for cert in certs.iter_mut() {
            if cert.status == CertificateStatus::Active && now >= cert.expires_at {
                cert.status = CertificateStatus::Expired;
            }
        }
        certs.iter().find(|cert| cert.is_valid_at(now))
    }

    /// Verifies a detached signature against the agent's active
    /// certificate.
    pub fn verify(
        &mut self,
        agent_id: &AgentId,
        data: &[u8],
        signature_b64: &str,
        now: Timestamp,
    ) -> Result<(), CryptoError> {
        let certificate =
            self.active_certificate(agent_id, now)
                .ok_or_else(|| CryptoError::NoCertificate {
                    agent_id: agent_id.to_string(),
                })?;
        let key = certificate.verifying_key()?;
        verify_detached(&key, data, signature_b64, agent_id.as_str())
    }

    /// All certificates known for an agent (history included).
    pub fn certificates(&self, agent_id: &AgentId) -> &[AgentCertificate] {
        self.by_agent
            .get(agent_id)
            .map_or(&[], |certs| certs.as_slice())
    }

    /// Agents that currently hold a valid certificate.
    pub fn agents_with_active_certificates(&self, now: Timestamp) -> Vec<AgentId> {
        self.by_agent
            .iter()
            .filter(|(_, certs)| certs.iter().any(|c| c.is_valid_at(now)))
            .map(|(agent, _)| agent.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SigningIdentity;

    fn directory_with(agent: &str, identity: &SigningIdentity, now: Timestamp) -> CertificateDirectory {
        let mut dir = CertificateDirectory::new();
        dir.issue(
            AgentId::from(agent),
            &identity.verifying_key(),
            DEFAULT_CERT_LIFETIME_MS,
            now,
        );
        dir
    }

    #[test]
    fn verify_against_active_certificate() {
        let identity = SigningIdentity::generate();
        let now = Timestamp::from_secs(1_000);
        let mut dir = directory_with("detection-agent", &identity, now);

        let sig = identity.sign(b"payload");
        assert!(dir
            .verify(&AgentId::from("detection-agent"), b"payload", &sig, now)
            .is_ok());
    }

    #[test]
    fn revoked_certificate_rejects_signatures() {
        let identity = SigningIdentity::generate();
        let now = Timestamp::from_secs(1_000);
        let agent = AgentId::from("detection-agent");
        let mut dir = directory_with("detection-agent", &identity, now);

        dir.revoke(&agent, "key compromise", now.add_millis(5));
        let sig = identity.sign(b"payload");
        let err = dir
            .verify(&agent, b"payload", &sig, now.add_millis(10))
            .unwrap_err();
        assert!(matches!(err, CryptoError::NoCertificate { .. }));
    }

    #[test]
    fn expiry_is_applied_lazily() {
        let identity = SigningIdentity::generate();
        let now = Timestamp::from_secs(1_000);
        let agent = AgentId::from("a");
        let mut dir = CertificateDirectory::new();
        dir.issue(agent.clone(), &identity.verifying_key(), 1_000, now);

        assert!(dir.active_certificate(&agent, now).is_some());
        assert!(dir
            .active_certificate(&agent, now.add_millis(2_000))
            .is_none());
        assert_eq!(dir.certificates(&agent)[0].status, CertificateStatus::Expired);
    }

    #[test]
    fn rotation_replaces_active_certificate() {
        let old_identity = SigningIdentity::generate();
        let new_identity = SigningIdentity::generate();
        let now = Timestamp::from_secs(1_000);
        let agent = AgentId::from("a");
        let mut dir = directory_with("a", &old_identity, now);

        let replacement = dir.rotate(
            &agent,
            &new_identity.verifying_key(),
            DEFAULT_CERT_LIFETIME_MS,
            now.add_millis(1),
        );

        let active = dir
            .active_certificate(&agent, now.add_millis(2))
            .unwrap()
            .clone();
        assert_eq!(active.certificate_id, replacement.certificate_id);

        // Old key no longer verifies, new one does
        let old_sig = old_identity.sign(b"m");
        assert!(dir.verify(&agent, b"m", &old_sig, now.add_millis(3)).is_err());
        let new_sig = new_identity.sign(b"m");
        assert!(dir.verify(&agent, b"m", &new_sig, now.add_millis(3)).is_ok());
    }
}
