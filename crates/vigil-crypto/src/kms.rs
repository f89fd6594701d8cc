//! The KMS / secrets boundary.
//!
//! Private keys never leave the provider: callers receive opaque
//! [`KeyHandle`]s and submit bytes for signing. [`LocalKms`] is the
//! in-process implementation used by the node runtime and tests; cloud
//! providers plug in behind the same trait.

use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{CryptoError, SigningIdentity};

/// Opaque reference to a private key held by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyHandle(Uuid);

impl KeyHandle {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key management boundary consumed by the core.
pub trait KmsProvider: Send + Sync {
    /// Creates a keypair; returns the handle and the public half.
    fn generate_keypair(&mut self) -> (KeyHandle, VerifyingKey);

    /// Signs `data` with the key behind `handle` (base64 detached).
    fn sign(&self, handle: &KeyHandle, data: &[u8]) -> Result<String, CryptoError>;

    /// Verifies a detached signature against a public key.
    fn verify(
        &self,
        public_key: &VerifyingKey,
        data: &[u8],
        signature_b64: &str,
    ) -> Result<(), CryptoError>;

    /// Stores a named secret.
    fn store_secret(&mut self, name: &str, value: &str);

    /// Retires the key behind `handle` and issues a replacement.
    fn rotate(&mut self, handle: &KeyHandle) -> Result<(KeyHandle, VerifyingKey), CryptoError>;
}

/// In-memory provider. Secrets are zeroized on drop.
#[derive(Default)]
pub struct LocalKms {
    keys: HashMap<KeyHandle, SigningIdentity>,
    secrets: HashMap<String, Zeroizing<String>>,
}

impl LocalKms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-only peek at a stored secret.
    #[cfg(test)]
    fn secret(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(|s| s.as_str())
    }
}

impl std::fmt::Debug for LocalKms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKms")
            .field("keys", &self.keys.len())
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

impl KmsProvider for LocalKms {
    fn generate_keypair(&mut self) -> (KeyHandle, VerifyingKey) {
        let identity = SigningIdentity::generate();
        let public = identity.verifying_key();
        let handle = KeyHandle::generate();
        self.keys.insert(handle.clone(), identity);
        (handle, public)
    }

    fn sign(&self, handle: &KeyHandle, data: &[u8]) -> Result<String, CryptoError> {
        let identity = self
            .keys
            .get(handle)
            .ok_or_else(|| CryptoError::UnknownKeyHandle(handle.to_string()))?;
        Ok(identity.sign(data))
    }

    fn verify(
        &self,
        public_key: &VerifyingKey,
        data: &[u8],
        signature_b64: &str,
    ) -> Result<(), CryptoError> {
        crate::verify_detached(public_key, data, signature_b64, "<kms>")
    }

    fn store_secret(&mut self, name: &str, value: &str) {
        self.secrets
            .insert(name.to_string(), Zeroizing::new(value.to_string()));
    }

    fn rotate(&mut self, handle: &KeyHandle) -> Result<(KeyHandle, VerifyingKey), CryptoError> {
        if self.keys.remove(handle).is_none() {
            return Err(CryptoError::UnknownKeyHandle(handle.to_string()));
        }
        Ok(self.generate_keypair())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_through_handle() {
        let mut kms = LocalKms::new();
        let (handle, public) = kms.generate_keypair();
        let sig = kms.sign(&handle, b"commit").unwrap();
        assert!(kms.verify(&public, b"commit", &sig).is_ok());
    }

    #[test]
    fn rotation_invalidates_old_handle() {
        let mut kms = LocalKms::new();
        let (handle, _) = kms.generate_keypair();
        let (new_handle, new_public) = kms.rotate(&handle).unwrap();
        assert!(kms.sign(&handle, b"x").is_err());
        let sig = kms.sign(&new_handle, b"x").unwrap();
        assert!(kms.verify(&new_public, b"x", &sig).is_ok());
    }

    #[test]
    fn secrets_are_stored_by_name() {
        let mut kms = LocalKms::new();
        kms.store_secret("pagerduty-token", "t0ken");
        assert_eq!(kms.secret("pagerduty-token"), Some("t0ken"));
        assert_eq!(kms.secret("missing"), None);
    }
}
