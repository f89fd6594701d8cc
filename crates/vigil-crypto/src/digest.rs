//! SHA-256 digests, hash chaining, and HMAC.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};
use vigil_types::{canonical_json, EventKind, Hash, IncidentId, Timestamp};

/// SHA-256 of raw bytes.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash::from_bytes(hasher.finalize().into())
}

/// SHA-256 over the canonical JSON rendering of a value.
pub fn sha256_json(value: &Value) -> Hash {
    sha256(canonical_json(value).as_bytes())
}

/// Integrity hash of one event:
/// `SHA256(incident_id || event_type || canonical(payload) || timestamp)`.
///
/// The timestamp contributes in its persisted ISO-8601 form so that the
/// hash is reproducible from a stored record alone.
pub fn event_integrity_hash(
    incident_id: &IncidentId,
    kind: EventKind,
    payload: &Value,
    timestamp: Timestamp,
) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(incident_id.as_str().as_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update(canonical_json(payload).as_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    Hash::from_bytes(hasher.finalize().into())
}

/// Links one digest onto a chain: `SHA256(data || previous)`.
///
/// With `previous == Hash::ZERO` this is the genesis link; the zero hash
/// still participates in the preimage so a truncated chain cannot be
/// re-rooted undetected.
pub fn chain_hash(data: &[u8], previous: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update(previous.as_bytes());
    Hash::from_bytes(hasher.finalize().into())
}

type HmacSha256 = Hmac<Sha256>;

/// Keyed integrity tag over `data`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Hash {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    Hash::from_bytes(mac.finalize().into_bytes().into())
}
