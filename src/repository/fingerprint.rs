//! Stable identity for backend configurations.
//!
//! Identity is a SHA-256 over the canonical JSON encoding of the
//! normalized config: struct fields serialize in declaration order and
//! JSON maps in sorted key order, so equal configs always produce
//! equal bytes, stably across processes.
//! Ephemeral request fields (ids, stream addresses) never appear in
//! canonical configs and cannot perturb the fingerprint.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint a canonical configuration. Fails only if the config
    /// is not JSON-representable.
    pub fn of<T: Serialize>(config: &T) -> Result<Self, serde_json::Error> {
        let canonical = serde_json::to_vec(config)?;
        let digest = Sha256::digest(&canonical);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough for log correlation.
        write!(f, "Fingerprint({})", &hex::encode(self.0)[..12])
    }
}
