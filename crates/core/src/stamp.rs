//! Version stamps and composite fingerprints over dependency sets.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resource::{Metadata, Version};

/// Per-kind versions a resource was computed from: `{kind: version}`.
pub type InputVersions = BTreeMap<String, String>;

/// Identity + revision of one resource, rendered as `kind/id@version`.
///
/// Ordering is by kind, then id, then version, so stamps of the same resource compare by revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionStamp {
    pub kind: String,
    pub id: String,
    pub version: Version,
}

impl VersionStamp {
    pub fn of(meta: &Metadata) -> Self { Self { kind: meta.kind.clone(), id: meta.id.clone(), version: meta.version } }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}@{}", self.kind, self.id, self.version) }
}

/// blake3 digest over an ordered list of stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    /// Order matters: the same stamps in a different order give a different fingerprint.
    pub fn compute<'a>(stamps: impl IntoIterator<Item = &'a VersionStamp>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for (i, s) in stamps.into_iter().enumerate() {
            if i > 0 {
                hasher.update(b",");
            }
            hasher.update(s.to_string().as_bytes());
        }
        Self(hasher.finalize())
    }

    pub fn as_bytes(&self) -> &[u8; 32] { self.0.as_bytes() }

    pub fn to_hex(&self) -> String { self.0.to_hex().to_string() }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0.to_hex()) }
}
