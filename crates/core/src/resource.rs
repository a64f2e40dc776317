use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type Labels = BTreeMap<String, String>;

/// Store-maintained revision counter. Starts at 1 on create and grows by one per committed write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const INITIAL: Version = Version(1);

    pub const fn new(v: u64) -> Self { Self(v) }
    pub const fn get(self) -> u64 { self.0 }
    pub fn next(self) -> Self { Self(self.0.saturating_add(1)) }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl std::str::FromStr for Version {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> { s.parse::<u64>().map(Self) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Running,
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => f.write_str("running"),
            Phase::TearingDown => f.write_str("tearing-down"),
        }
    }
}

/// Identity of a resource: unique per namespace + kind + id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub kind: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), kind: kind.into(), id: id.into() }
    }

    /// Key of a typed resource kind.
    pub fn of<S: ResourceSpec>(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(namespace, S::KIND, id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub namespace: String,
    pub kind: String,
    pub id: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    /// Name of the controller allowed to write this resource; `None` means user-owned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub phase: Phase,
    /// Unix seconds; informational only.
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

impl Metadata {
    pub fn new(key: ResourceKey) -> Self {
        let ResourceKey { namespace, kind, id } = key;
        Self {
            namespace,
            kind,
            id,
            version: Version::default(),
            labels: Labels::new(),
            owner: None,
            phase: Phase::Running,
            created: 0,
            updated: 0,
        }
    }

    pub fn key(&self) -> ResourceKey { ResourceKey::new(self.namespace.clone(), self.kind.clone(), self.id.clone()) }

    pub fn label(&self, key: &str) -> Option<&str> { self.labels.get(key).map(String::as_str) }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Typed spec of a resource kind.
pub trait ResourceSpec: Serialize + DeserializeOwned + Clone + Default + PartialEq + Send + Sync + 'static {
    const KIND: &'static str;
}

/// Untyped resource as exchanged with stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResource {
    pub metadata: Metadata,
    pub spec: serde_json::Value,
}

impl RawResource {
    pub fn key(&self) -> ResourceKey { self.metadata.key() }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resource<S> {
    pub metadata: Metadata,
    pub spec: S,
}

impl<S: ResourceSpec> Resource<S> {
    /// A fresh, not yet stored resource with a default spec.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self { metadata: Metadata::new(ResourceKey::of::<S>(namespace, id)), spec: S::default() }
    }

    pub fn from_key(key: ResourceKey) -> Result<Self> {
        if key.kind != S::KIND {
            return Err(Error::KindMismatch { expected: S::KIND.to_string(), found: key.kind });
        }
        Ok(Self { metadata: Metadata::new(key), spec: S::default() })
    }

    pub fn key(&self) -> ResourceKey { self.metadata.key() }

    pub fn with_spec(mut self, spec: S) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata = self.metadata.with_label(key, value);
        self
    }

    pub fn to_raw(&self) -> Result<RawResource> {
        Ok(RawResource { metadata: self.metadata.clone(), spec: serde_json::to_value(&self.spec)? })
    }

    pub fn from_raw(raw: RawResource) -> Result<Self> {
        if raw.metadata.kind != S::KIND {
            return Err(Error::KindMismatch { expected: S::KIND.to_string(), found: raw.metadata.kind });
        }
        // Stores may hand back `null` for a spec that was never set.
        let spec = if raw.spec.is_null() { S::default() } else { serde_json::from_value(raw.spec)? };
        Ok(Self { metadata: raw.metadata, spec })
    }
}

impl<S: ResourceSpec> TryFrom<RawResource> for Resource<S> {
    type Error = Error;

    fn try_from(raw: RawResource) -> Result<Self> { Self::from_raw(raw) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{ClusterMachineConfigSpec, RedactedClusterMachineConfigSpec};

    #[test]
    fn raw_conversion_rejects_foreign_kind() {
        let r = Resource::<RedactedClusterMachineConfigSpec>::new("default", "m1");
        let raw = r.to_raw().unwrap();
        let err = Resource::<ClusterMachineConfigSpec>::from_raw(raw).unwrap_err();
        assert!(matches!(err, Error::KindMismatch { .. }), "err={err}");
    }

    #[test]
    fn null_spec_reads_as_default() {
        let raw = RawResource {
            metadata: Metadata::new(ResourceKey::of::<RedactedClusterMachineConfigSpec>("default", "m1")),
            spec: serde_json::Value::Null,
        };
        let r = Resource::<RedactedClusterMachineConfigSpec>::from_raw(raw).unwrap();
        assert_eq!(r.spec.data, "");
    }

    #[test]
    fn key_display_is_namespace_kind_id() {
        let k = ResourceKey::new("default", "Cluster", "talos-1");
        assert_eq!(k.to_string(), "default/Cluster/talos-1");
    }
}
