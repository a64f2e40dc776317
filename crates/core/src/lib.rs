//! Keel core types: resources, kinds, version stamps and the store error taxonomy.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod error;
pub mod kinds;
mod resource;
mod stamp;

pub use error::{Error, Result};
pub use resource::{Labels, Metadata, Phase, RawResource, Resource, ResourceKey, ResourceSpec, Version};
pub use stamp::{Fingerprint, InputVersions, VersionStamp};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// Change notification handed to controllers by the dispatch mechanism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    /// Resource as observed at the time of the change (last known state for deletions).
    pub resource: RawResource,
}

impl Delta {
    pub fn applied(resource: RawResource) -> Self { Self { kind: DeltaKind::Applied, resource } }
    pub fn deleted(resource: RawResource) -> Self { Self { kind: DeltaKind::Deleted, resource } }
    pub fn key(&self) -> ResourceKey { self.resource.metadata.key() }
}

/// Seconds since the Unix epoch.
pub fn now_ts() -> i64 { chrono::Utc::now().timestamp() }

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, Error, Fingerprint, InputVersions, Labels, Metadata, Phase, RawResource, Resource,
        ResourceKey, ResourceSpec, Result, Version, VersionStamp,
    };
}
