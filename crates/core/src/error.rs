use crate::resource::{Phase, ResourceKey, Version};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by resource stores and the typed helpers around them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not_found: {0}")]
    NotFound(ResourceKey),
    #[error("already_exists: {0}")]
    AlreadyExists(ResourceKey),
    /// Another writer advanced the resource past the version this write was based on.
    #[error("conflict: {key} expected version {expected}")]
    Conflict { key: ResourceKey, expected: Version },
    #[error("owner_conflict: {key} is owned by {owner:?}, write attempted by {writer:?}")]
    OwnerConflict { key: ResourceKey, owner: Option<String>, writer: Option<String> },
    #[error("phase_conflict: {key} is {actual}, expected {expected}")]
    PhaseConflict { key: ResourceKey, expected: Phase, actual: Phase },
    #[error("kind_mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: String, found: String },
    #[error("conflict retries exhausted for {key} after {attempts} attempts")]
    RetriesExhausted { key: ResourceKey, attempts: u32 },
    #[error("cancelled")]
    Cancelled,
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("backend: {0}")]
    Backend(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound(_)) }

    /// Only version conflicts and create races are worth another read-modify-write round.
    pub fn is_conflict(&self) -> bool { matches!(self, Error::Conflict { .. } | Error::AlreadyExists(_)) }

    pub fn is_cancelled(&self) -> bool { matches!(self, Error::Cancelled) }
}
