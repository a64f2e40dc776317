//! Keel store: the resource store seam consumed by controllers, an in-RAM implementation,
//! and the optimistic-concurrency helpers built on top of it.

#![forbid(unsafe_code)]

use std::sync::{Mutex, PoisonError};

use keel_core::{now_ts, Delta, Error, Phase, RawResource, ResourceKey, Result, Version};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::debug;

pub mod safe;

pub use safe::{get, get_opt, guarded, modify, update_with_conflicts, RetryPolicy};

/// Phase a write expects the stored resource to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedPhase {
    #[default]
    Running,
    TearingDown,
    Any,
}

impl ExpectedPhase {
    pub fn admits(self, phase: Phase) -> bool {
        match self {
            ExpectedPhase::Any => true,
            ExpectedPhase::Running => phase == Phase::Running,
            ExpectedPhase::TearingDown => phase == Phase::TearingDown,
        }
    }

    fn expected(self) -> Phase {
        match self {
            ExpectedPhase::TearingDown => Phase::TearingDown,
            ExpectedPhase::Running | ExpectedPhase::Any => Phase::Running,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Writer identity; must match the stored owner.
    pub owner: Option<String>,
    pub expected_phase: ExpectedPhase,
}

impl UpdateOptions {
    pub fn owned_by(owner: impl Into<String>) -> Self { Self { owner: Some(owner.into()), ..Self::default() } }

    pub fn any_phase(mut self) -> Self {
        self.expected_phase = ExpectedPhase::Any;
        self
    }
}

/// Resource store with compare-and-swap updates.
///
/// `update` commits only if the stored version equals `resource.metadata.version`;
/// otherwise it fails with [`Error::Conflict`]. Owner and phase guards are checked against
/// the stored resource. Implementations never retry on their own; see [`safe`].
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<RawResource>;

    async fn create(&self, resource: RawResource, owner: Option<&str>) -> Result<RawResource>;

    async fn update(&self, resource: RawResource, opts: &UpdateOptions) -> Result<RawResource>;

    async fn destroy(&self, key: &ResourceKey, owner: Option<&str>) -> Result<()>;
}

pub(crate) fn check_owner(key: &ResourceKey, stored: Option<&str>, writer: Option<&str>) -> Result<()> {
    if stored == writer {
        return Ok(());
    }
    Err(Error::OwnerConflict { key: key.clone(), owner: stored.map(str::to_string), writer: writer.map(str::to_string) })
}

/// In-RAM store keyed by resource identity. Publishes a [`Delta`] per committed write.
pub struct MemStore {
    items: Mutex<FxHashMap<ResourceKey, RawResource>>,
    events: broadcast::Sender<Delta>,
}

impl Default for MemStore {
    fn default() -> Self { Self::with_capacity(1024) }
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    /// `cap` bounds the change-notification backlog of slow subscribers.
    pub fn with_capacity(cap: usize) -> Self {
        let (events, _) = broadcast::channel(cap.max(1));
        Self { items: Mutex::new(FxHashMap::default()), events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delta> { self.events.subscribe() }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    /// Move a resource into the tearing-down phase, as a deletion request would.
    pub fn teardown(&self, key: &ResourceKey, owner: Option<&str>) -> Result<RawResource> {
        let out = {
            let mut items = self.lock();
            let cur = items.get_mut(key).ok_or_else(|| Error::NotFound(key.clone()))?;
            check_owner(key, cur.metadata.owner.as_deref(), owner)?;
            if cur.metadata.phase != Phase::TearingDown {
                cur.metadata.phase = Phase::TearingDown;
                cur.metadata.version = cur.metadata.version.next();
                cur.metadata.updated = now_ts();
            }
            cur.clone()
        };
        self.publish(Delta::applied(out.clone()));
        Ok(out)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<ResourceKey, RawResource>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, d: Delta) {
        // No subscribers is fine; notifications are best-effort.
        let _ = self.events.send(d);
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemStore {
    async fn get(&self, key: &ResourceKey) -> Result<RawResource> {
        self.lock().get(key).cloned().ok_or_else(|| Error::NotFound(key.clone()))
    }

    async fn create(&self, mut resource: RawResource, owner: Option<&str>) -> Result<RawResource> {
        let key = resource.key();
        let out = {
            let mut items = self.lock();
            if items.contains_key(&key) {
                return Err(Error::AlreadyExists(key));
            }
            let ts = now_ts();
            resource.metadata.version = Version::INITIAL;
            resource.metadata.owner = owner.map(str::to_string);
            resource.metadata.phase = Phase::Running;
            resource.metadata.created = ts;
            resource.metadata.updated = ts;
            items.insert(key.clone(), resource.clone());
            resource
        };
        debug!(key = %key, "mem store: created");
        self.publish(Delta::applied(out.clone()));
        Ok(out)
    }

    async fn update(&self, mut resource: RawResource, opts: &UpdateOptions) -> Result<RawResource> {
        let key = resource.key();
        let out = {
            let mut items = self.lock();
            let cur = items.get_mut(&key).ok_or_else(|| Error::NotFound(key.clone()))?;
            if cur.metadata.version != resource.metadata.version {
                return Err(Error::Conflict { key, expected: resource.metadata.version });
            }
            check_owner(&key, cur.metadata.owner.as_deref(), opts.owner.as_deref())?;
            if !opts.expected_phase.admits(cur.metadata.phase) {
                return Err(Error::PhaseConflict {
                    key,
                    expected: opts.expected_phase.expected(),
                    actual: cur.metadata.phase,
                });
            }
            // Store-maintained fields are never taken from the writer.
            resource.metadata.version = cur.metadata.version.next();
            resource.metadata.owner = cur.metadata.owner.clone();
            resource.metadata.phase = cur.metadata.phase;
            resource.metadata.created = cur.metadata.created;
            resource.metadata.updated = now_ts();
            *cur = resource.clone();
            resource
        };
        debug!(key = %key, version = %out.metadata.version, "mem store: updated");
        self.publish(Delta::applied(out.clone()));
        Ok(out)
    }

    async fn destroy(&self, key: &ResourceKey, owner: Option<&str>) -> Result<()> {
        let removed = {
            let mut items = self.lock();
            let cur = items.get(key).ok_or_else(|| Error::NotFound(key.clone()))?;
            check_owner(key, cur.metadata.owner.as_deref(), owner)?;
            items.remove(key)
        };
        if let Some(r) = removed {
            debug!(key = %key, "mem store: destroyed");
            self.publish(Delta::deleted(r));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::Metadata;

    fn raw(id: &str) -> RawResource {
        RawResource { metadata: Metadata::new(ResourceKey::new("default", "Cluster", id)), spec: serde_json::json!({}) }
    }

    #[tokio::test]
    async fn create_assigns_initial_version_and_owner() {
        let st = MemStore::new();
        let r = st.create(raw("c1"), Some("ctrl")).await.unwrap();
        assert_eq!(r.metadata.version, Version::INITIAL);
        assert_eq!(r.metadata.owner.as_deref(), Some("ctrl"));
        assert!(matches!(st.create(raw("c1"), None).await, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let st = MemStore::new();
        let r = st.create(raw("c1"), None).await.unwrap();
        let v2 = st.update(r.clone(), &UpdateOptions::default()).await.unwrap();
        assert_eq!(v2.metadata.version, Version::new(2));
        let err = st.update(r, &UpdateOptions::default()).await.unwrap_err();
        assert!(err.is_conflict(), "err={err}");
    }

    #[tokio::test]
    async fn foreign_writer_is_rejected() {
        let st = MemStore::new();
        let r = st.create(raw("c1"), Some("ctrl")).await.unwrap();
        let err = st.update(r.clone(), &UpdateOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::OwnerConflict { .. }), "err={err}");
        assert!(matches!(st.destroy(&r.key(), None).await, Err(Error::OwnerConflict { .. })));
        st.destroy(&r.key(), Some("ctrl")).await.unwrap();
        assert!(st.is_empty());
    }

    #[tokio::test]
    async fn phase_guard() {
        let st = MemStore::new();
        let r = st.create(raw("c1"), None).await.unwrap();
        let torn = st.teardown(&r.key(), None).unwrap();
        let err = st.update(torn.clone(), &UpdateOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::PhaseConflict { .. }), "err={err}");
        let ok = st.update(torn, &UpdateOptions::default().any_phase()).await.unwrap();
        assert_eq!(ok.metadata.phase, Phase::TearingDown);
    }

    #[tokio::test]
    async fn writes_are_published() {
        let st = MemStore::new();
        let mut rx = st.subscribe();
        let r = st.create(raw("c1"), None).await.unwrap();
        st.destroy(&r.key(), None).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, keel_core::DeltaKind::Applied);
        assert_eq!(rx.recv().await.unwrap().kind, keel_core::DeltaKind::Deleted);
    }
}
