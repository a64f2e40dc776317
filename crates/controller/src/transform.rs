//! Generic one-to-one transform controller.
//!
//! Each source resource `S` yields exactly one target resource `T` at `mapper.forward(source)`.
//! The target content is a pure function of the source content, so reconciling an unchanged
//! source is a no-op write and the target version does not move. Targets are written under the
//! controller's name; a target owned by anyone else is never touched.

use std::sync::Arc;

use keel_core::{Delta, DeltaKind, Phase, Resource, ResourceKey, ResourceSpec};
use keel_store::{get_opt, guarded, modify, ResourceStore, RetryPolicy, UpdateOptions};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Controller, PairedMapper, ReconcileError, Registration};

/// Fills the target (pre-initialised at the mapped key with a default spec) from the source.
/// Must be deterministic.
pub type TransformFn<S, T> = Arc<dyn Fn(&Resource<S>, &mut Resource<T>) -> anyhow::Result<()> + Send + Sync>;

pub struct TransformSettings<S, T> {
    /// Controller name; also the owner tag on every target it writes.
    pub name: String,
    pub mapper: PairedMapper<S, T>,
    pub transform: TransformFn<S, T>,
}

pub struct TransformController<S, T> {
    name: String,
    mapper: PairedMapper<S, T>,
    transform: TransformFn<S, T>,
    retry: RetryPolicy,
}

impl<S: ResourceSpec, T: ResourceSpec> TransformController<S, T> {
    pub fn new(settings: TransformSettings<S, T>) -> Self {
        Self { name: settings.name, mapper: settings.mapper, transform: settings.transform, retry: RetryPolicy::default() }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn mapper(&self) -> &PairedMapper<S, T> { &self.mapper }

    fn options(&self) -> UpdateOptions { UpdateOptions::owned_by(self.name.clone()) }

    /// Compute the target for `source` and write it, creating it when absent.
    ///
    /// A transform failure aborts before anything is written.
    pub async fn on_source_changed(
        &self,
        st: &dyn ResourceStore,
        cancel: &CancellationToken,
        source: &Resource<S>,
    ) -> Result<Resource<T>, ReconcileError> {
        let key = self.mapper.forward(&source.key());
        let mut desired = Resource::<T>::from_key(key.clone())?;
        if let Err(e) = (self.transform)(source, &mut desired) {
            counter!("transform_err", 1u64);
            warn!(controller = %self.name, source = %source.key(), error = %e, "transform failed");
            return Err(ReconcileError::transform(&self.name, e));
        }
        let spec = desired.spec;

        let target = modify(st, cancel, &key, &self.options(), self.retry, |t: &mut Resource<T>| {
            t.spec = spec.clone();
            Ok::<(), ReconcileError>(())
        })
        .await?;
        counter!("transform_ok", 1u64);
        debug!(controller = %self.name, target = %key, version = %target.metadata.version, "target in sync");
        Ok(target)
    }

    /// Remove the target of a deleted source. An already absent target counts as done.
    pub async fn on_source_deleted(
        &self,
        st: &dyn ResourceStore,
        cancel: &CancellationToken,
        source: &ResourceKey,
    ) -> Result<(), ReconcileError> {
        let key = self.mapper.forward(source);
        match guarded(cancel, st.destroy(&key, Some(&self.name))).await {
            Ok(()) => {
                info!(controller = %self.name, target = %key, "target destroyed");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl<S: ResourceSpec, T: ResourceSpec> Controller for TransformController<S, T> {
    fn registration(&self) -> Registration {
        Registration { name: self.name.clone(), input_kind: S::KIND, output_kind: T::KIND }
    }

    async fn reconcile(&self, st: &dyn ResourceStore, cancel: &CancellationToken, delta: &Delta) -> Result<(), ReconcileError> {
        let key = delta.key();
        if key.kind != S::KIND {
            debug!(controller = %self.name, key = %key, "ignoring foreign kind");
            return Ok(());
        }
        if delta.kind == DeltaKind::Deleted {
            return self.on_source_deleted(st, cancel, &key).await;
        }
        // Notifications can be stale; act on what the store holds now.
        match get_opt::<S>(st, cancel, &key).await? {
            None => self.on_source_deleted(st, cancel, &key).await,
            Some(source) if source.metadata.phase == Phase::TearingDown => self.on_source_deleted(st, cancel, &key).await,
            Some(source) => self.on_source_changed(st, cancel, &source).await.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::kinds::{ClusterMachineSpec, ClusterSpec};
    use keel_store::MemStore;

    fn copy_versions() -> TransformController<ClusterMachineSpec, ClusterSpec> {
        TransformController::new(TransformSettings {
            name: "CopyCtrl".into(),
            mapper: PairedMapper::same_id(),
            transform: Arc::new(|src: &Resource<ClusterMachineSpec>, dst: &mut Resource<ClusterSpec>| -> anyhow::Result<()> {
                anyhow::ensure!(!src.spec.kubernetes_version.is_empty(), "no kubernetes version");
                dst.spec.kubernetes_version = src.spec.kubernetes_version.clone();
                Ok(())
            }),
        })
    }

    #[test]
    fn registration_names_both_kinds() {
        let r = copy_versions().registration();
        assert_eq!(r, Registration { name: "CopyCtrl".into(), input_kind: "ClusterMachine", output_kind: "Cluster" });
    }

    #[tokio::test]
    async fn transform_errors_write_nothing() {
        let st = MemStore::new();
        let cancel = CancellationToken::new();
        let src = Resource::<ClusterMachineSpec>::new("default", "m1");
        let err = copy_versions().on_source_changed(&st, &cancel, &src).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Transform { .. }), "err={err}");
        assert!(st.is_empty());
    }

    #[tokio::test]
    async fn deltas_of_other_kinds_are_ignored() {
        let st = MemStore::new();
        let cancel = CancellationToken::new();
        let other = Resource::<ClusterSpec>::new("default", "c1").to_raw().unwrap();
        copy_versions().reconcile(&st, &cancel, &Delta::applied(other)).await.unwrap();
        assert!(st.is_empty());
    }
}
