//! Input version gating for generated machine configurations.
//!
//! A `ClusterMachineConfig` is stamped with the version of every resource it is generated from.
//! The stamp is only written once the whole [`DependencySet`] exists; until then the stored
//! stamp is left alone so an incomplete set never looks current.

use keel_core::kinds::{
    ClusterMachineConfigPatchesSpec, ClusterMachineConfigSpec, ClusterMachineSpec, ClusterSecretsSpec, ClusterSpec,
    LoadBalancerConfigSpec, MachineConfigGenOptionsSpec, LABEL_CLUSTER,
};
use keel_core::{Delta, DeltaKind, Fingerprint, InputVersions, Metadata, Resource, ResourceKey, ResourceSpec, Version, VersionStamp};
use keel_store::{get_opt, guarded, update_with_conflicts, ResourceStore, RetryPolicy, UpdateOptions};
use metrics::counter;
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Controller, ControllerConfig, ReconcileError, Registration};

/// Owner of `ClusterMachineConfig` resources; input stamps are written under this name.
pub const CLUSTER_MACHINE_CONFIG_CONTROLLER: &str = "ClusterMachineConfigController";

pub const CONFIG_INPUTS_RECONCILER: &str = "ClusterMachineConfigInputsReconciler";

/// Ordered references whose presence and versions decide whether a config is current.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    keys: SmallVec<[ResourceKey; 6]>,
}

impl DependencySet {
    pub fn new() -> Self { Self::default() }

    /// Inputs of the configuration of `machine` in `cluster`.
    pub fn for_cluster_machine(namespace: &str, cluster: &str, machine: &str, with_gen_options: bool) -> Self {
        let mut set = Self::new();
        set.push(ResourceKey::of::<ClusterSecretsSpec>(namespace, cluster));
        set.push(ResourceKey::of::<ClusterMachineSpec>(namespace, machine));
        set.push(ResourceKey::of::<LoadBalancerConfigSpec>(namespace, cluster));
        set.push(ResourceKey::of::<ClusterSpec>(namespace, cluster));
        set.push(ResourceKey::of::<ClusterMachineConfigPatchesSpec>(namespace, machine));
        if with_gen_options {
            set.push(ResourceKey::of::<MachineConfigGenOptionsSpec>(namespace, machine));
        }
        set
    }

    pub fn push(&mut self, key: ResourceKey) { self.keys.push(key); }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceKey> { self.keys.iter() }

    pub fn len(&self) -> usize { self.keys.len() }

    pub fn is_empty(&self) -> bool { self.keys.is_empty() }
}

impl FromIterator<ResourceKey> for DependencySet {
    fn from_iter<I: IntoIterator<Item = ResourceKey>>(iter: I) -> Self { Self { keys: iter.into_iter().collect() } }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Metadata of every dependency, in set order.
    Complete(Vec<Metadata>),
    /// First dependency that does not exist.
    Missing(ResourceKey),
}

/// Resolves a [`DependencySet`] against the store and derives stamps from the result.
pub struct DependencyVersionTracker;

impl DependencyVersionTracker {
    /// Fetch dependencies in order, stopping at the first one that is absent.
    pub async fn resolve(
        st: &dyn ResourceStore,
        cancel: &CancellationToken,
        deps: &DependencySet,
    ) -> keel_core::Result<Resolution> {
        let mut found = Vec::with_capacity(deps.len());
        for key in deps.iter() {
            match guarded(cancel, st.get(key)).await {
                Ok(raw) => found.push(raw.metadata),
                Err(e) if e.is_not_found() => return Ok(Resolution::Missing(key.clone())),
                Err(e) => return Err(e),
            }
        }
        Ok(Resolution::Complete(found))
    }

    /// `{kind: version}` over resolved dependencies.
    pub fn input_versions(resolved: &[Metadata]) -> InputVersions {
        resolved.iter().map(|m| (m.kind.clone(), m.version.to_string())).collect()
    }

    pub fn fingerprint(resolved: &[Metadata]) -> Fingerprint {
        let stamps: Vec<VersionStamp> = resolved.iter().map(VersionStamp::of).collect();
        Fingerprint::compute(&stamps)
    }

    /// Whether a stored stamp no longer matches the resolved dependencies.
    pub fn is_stale(stored: &InputVersions, resolved: &[Metadata]) -> bool { *stored != Self::input_versions(resolved) }
}

/// What [`InputReconciler::reconcile_config_inputs`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputsOutcome {
    /// No `ClusterMachineConfig` for the trigger yet.
    SourceMissing,
    /// The trigger carries no cluster label.
    Unassigned,
    /// A dependency is absent; the stored stamp was left as it was.
    Deferred { missing: ResourceKey },
    /// The stored stamp already matches.
    Unchanged { fingerprint: Fingerprint },
    Stamped { fingerprint: Fingerprint, version: Version },
}

pub struct InputReconciler {
    owner: String,
    with_gen_options: bool,
    retry: RetryPolicy,
}

impl Default for InputReconciler {
    fn default() -> Self { Self::new() }
}

impl InputReconciler {
    pub fn new() -> Self {
        Self { owner: CLUSTER_MACHINE_CONFIG_CONTROLLER.to_string(), with_gen_options: false, retry: RetryPolicy::default() }
    }

    pub fn from_config(cfg: &ControllerConfig) -> Self { Self::new().with_gen_options(cfg.with_gen_options).with_retry(cfg.retry) }

    pub fn with_gen_options(mut self, on: bool) -> Self {
        self.with_gen_options = on;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Writer identity for the stamp; must match the owner of the stored config.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Bring the input stamp of the config generated for `trigger` up to date.
    ///
    /// Missing config, missing cluster label and missing dependencies are successful no-ops.
    /// The stamp replaces the stored map as a whole, whatever phase the config is in.
    pub async fn reconcile_config_inputs(
        &self,
        st: &dyn ResourceStore,
        cancel: &CancellationToken,
        trigger: &Resource<ClusterMachineSpec>,
    ) -> Result<InputsOutcome, ReconcileError> {
        let ns = trigger.metadata.namespace.as_str();
        let machine = trigger.metadata.id.as_str();
        let key = ResourceKey::of::<ClusterMachineConfigSpec>(ns, machine);

        let Some(config) = get_opt::<ClusterMachineConfigSpec>(st, cancel, &key).await? else {
            debug!(machine, "no machine config yet");
            return Ok(InputsOutcome::SourceMissing);
        };
        let Some(cluster) = trigger.metadata.label(LABEL_CLUSTER) else {
            debug!(machine, "machine not assigned to a cluster");
            return Ok(InputsOutcome::Unassigned);
        };

        let deps = DependencySet::for_cluster_machine(ns, cluster, machine, self.with_gen_options);
        let resolved = match DependencyVersionTracker::resolve(st, cancel, &deps).await? {
            Resolution::Complete(found) => found,
            Resolution::Missing(missing) => {
                counter!("inputs_deferred", 1u64);
                debug!(machine, missing = %missing, "inputs incomplete; stamp deferred");
                return Ok(InputsOutcome::Deferred { missing });
            }
        };

        let versions = DependencyVersionTracker::input_versions(&resolved);
        let fingerprint = DependencyVersionTracker::fingerprint(&resolved);
        // Input versions come from the store; the machine version is the trigger's own.
        let trigger_version = trigger.metadata.version.to_string();

        if !DependencyVersionTracker::is_stale(&config.spec.input_versions, &resolved)
            && config.spec.cluster_machine_version == trigger_version
        {
            return Ok(InputsOutcome::Unchanged { fingerprint });
        }

        let opts = UpdateOptions::owned_by(self.owner.clone()).any_phase();
        let res = update_with_conflicts(st, cancel, &key, &opts, self.retry, |c: &mut Resource<ClusterMachineConfigSpec>| {
            c.spec.input_versions = versions.clone();
            c.spec.cluster_machine_version = trigger_version.clone();
            Ok::<(), ReconcileError>(())
        })
        .await;
        match res {
            Ok(stored) => {
                counter!("inputs_stamped", 1u64);
                info!(machine, cluster, fingerprint = %fingerprint, version = %stored.metadata.version, "machine config inputs stamped");
                Ok(InputsOutcome::Stamped { fingerprint, version: stored.metadata.version })
            }
            Err(ReconcileError::Store(e)) if e.is_not_found() => Ok(InputsOutcome::SourceMissing),
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl Controller for InputReconciler {
    fn registration(&self) -> Registration {
        Registration {
            name: CONFIG_INPUTS_RECONCILER.to_string(),
            input_kind: ClusterMachineSpec::KIND,
            output_kind: ClusterMachineConfigSpec::KIND,
        }
    }

    async fn reconcile(&self, st: &dyn ResourceStore, cancel: &CancellationToken, delta: &Delta) -> Result<(), ReconcileError> {
        let key = delta.key();
        if key.kind != ClusterMachineSpec::KIND || delta.kind == DeltaKind::Deleted {
            return Ok(());
        }
        let Some(trigger) = get_opt::<ClusterMachineSpec>(st, cancel, &key).await? else {
            return Ok(());
        };
        self.reconcile_config_inputs(st, cancel, &trigger).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_set_order() {
        let set = DependencySet::for_cluster_machine("default", "c1", "m1", false);
        let kinds: Vec<_> = set.iter().map(|k| k.kind.as_str()).collect();
        assert_eq!(
            kinds,
            ["ClusterSecrets", "ClusterMachine", "LoadBalancerConfig", "Cluster", "ClusterMachineConfigPatches"]
        );
        let ids: Vec<_> = set.iter().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, ["c1", "m1", "c1", "c1", "m1"]);

        let with = DependencySet::for_cluster_machine("default", "c1", "m1", true);
        assert_eq!(with.len(), 6);
        assert_eq!(with.iter().last().map(|k| k.kind.as_str()), Some("MachineConfigGenOptions"));
    }

    #[test]
    fn stamps_and_staleness() {
        let mut a = Metadata::new(ResourceKey::new("default", "Cluster", "c1"));
        a.version = Version::new(3);
        let mut b = Metadata::new(ResourceKey::new("default", "ClusterMachine", "m1"));
        b.version = Version::new(9);
        let resolved = vec![a, b];

        let versions = DependencyVersionTracker::input_versions(&resolved);
        assert_eq!(versions.get("Cluster").map(String::as_str), Some("3"));
        assert_eq!(versions.get("ClusterMachine").map(String::as_str), Some("9"));
        assert!(!DependencyVersionTracker::is_stale(&versions, &resolved));
        assert!(DependencyVersionTracker::is_stale(&InputVersions::new(), &resolved));

        let mut reordered = resolved.clone();
        reordered.reverse();
        assert_ne!(DependencyVersionTracker::fingerprint(&resolved), DependencyVersionTracker::fingerprint(&reordered));
    }
}
