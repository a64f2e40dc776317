//! Keel controllers.
//!
//! - [`transform::TransformController`]: keeps one target resource per source resource in sync
//!   through a pure transform, with conflict retry, ownership and delete propagation.
//! - [`inputs::InputReconciler`]: stamps a `ClusterMachineConfig` with the versions of the
//!   resources it depends on, deferring while the dependency set is incomplete.
//! - [`redacted`]: the redacted machine configuration instantiation of the transform engine.
//!
//! Controllers do not watch anything themselves. A dispatcher feeds them [`Delta`]s through the
//! [`Controller`] trait and owns queueing, requeue and backoff.

#![forbid(unsafe_code)]

use keel_core::Delta;
use keel_store::ResourceStore;
use tokio_util::sync::CancellationToken;

pub mod config;
mod error;
pub mod inputs;
pub mod mapper;
pub mod redacted;
pub mod transform;

pub use config::ControllerConfig;
pub use error::ReconcileError;
pub use inputs::{DependencySet, DependencyVersionTracker, InputReconciler, InputsOutcome};
pub use mapper::PairedMapper;
pub use redacted::{new_redacted_cluster_machine_config_controller, RedactedClusterMachineConfigController};
pub use transform::{TransformController, TransformSettings};

/// What a controller consumes and produces; read by the dispatch mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub input_kind: &'static str,
    pub output_kind: &'static str,
}

#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    fn registration(&self) -> Registration;

    /// Handle one change of a resource of the registered input kind.
    async fn reconcile(&self, st: &dyn ResourceStore, cancel: &CancellationToken, delta: &Delta) -> Result<(), ReconcileError>;
}
