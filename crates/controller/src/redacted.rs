//! Redacted view of generated machine configurations.

use std::sync::Arc;

use keel_core::kinds::{ClusterMachineConfigSpec, RedactedClusterMachineConfigSpec};
use keel_core::Resource;
use keel_redact::{SecretFields, SecretPredicate};

use crate::{PairedMapper, TransformController, TransformSettings};

pub const REDACTED_CLUSTER_MACHINE_CONFIG_CONTROLLER: &str = "RedactedClusterMachineConfigController";

pub type RedactedClusterMachineConfigController =
    TransformController<ClusterMachineConfigSpec, RedactedClusterMachineConfigSpec>;

/// Maintains a `RedactedClusterMachineConfig` next to every `ClusterMachineConfig`.
pub fn new_redacted_cluster_machine_config_controller() -> RedactedClusterMachineConfigController {
    with_predicate(Arc::new(SecretFields::machine_config()))
}

/// Same controller with a custom notion of which fields are secret.
pub fn with_predicate(predicate: Arc<dyn SecretPredicate>) -> RedactedClusterMachineConfigController {
    TransformController::new(TransformSettings {
        name: REDACTED_CLUSTER_MACHINE_CONFIG_CONTROLLER.to_string(),
        mapper: PairedMapper::same_id(),
        transform: Arc::new(
            move |cmc: &Resource<ClusterMachineConfigSpec>, cmcr: &mut Resource<RedactedClusterMachineConfigSpec>| -> anyhow::Result<()> {
                cmcr.spec.data = match cmc.spec.data.as_deref() {
                    None | Some([]) => String::new(),
                    Some(data) => keel_redact::redact(data, &*predicate)?,
                };
                Ok(())
            },
        ),
    })
}
