//! Resource kinds of the cluster machine configuration pipeline.

use serde::{Deserialize, Serialize};

use crate::resource::ResourceSpec;
use crate::stamp::InputVersions;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Label carrying the cluster a machine-scoped resource belongs to.
pub const LABEL_CLUSTER: &str = "keel.dev/cluster";

/// Generated machine configuration of one cluster machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMachineConfigSpec {
    /// Raw machine configuration; `None` until the generator produced one.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub data: Option<Vec<u8>>,
    /// Versions of the inputs the configuration was generated from, keyed by kind.
    #[serde(default)]
    pub input_versions: InputVersions,
    #[serde(default)]
    pub cluster_machine_version: String,
}

impl ResourceSpec for ClusterMachineConfigSpec {
    const KIND: &'static str = "ClusterMachineConfig";
}

/// Machine configuration with secrets replaced by a marker; safe to show to users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactedClusterMachineConfigSpec {
    #[serde(default)]
    pub data: String,
}

impl ResourceSpec for RedactedClusterMachineConfigSpec {
    const KIND: &'static str = "RedactedClusterMachineConfig";
}

/// Machine allocated to a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMachineSpec {
    #[serde(default)]
    pub kubernetes_version: String,
}

impl ResourceSpec for ClusterMachineSpec {
    const KIND: &'static str = "ClusterMachine";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSecretsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub data: Option<Vec<u8>>,
}

impl ResourceSpec for ClusterSecretsSpec {
    const KIND: &'static str = "ClusterSecrets";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfigSpec {
    #[serde(default)]
    pub bind_port: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub site_url: String,
}

impl ResourceSpec for LoadBalancerConfigSpec {
    const KIND: &'static str = "LoadBalancerConfig";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub talos_version: String,
    #[serde(default)]
    pub kubernetes_version: String,
}

impl ResourceSpec for ClusterSpec {
    const KIND: &'static str = "Cluster";
}

/// Config patches applicable to one cluster machine, in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMachineConfigPatchesSpec {
    #[serde(default)]
    pub patches: Vec<String>,
}

impl ResourceSpec for ClusterMachineConfigPatchesSpec {
    const KIND: &'static str = "ClusterMachineConfigPatches";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigGenOptionsSpec {
    #[serde(default)]
    pub install_disk: String,
    #[serde(default)]
    pub install_image: String,
}

impl ResourceSpec for MachineConfigGenOptionsSpec {
    const KIND: &'static str = "MachineConfigGenOptions";
}

mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded.map(|e| STANDARD.decode(e.as_bytes()).map_err(serde::de::Error::custom)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_data_is_base64_on_the_wire() {
        let spec = ClusterMachineConfigSpec { data: Some(b"machine: {}".to_vec()), ..Default::default() };
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["data"], "bWFjaGluZToge30=");
        assert_eq!(v["clusterMachineVersion"], "");
        let back: ClusterMachineConfigSpec = serde_json::from_value(v).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn absent_config_data_stays_absent() {
        let spec: ClusterMachineConfigSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec.data, None);
        assert!(serde_json::to_value(&spec).unwrap().get("data").is_none());
    }
}
