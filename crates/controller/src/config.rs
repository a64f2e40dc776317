//! Controller settings read from the environment.

use keel_core::kinds::DEFAULT_NAMESPACE;
use keel_store::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace the cluster machine pipeline lives in (`KEEL_NAMESPACE`).
    pub namespace: String,
    /// Track `MachineConfigGenOptions` as an input (`KEEL_WITH_GEN_OPTIONS`).
    pub with_gen_options: bool,
    pub retry: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { namespace: DEFAULT_NAMESPACE.to_string(), with_gen_options: false, retry: RetryPolicy::default() }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let namespace = std::env::var("KEEL_NAMESPACE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let with_gen_options = std::env::var("KEEL_WITH_GEN_OPTIONS").ok().as_deref().and_then(parse_flag).unwrap_or(false);
        Self { namespace, with_gen_options, retry: RetryPolicy::from_env() }
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
