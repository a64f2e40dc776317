//! Field paths and the predicates deciding which fields hold secrets.

use std::fmt;

/// Path of a field inside a configuration document; sequence items use their index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new() -> Self { Self::default() }

    pub fn segments(&self) -> &[String] { &self.0 }

    pub(crate) fn push(&mut self, seg: String) { self.0.push(seg); }

    pub(crate) fn pop(&mut self) { self.0.pop(); }
}

impl<S: Into<String>> FromIterator<S> for FieldPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self { Self(iter.into_iter().map(Into::into).collect()) }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0.join(".")) }
}

/// Decides whether the value at a path is a secret.
pub trait SecretPredicate: Send + Sync {
    fn is_secret(&self, path: &FieldPath) -> bool;
}

impl<F> SecretPredicate for F
where
    F: Fn(&FieldPath) -> bool + Send + Sync,
{
    fn is_secret(&self, path: &FieldPath) -> bool { self(path) }
}

/// Dotted path patterns; `*` matches exactly one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretFields {
    patterns: Vec<Vec<String>>,
}

impl SecretFields {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| p.as_ref().split('.').map(str::to_string).collect::<Vec<_>>())
            .filter(|p| p.iter().all(|seg| !seg.is_empty()))
            .collect();
        Self { patterns }
    }

    /// Secret-bearing fields of a Talos-style machine configuration.
    pub fn machine_config() -> Self {
        Self::new([
            "machine.token",
            "machine.ca.key",
            "machine.network.interfaces.*.wireguard.privateKey",
            "cluster.token",
            "cluster.secret",
            "cluster.aescbcEncryptionSecret",
            "cluster.secretboxEncryptionSecret",
            "cluster.ca.key",
            "cluster.aggregatorCA.key",
            "cluster.serviceAccount.key",
            "cluster.etcd.ca.key",
        ])
    }

    pub fn len(&self) -> usize { self.patterns.len() }

    pub fn is_empty(&self) -> bool { self.patterns.is_empty() }
}

impl Default for SecretFields {
    fn default() -> Self { Self::machine_config() }
}

impl SecretPredicate for SecretFields {
    fn is_secret(&self, path: &FieldPath) -> bool {
        let segs = path.segments();
        self.patterns.iter().any(|p| {
            p.len() == segs.len() && p.iter().zip(segs).all(|(want, got)| want == "*" || want == got)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> FieldPath { s.split('.').collect() }

    #[test]
    fn exact_and_wildcard_matches() {
        let f = SecretFields::machine_config();
        assert!(f.is_secret(&path("cluster.ca.key")));
        assert!(!f.is_secret(&path("cluster.ca.crt")));
        assert!(!f.is_secret(&path("cluster.ca")));
        assert!(f.is_secret(&path("machine.network.interfaces.3.wireguard.privateKey")));
        assert!(!f.is_secret(&path("machine.network.interfaces.3.wireguard.publicKey")));
    }

    #[test]
    fn empty_segments_are_dropped() {
        let f = SecretFields::new(["a..b", "", "c.d"]);
        assert_eq!(f.len(), 1);
    }

    #[test]
    fn closures_are_predicates() {
        let p = |p: &FieldPath| p.segments().last().map(|s| s == "password").unwrap_or(false);
        assert!(p.is_secret(&path("db.password")));
        assert_eq!(path("db.password").to_string(), "db.password");
    }
}
