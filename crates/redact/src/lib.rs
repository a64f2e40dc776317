//! Keel redact: machine configuration codec.
//!
//! Parses (possibly multi-document) YAML, replaces secret fields with [`REDACTED`] and encodes the
//! result canonically: mapping keys sorted, no comments, fixed indentation. Inputs that differ only
//! in comments, formatting or key order encode to the same bytes.

#![forbid(unsafe_code)]

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::debug;

mod predicate;

pub use predicate::{FieldPath, SecretFields, SecretPredicate};

/// Marker written in place of every redacted value.
pub const REDACTED: &str = "******";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config payload too large ({size} > {max} bytes)")]
    TooLarge { size: usize, max: usize },
    #[error("config document too complex (>{max} nodes)")]
    TooComplex { max: usize },
    #[error("config is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("parsing config: {0}")]
    Parse(#[source] serde_yaml::Error),
    #[error("encoding config: {0}")]
    Encode(#[source] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn max_config_bytes() -> usize {
    std::env::var("KEEL_MAX_CONFIG_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4 * 1024 * 1024) // 4 MiB default
}

fn max_config_nodes() -> usize {
    std::env::var("KEEL_MAX_CONFIG_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn node_budget_exceeded(v: &Value, max: usize) -> bool {
    // Keep a running counter and bail early when exceeding max
    fn walk(v: &Value, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Value::Mapping(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Value::Sequence(seq) => {
                for vv in seq.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Value::Tagged(t) => walk(&t.value, cur, max),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parsed machine configuration: one value per non-empty YAML document.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineConfig {
    documents: Vec<Value>,
}

impl MachineConfig {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let max = max_config_bytes();
        if data.len() > max {
            return Err(Error::TooLarge { size: data.len(), max });
        }
        let text = std::str::from_utf8(data)?;
        let max_nodes = max_config_nodes();
        let mut documents = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(text) {
            let v = Value::deserialize(doc).map_err(Error::Parse)?;
            if v.is_null() {
                continue;
            }
            if node_budget_exceeded(&v, max_nodes) {
                return Err(Error::TooComplex { max: max_nodes });
            }
            documents.push(v);
        }
        Ok(Self { documents })
    }

    pub fn documents(&self) -> &[Value] { &self.documents }

    /// Copy of the configuration with every secret field replaced by [`REDACTED`].
    pub fn redact_secrets(&self, predicate: &dyn SecretPredicate) -> Self { self.redact_secrets_with(predicate, REDACTED) }

    pub fn redact_secrets_with(&self, predicate: &dyn SecretPredicate, marker: &str) -> Self {
        let mut documents = self.documents.clone();
        let mut redacted = 0usize;
        for doc in documents.iter_mut() {
            let mut path = FieldPath::new();
            redact_value(doc, &mut path, predicate, marker, &mut redacted);
        }
        debug!(documents = documents.len(), redacted, "config redacted");
        Self { documents }
    }

    /// Canonical, comment-free encoding; documents are separated by `---`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = String::new();
        for (i, doc) in self.documents.iter().enumerate() {
            if i > 0 {
                out.push_str("---\n");
            }
            let s = serde_yaml::to_string(&canonical(doc)).map_err(Error::Encode)?;
            out.push_str(&s);
        }
        Ok(out.into_bytes())
    }
}

/// Parse, redact and re-encode in one step.
pub fn redact(data: &[u8], predicate: &dyn SecretPredicate) -> Result<String> {
    let cfg = MachineConfig::from_bytes(data)?;
    let bytes = cfg.redact_secrets(predicate).encode()?;
    // serde_yaml only emits UTF-8.
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn redact_value(v: &mut Value, path: &mut FieldPath, predicate: &dyn SecretPredicate, marker: &str, redacted: &mut usize) {
    match v {
        Value::Mapping(map) => {
            for (k, child) in map.iter_mut() {
                path.push(key_segment(k));
                visit(child, path, predicate, marker, redacted);
                path.pop();
            }
        }
        Value::Sequence(seq) => {
            for (i, child) in seq.iter_mut().enumerate() {
                path.push(i.to_string());
                visit(child, path, predicate, marker, redacted);
                path.pop();
            }
        }
        Value::Tagged(t) => redact_value(&mut t.value, path, predicate, marker, redacted),
        _ => {}
    }
}

fn visit(child: &mut Value, path: &mut FieldPath, predicate: &dyn SecretPredicate, marker: &str, redacted: &mut usize) {
    if !predicate.is_secret(path) {
        redact_value(child, path, predicate, marker, redacted);
        return;
    }
    // Unset secrets stay unset so the redacted view does not invent fields.
    let empty = match child {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    };
    if !empty {
        *child = Value::String(marker.to_string());
        *redacted += 1;
    }
}

fn key_segment(k: &Value) -> String {
    match k {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other).map(|s| s.trim_end().to_string()).unwrap_or_default(),
    }
}

/// Total order on mapping keys: rendered segment, then key type, then full YAML form.
/// Keys that render alike (`1` and `'1'`) still sort the same way whatever the input order.
fn key_order(k: &Value) -> (String, u8, String) {
    let rank = match k {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Sequence(_) => 4,
        Value::Mapping(_) => 5,
        Value::Tagged(_) => 6,
    };
    (key_segment(k), rank, serde_yaml::to_string(k).unwrap_or_default())
}

fn canonical(v: &Value) -> Value {
    match v {
        Value::Mapping(map) => {
            let mut entries: Vec<((String, u8, String), Value, Value)> =
                map.iter().map(|(k, vv)| (key_order(k), k.clone(), canonical(vv))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Mapping::with_capacity(entries.len());
            for (_, k, vv) in entries {
                out.insert(k, vv);
            }
            Value::Mapping(out)
        }
        Value::Sequence(seq) => Value::Sequence(seq.iter().map(canonical).collect()),
        Value::Tagged(t) => {
            let mut t = t.clone();
            t.value = canonical(&t.value);
            Value::Tagged(t)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_config_passes_through() {
        let out = redact(b"machine: {hostname: foo}", &SecretFields::default()).unwrap();
        assert_eq!(out, "machine:\n  hostname: foo\n");
    }

    #[test]
    fn private_key_is_replaced_by_marker() {
        let input = b"machine:\n  ca:\n    crt: LS0tQ1JU\n    key: LS0tS0VZ\ncluster:\n  token: abc.def\n";
        let out = redact(input, &SecretFields::default()).unwrap();
        assert!(out.contains("key: '******'") || out.contains("key: \"******\""), "out={out}");
        assert!(out.contains("crt: LS0tQ1JU"), "out={out}");
        assert!(!out.contains("LS0tS0VZ"), "out={out}");
        assert!(!out.contains("abc.def"), "out={out}");
        assert_eq!(out, redact(input, &SecretFields::default()).unwrap());
    }

    #[test]
    fn comments_formatting_and_key_order_do_not_matter() {
        let a = b"# generated\nmachine:\n  hostname: foo # inline\n  type: worker\ncluster:\n  token: t0k3n\n";
        let b = b"cluster: {token: other-token}\nmachine: {type: worker, hostname: foo}\n";
        let ra = redact(a, &SecretFields::default()).unwrap();
        let rb = redact(b, &SecretFields::default()).unwrap();
        assert_eq!(ra, rb);
        assert!(!ra.contains('#'));
    }

    #[test]
    fn keys_rendering_alike_sort_the_same_way() {
        let a = redact(b"1: a\n'1': b\n", &SecretFields::default()).unwrap();
        let b = redact(b"'1': b\n1: a\n", &SecretFields::default()).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("1: a\n"), "a={a}");
    }

    #[test]
    fn oversized_input_is_rejected() {
        let max = max_config_bytes();
        let data = vec![b'a'; max + 1];
        let e = MachineConfig::from_bytes(&data).unwrap_err();
        assert!(matches!(e, Error::TooLarge { size, max: m } if size == max + 1 && m == max), "e={e}");
    }

    #[test]
    fn empty_secrets_stay_empty() {
        let out = redact(b"cluster:\n  token: ''\n  secret: null\n", &SecretFields::default()).unwrap();
        assert!(!out.contains(REDACTED), "out={out}");
    }

    #[test]
    fn multi_document_configs_keep_their_documents() {
        let input = b"version: v1alpha1\nmachine:\n  token: s3cr3t\n---\nkind: SideroLinkConfig\napiUrl: https://example\n";
        let cfg = MachineConfig::from_bytes(input).unwrap();
        assert_eq!(cfg.documents().len(), 2);
        let out = String::from_utf8(cfg.redact_secrets(&SecretFields::default()).encode().unwrap()).unwrap();
        assert_eq!(out.matches("---\n").count(), 1);
        assert!(!out.contains("s3cr3t"));
        assert!(out.contains("apiUrl: https://example"));
    }

    #[test]
    fn custom_predicate_and_marker() {
        let cfg = MachineConfig::from_bytes(b"db:\n  password: hunter2\n").unwrap();
        let pred = |p: &FieldPath| p.to_string() == "db.password";
        let out = String::from_utf8(cfg.redact_secrets_with(&pred, "<hidden>").encode().unwrap()).unwrap();
        assert!(out.contains("<hidden>"), "out={out}");
    }

    #[test]
    fn parse_errors_are_reported() {
        let e = MachineConfig::from_bytes(b"machine: [unclosed").unwrap_err();
        assert!(matches!(e, Error::Parse(_)), "e={e}");
        let e = MachineConfig::from_bytes(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(e, Error::Utf8(_)), "e={e}");
    }

    #[test]
    fn node_budget() {
        let v: Value = serde_yaml::from_str("a: [1, 2, 3]").unwrap();
        assert!(node_budget_exceeded(&v, 3));
        assert!(!node_budget_exceeded(&v, 10));
    }
}
