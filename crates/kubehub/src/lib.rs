//! Keel kubehub: a [`ResourceStore`] backed by the Kubernetes API server.
//!
//! Every resource kind maps to a custom resource in `keel.dev/v1alpha1`; the object name is the
//! resource id and the Kubernetes namespace is the resource namespace. `resourceVersion` is the
//! compare-and-swap token, the owner lives in an annotation and a set `deletionTimestamp` means
//! the resource is tearing down.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Context, Result as AnyResult};
use keel_core::{Error, Labels, Metadata, Phase, RawResource, ResourceKey, Result, Version};
use keel_store::{ResourceStore, UpdateOptions};
use kube::{
    api::{Api, DeleteParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::histogram;
use tracing::{debug, info};

pub const GROUP: &str = "keel.dev";
pub const VERSION: &str = "v1alpha1";
pub const OWNER_ANNOTATION: &str = "keel.dev/owner";

/// Plural resource name for a kind: lowercased, with an `s` appended unless already present.
pub fn plural(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if lower.ends_with('s') { lower } else { format!("{lower}s") }
}

pub fn api_resource(kind: &str) -> ApiResource {
    let gvk = GroupVersionKind::gvk(GROUP, VERSION, kind);
    ApiResource::from_gvk_with_plural(&gvk, &plural(kind))
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Connect using the ambient kubeconfig / in-cluster configuration.
    pub async fn try_default() -> AnyResult<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        info!("kube store: client ready");
        Ok(Self::new(client))
    }

    fn api(&self, key: &ResourceKey) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &key.namespace, &api_resource(&key.kind))
    }

    async fn fetch(&self, key: &ResourceKey) -> Result<DynamicObject> {
        let t0 = Instant::now();
        let obj = self.api(key).get_opt(&key.id).await.map_err(|e| map_kube_err(e, key, Version::default()))?;
        histogram!("kube_store_get_ms", t0.elapsed().as_secs_f64() * 1000.0);
        obj.ok_or_else(|| Error::NotFound(key.clone()))
    }
}

/// Translate API-server failures into the store taxonomy.
pub fn map_kube_err(e: kube::Error, key: &ResourceKey, expected: Version) -> Error {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(key.clone()),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => Error::AlreadyExists(key.clone()),
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict { key: key.clone(), expected },
        other => Error::Backend(other.to_string()),
    }
}

/// Build the object to submit for a resource. `resourceVersion` is set only for existing resources.
pub fn to_object(raw: &RawResource, owner: Option<&str>) -> DynamicObject {
    let ar = api_resource(&raw.metadata.kind);
    let mut obj = DynamicObject::new(&raw.metadata.id, &ar)
        .within(&raw.metadata.namespace)
        .data(serde_json::json!({ "spec": raw.spec }));
    obj.metadata.labels = non_empty(raw.metadata.labels.clone());
    if let Some(owner) = owner {
        obj.metadata.annotations = Some(BTreeMap::from([(OWNER_ANNOTATION.to_string(), owner.to_string())]));
    }
    if raw.metadata.version.get() > 0 {
        obj.metadata.resource_version = Some(raw.metadata.version.to_string());
    }
    obj
}

/// Carry a resource's labels, spec and version onto the live object it replaces.
///
/// Everything else on `live` (annotations, finalizers, owner references) is kept as is.
pub fn merge_into(mut live: DynamicObject, raw: &RawResource) -> DynamicObject {
    live.metadata.labels = non_empty(raw.metadata.labels.clone());
    live.metadata.resource_version = Some(raw.metadata.version.to_string());
    match live.data.as_object_mut() {
        Some(fields) => {
            fields.insert("spec".to_string(), raw.spec.clone());
        }
        None => live.data = serde_json::json!({ "spec": raw.spec }),
    }
    live
}

/// Read a resource back from its object form.
pub fn from_object(kind: &str, obj: DynamicObject) -> Result<RawResource> {
    let meta = obj.metadata;
    let id = meta.name.ok_or_else(|| Error::Backend(format!("{kind} object without metadata.name")))?;
    let namespace = meta.namespace.unwrap_or_default();
    let version = match meta.resource_version.as_deref() {
        Some(rv) => rv.parse::<Version>().map_err(|e| Error::Backend(format!("resourceVersion {rv:?} of {kind}/{id}: {e}")))?,
        None => Version::default(),
    };
    let owner = meta.annotations.as_ref().and_then(|a| a.get(OWNER_ANNOTATION)).cloned();
    let phase = if meta.deletion_timestamp.is_some() { Phase::TearingDown } else { Phase::Running };
    let created = meta.creation_timestamp.map(|t| t.0.timestamp()).unwrap_or(0);
    let mut metadata = Metadata::new(ResourceKey::new(namespace, kind, id));
    metadata.version = version;
    metadata.labels = meta.labels.unwrap_or_default();
    metadata.owner = owner;
    metadata.phase = phase;
    metadata.created = created;
    metadata.updated = created;
    let spec = obj.data.get("spec").cloned().unwrap_or(serde_json::Value::Null);
    Ok(RawResource { metadata, spec })
}

fn non_empty(labels: Labels) -> Option<Labels> {
    if labels.is_empty() { None } else { Some(labels) }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &ResourceKey) -> Result<RawResource> {
        let obj = self.fetch(key).await?;
        from_object(&key.kind, obj)
    }

    async fn create(&self, resource: RawResource, owner: Option<&str>) -> Result<RawResource> {
        let key = resource.key();
        let mut obj = to_object(&resource, owner);
        obj.metadata.resource_version = None;
        let t0 = Instant::now();
        let created = self
            .api(&key)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(e, &key, Version::default()))?;
        histogram!("kube_store_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(key = %key, "kube store: created");
        from_object(&key.kind, created)
    }

    async fn update(&self, resource: RawResource, opts: &UpdateOptions) -> Result<RawResource> {
        let key = resource.key();
        let expected = resource.metadata.version;
        let live = self.fetch(&key).await?;
        let current = from_object(&key.kind, live.clone())?;
        if current.metadata.version != expected {
            return Err(Error::Conflict { key, expected });
        }
        if current.metadata.owner.as_deref() != opts.owner.as_deref() {
            return Err(Error::OwnerConflict { key, owner: current.metadata.owner, writer: opts.owner.clone() });
        }
        if !opts.expected_phase.admits(current.metadata.phase) {
            let expected_phase = if current.metadata.phase == Phase::Running { Phase::TearingDown } else { Phase::Running };
            return Err(Error::PhaseConflict { key, expected: expected_phase, actual: current.metadata.phase });
        }
        // The API server re-checks resourceVersion, so a racing writer still surfaces as 409.
        let obj = merge_into(live, &resource);
        let t0 = Instant::now();
        let replaced = self
            .api(&key)
            .replace(&key.id, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(e, &key, expected))?;
        histogram!("kube_store_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(key = %key, "kube store: replaced");
        from_object(&key.kind, replaced)
    }

    async fn destroy(&self, key: &ResourceKey, owner: Option<&str>) -> Result<()> {
        let current = from_object(&key.kind, self.fetch(key).await?)?;
        if current.metadata.owner.as_deref() != owner {
            return Err(Error::OwnerConflict { key: key.clone(), owner: current.metadata.owner, writer: owner.map(str::to_string) });
        }
        self.api(key)
            .delete(&key.id, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_err(e, key, current.metadata.version))?;
        debug!(key = %key, "kube store: deleted");
        Ok(())
    }
}
