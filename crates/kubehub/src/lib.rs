//! Trellis kubehub: the only crate that talks to the desired-state store.
//!
//! Everything above this crate sees objects as [`DynamicObject`] keyed by [`ObjectKey`] and goes
//! through [`ObjectStore`]. [`KubeStore`] backs it with the API server, [`MemStore`] with a map
//! (used by every test in the workspace).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use trellis_core::StoreError;

mod events;
mod kube_store;
mod mem;

pub use events::{EventKind, EventRecord, EventSink, KubeEvents, MemEvents};
pub use kube_store::{missing_kinds, KubeStore};
pub use mem::{apply_merge_patch, MemStore, StoreOp, Verb};

/// apiVersion + kind of a served resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kind {
    pub api_version: String,
    pub kind: String,
}

impl Kind {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self { api_version: K::api_version(&()).into_owned(), kind: K::kind(&()).into_owned() }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), self.api_version.clone()),
        };
        GroupVersionKind { group, version, kind: self.kind.clone() }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Identity of one object in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub ty: Kind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(ty: Kind, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { ty, namespace: namespace.map(str::to_string), name: name.into() }
    }

    pub fn for_kind<K: Resource<DynamicType = ()>>(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self::new(Kind::of::<K>(), namespace, name)
    }

    /// Key of a dynamic object; requires type meta and a name.
    pub fn of(obj: &DynamicObject) -> Result<Self, StoreError> {
        let types = obj.types.as_ref().ok_or_else(|| StoreError::Invalid("object without apiVersion/kind".into()))?;
        let name = obj.metadata.name.clone().ok_or_else(|| StoreError::Invalid(format!("{} without a name", types.kind)))?;
        Ok(Self {
            ty: Kind::new(types.api_version.clone(), types.kind.clone()),
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.ty.kind, ns, self.name),
            None => write!(f, "{}/{}", self.ty.kind, self.name),
        }
    }
}

/// Read/write access to the desired-state store.
///
/// Writes return the stored object so callers can chain on the fresh resourceVersion.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError>;
    /// Objects of `ty` in `namespace` (all namespaces / cluster scope when None) carrying every
    /// label in `selector`.
    async fn list(
        &self,
        ty: &Kind,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, StoreError>;
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;
    /// Full replace, guarded by `metadata.resourceVersion` when set.
    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;
    /// JSON merge patch of metadata and spec.
    async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<DynamicObject, StoreError>;
    /// JSON merge patch of the status subresource.
    async fn patch_status(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<DynamicObject, StoreError>;
    /// Delete with background cascade to owned objects.
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

/// Read-only view handed to transformers; writes only happen in the executor.
#[derive(Clone)]
pub struct StoreReader {
    inner: Arc<dyn ObjectStore>,
}

impl StoreReader {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    pub async fn get_dynamic(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        self.inner.get(key).await
    }

    pub async fn get<K>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, StoreError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        match self.inner.get(&ObjectKey::for_kind::<K>(namespace, name)).await? {
            Some(obj) => from_dynamic(&obj).map(Some),
            None => Ok(None),
        }
    }

    pub async fn list_dynamic(
        &self,
        ty: &Kind,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        self.inner.list(ty, namespace, selector).await
    }

    pub async fn list<K>(&self, namespace: Option<&str>, selector: &BTreeMap<String, String>) -> Result<Vec<K>, StoreError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let objs = self.inner.list(&Kind::of::<K>(), namespace, selector).await?;
        objs.iter().map(from_dynamic).collect()
    }
}

/// Typed object -> dynamic object, with type meta filled from `K`.
pub fn to_dynamic<K>(obj: &K) -> Result<DynamicObject, StoreError>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let v = serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
    let mut d: DynamicObject = serde_json::from_value(v).map_err(|e| StoreError::Invalid(e.to_string()))?;
    d.types = Some(TypeMeta { api_version: K::api_version(&()).into_owned(), kind: K::kind(&()).into_owned() });
    if !d.data.is_object() {
        d.data = serde_json::Value::Object(Default::default());
    }
    Ok(d)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K, StoreError> {
    let v = serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
    serde_json::from_value(v).map_err(|e| StoreError::Invalid(format!("{}: {e}", obj.metadata.name.as_deref().unwrap_or("?"))))
}

/// Every label in `selector` is present on `labels` with the same value.
pub fn labels_match(labels: Option<&BTreeMap<String, String>>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}
