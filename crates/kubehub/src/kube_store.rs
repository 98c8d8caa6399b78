use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::discovery::Discovery;
use kube::Client;
use tracing::{debug, warn};
use trellis_core::labels::selector_string;
use trellis_core::StoreError;

use crate::{Kind, ObjectKey, ObjectStore};

/// [`ObjectStore`] over the API server, one dynamic `Api` per call.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ty: &Kind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = ApiResource::from_gvk(&ty.gvk());
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn map_err(e: kube::Error, what: &dyn std::fmt::Display) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(format!("{what}: {}", ae.message)),
        kube::Error::Api(ae) if ae.code == 422 => StoreError::Invalid(format!("{what}: {}", ae.message)),
        other => StoreError::Api(format!("{what}: {other}")),
    }
}

fn key_of(obj: &DynamicObject) -> Result<ObjectKey, StoreError> {
    ObjectKey::of(obj)
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        self.api(&key.ty, key.namespace.as_deref()).get_opt(&key.name).await.map_err(|e| map_err(e, key))
    }

    async fn list(
        &self,
        ty: &Kind,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector_string(selector));
        }
        let list = self.api(ty, namespace).list(&lp).await.map_err(|e| map_err(e, ty))?;
        debug!(kind = %ty, ns = ?namespace, count = list.items.len(), "listed");
        Ok(list.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(obj)?;
        self.api(&key.ty, key.namespace.as_deref()).create(&PostParams::default(), obj).await.map_err(|e| map_err(e, &key))
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = key_of(obj)?;
        self.api(&key.ty, key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_err(e, &key))
    }

    async fn patch(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<DynamicObject, StoreError> {
        self.api(&key.ty, key.namespace.as_deref())
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_err(e, key))
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<DynamicObject, StoreError> {
        self.api(&key.ty, key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_err(e, key))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api(&key.ty, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, key))
    }
}

/// Kinds from `wanted` the API server does not serve (CRDs not installed yet).
pub async fn missing_kinds(client: Client, wanted: &[Kind]) -> anyhow::Result<Vec<Kind>> {
    let discovery = Discovery::new(client).run().await?;
    let mut served = std::collections::BTreeSet::new();
    for group in discovery.groups() {
        for (ar, _caps) in group.recommended_resources() {
            served.insert((ar.group.clone(), ar.version.clone(), ar.kind.clone()));
        }
    }
    let missing: Vec<Kind> = wanted
        .iter()
        .filter(|k| {
            let gvk = k.gvk();
            !served.contains(&(gvk.group, gvk.version, gvk.kind))
        })
        .cloned()
        .collect();
    for k in &missing {
        warn!(kind = %k, "kind not served by the API server");
    }
    Ok(missing)
}
