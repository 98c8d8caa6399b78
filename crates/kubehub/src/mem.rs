//! In-memory store with just enough API-server semantics for reconciliation tests:
//! resourceVersion conflicts, generation bumps, finalizer-gated deletion and owner cascade.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::core::DynamicObject;
use kube::Resource;
use serde::Serialize;
use serde_json::{Map, Value};
use trellis_core::StoreError;

use crate::{from_dynamic, labels_match, to_dynamic, Kind, ObjectKey, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Replace,
    Patch,
    PatchStatus,
    Delete,
}

/// One write issued through the [`ObjectStore`] interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOp {
    pub verb: Verb,
    pub key: ObjectKey,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    rv: u64,
    log: Vec<StoreOp>,
    rejected: BTreeSet<ObjectKey>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

/// RFC 7386 JSON merge patch.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(t) = target {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                apply_merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn encode(obj: &DynamicObject) -> Result<Value, StoreError> {
    serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn decode(v: &Value) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(v.clone()).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn meta(v: &Value) -> Option<&Map<String, Value>> {
    v.get("metadata").and_then(Value::as_object)
}

fn with_meta<R>(v: &mut Value, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
    if !v.get("metadata").is_some_and(Value::is_object) {
        v["metadata"] = Value::Object(Map::new());
    }
    let mut scratch = Map::new();
    match v.get_mut("metadata") {
        Some(Value::Object(m)) => f(m),
        _ => f(&mut scratch),
    }
}

fn meta_str<'a>(v: &'a Value, field: &str) -> Option<&'a str> {
    meta(v).and_then(|m| m.get(field)).and_then(Value::as_str)
}

/// Everything generation tracks: the object minus metadata and status.
fn spec_part(v: &Value) -> Value {
    let mut s = v.clone();
    if let Some(m) = s.as_object_mut() {
        m.remove("metadata");
        m.remove("status");
    }
    s
}

fn has_finalizers(v: &Value) -> bool {
    meta(v).and_then(|m| m.get("finalizers")).and_then(Value::as_array).is_some_and(|a| !a.is_empty())
}

fn owned_by(v: &Value, uid: &str) -> bool {
    meta(v)
        .and_then(|m| m.get("ownerReferences"))
        .and_then(Value::as_array)
        .is_some_and(|refs| refs.iter().any(|r| r.get("uid").and_then(Value::as_str) == Some(uid)))
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn admit(&self, key: &ObjectKey) -> Result<(), StoreError> {
        if self.rejected.contains(key) {
            return Err(StoreError::Api(format!("write to {key} rejected")));
        }
        Ok(())
    }

    fn existing(&self, key: &ObjectKey) -> Result<&Value, StoreError> {
        self.objects.get(key).ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn check_rv(&self, key: &ObjectKey, wanted: Option<&str>) -> Result<(), StoreError> {
        let stored = self.existing(key)?;
        match wanted {
            Some(rv) if Some(rv) != meta_str(stored, "resourceVersion") => {
                Err(StoreError::Conflict(format!("{key}: resourceVersion {rv} is stale")))
            }
            _ => Ok(()),
        }
    }

    /// Remove `key` and, transitively, everything it owns. Owned objects that carry finalizers
    /// are only marked for deletion.
    fn remove_cascade(&mut self, key: &ObjectKey) {
        let mut work = vec![key.clone()];
        while let Some(k) = work.pop() {
            let Some(v) = self.objects.remove(&k) else { continue };
            let Some(uid) = meta_str(&v, "uid").map(str::to_string) else { continue };
            let dependents: Vec<ObjectKey> =
                self.objects.iter().filter(|(_, o)| owned_by(o, &uid)).map(|(k, _)| k.clone()).collect();
            for d in dependents {
                let finalized = self.objects.get(&d).is_some_and(has_finalizers);
                if finalized {
                    self.mark_deleting(&d);
                } else {
                    work.push(d);
                }
            }
        }
    }

    fn mark_deleting(&mut self, key: &ObjectKey) {
        let rv = self.next_rv();
        if let Some(v) = self.objects.get_mut(key) {
            with_meta(v, |m| {
                m.entry("deletionTimestamp").or_insert_with(|| Value::String(now_rfc3339()));
                m.insert("resourceVersion".into(), Value::String(rv));
            });
        }
    }

    /// A deleting object whose last finalizer was just dropped goes away.
    fn release_if_finalized(&mut self, key: &ObjectKey) {
        let gone = self
            .objects
            .get(key)
            .is_some_and(|v| meta(v).is_some_and(|m| m.contains_key("deletionTimestamp")) && !has_finalizers(v));
        if gone {
            self.remove_cascade(key);
        }
    }

    fn fill_identity(&mut self, v: &mut Value) {
        let rv = self.next_rv();
        with_meta(v, |m| {
            m.entry("uid").or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
            m.entry("creationTimestamp").or_insert_with(|| Value::String(now_rfc3339()));
            m.entry("generation").or_insert(Value::from(1i64));
            m.insert("resourceVersion".into(), Value::String(rv));
        });
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert or overwrite an object as an external actor would; status is kept and nothing is
    /// logged.
    pub fn seed_dynamic(&self, obj: &DynamicObject) -> Result<ObjectKey, StoreError> {
        let key = ObjectKey::of(obj)?;
        let mut v = encode(obj)?;
        let mut inner = self.lock();
        inner.fill_identity(&mut v);
        inner.objects.insert(key.clone(), v);
        Ok(key)
    }

    pub fn seed<K>(&self, obj: &K) -> Result<ObjectKey, StoreError>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        self.seed_dynamic(&to_dynamic(obj)?)
    }

    /// Overwrite the status of a stored object (an external controller reporting progress).
    pub fn set_status(&self, key: &ObjectKey, status: Value) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let rv = inner.next_rv();
        let v = inner.objects.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        v["status"] = status;
        with_meta(v, |m| m.insert("resourceVersion".into(), Value::String(rv)));
        Ok(())
    }

    /// Drop an object without cascade or logging.
    pub fn remove(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.remove(key).and_then(|v| decode(&v).ok())
    }

    pub fn typed<K>(&self, namespace: Option<&str>, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + serde::de::DeserializeOwned,
    {
        let key = ObjectKey::for_kind::<K>(namespace, name);
        let v = self.lock().objects.get(&key).cloned()?;
        decode(&v).ok().and_then(|d| from_dynamic(&d).ok())
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Fail every spec write and delete of `key` with an API error from now on. Status writes
    /// still go through.
    pub fn reject(&self, key: ObjectKey) {
        self.lock().rejected.insert(key);
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.lock().log.clone()
    }

    pub fn take_ops(&self) -> Vec<StoreOp> {
        std::mem::take(&mut self.lock().log)
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        let inner = self.lock();
        inner.objects.get(key).map(decode).transpose()
    }

    async fn list(
        &self,
        ty: &Kind,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let inner = self.lock();
        let mut out = Vec::new();
        for (k, v) in inner.objects.iter() {
            if &k.ty != ty || (namespace.is_some() && k.namespace.as_deref() != namespace) {
                continue;
            }
            let obj = decode(v)?;
            if labels_match(obj.metadata.labels.as_ref(), selector) {
                out.push(obj);
            }
        }
        Ok(out)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(obj)?;
        let mut v = encode(obj)?;
        let mut inner = self.lock();
        inner.admit(&key)?;
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        if let Some(m) = v.as_object_mut() {
            m.remove("status");
        }
        with_meta(&mut v, |m| {
            m.remove("deletionTimestamp");
            m.remove("resourceVersion");
            m.insert("generation".into(), Value::from(1i64));
        });
        inner.fill_identity(&mut v);
        inner.objects.insert(key.clone(), v.clone());
        inner.log.push(StoreOp { verb: Verb::Create, key });
        decode(&v)
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(obj)?;
        let mut inner = self.lock();
        inner.admit(&key)?;
        inner.check_rv(&key, obj.metadata.resource_version.as_deref())?;
        let old = inner.existing(&key)?.clone();
        let mut v = encode(obj)?;
        match old.get("status") {
            Some(st) => v["status"] = st.clone(),
            None => {
                if let Some(m) = v.as_object_mut() {
                    m.remove("status");
                }
            }
        }
        let bump = spec_part(&old) != spec_part(&v);
        let old_meta = meta(&old).cloned().unwrap_or_default();
        let rv = inner.next_rv();
        with_meta(&mut v, |m| {
            for f in ["uid", "creationTimestamp", "deletionTimestamp"] {
                match old_meta.get(f) {
                    Some(x) => m.insert(f.to_string(), x.clone()),
                    None => m.remove(f),
                };
            }
            let gen = old_meta.get("generation").and_then(Value::as_i64).unwrap_or(1);
            m.insert("generation".into(), Value::from(if bump { gen + 1 } else { gen }));
            m.insert("resourceVersion".into(), Value::String(rv));
        });
        inner.objects.insert(key.clone(), v.clone());
        inner.log.push(StoreOp { verb: Verb::Replace, key: key.clone() });
        inner.release_if_finalized(&key);
        decode(&v)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        inner.admit(key)?;
        let wanted = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        inner.check_rv(key, wanted)?;
        let old = inner.existing(key)?.clone();
        let mut p = patch.clone();
        if let Some(m) = p.as_object_mut() {
            m.remove("status");
            if let Some(Value::Object(pm)) = m.get_mut("metadata") {
                for f in ["uid", "resourceVersion", "creationTimestamp", "deletionTimestamp", "generation"] {
                    pm.remove(f);
                }
            }
        }
        let mut v = old.clone();
        apply_merge_patch(&mut v, &p);
        let bump = spec_part(&old) != spec_part(&v);
        let rv = inner.next_rv();
        with_meta(&mut v, |m| {
            if bump {
                let gen = m.get("generation").and_then(Value::as_i64).unwrap_or(1);
                m.insert("generation".into(), Value::from(gen + 1));
            }
            m.insert("resourceVersion".into(), Value::String(rv));
        });
        inner.objects.insert(key.clone(), v.clone());
        inner.log.push(StoreOp { verb: Verb::Patch, key: key.clone() });
        inner.release_if_finalized(key);
        decode(&v)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        let mut v = inner.existing(key)?.clone();
        if let Some(st) = patch.get("status") {
            let mut cur = v.get("status").cloned().unwrap_or(Value::Null);
            apply_merge_patch(&mut cur, st);
            v["status"] = cur;
        }
        let rv = inner.next_rv();
        with_meta(&mut v, |m| m.insert("resourceVersion".into(), Value::String(rv)));
        inner.objects.insert(key.clone(), v.clone());
        inner.log.push(StoreOp { verb: Verb::PatchStatus, key: key.clone() });
        decode(&v)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.admit(key)?;
        let v = inner.existing(key)?;
        let finalized = has_finalizers(v);
        inner.log.push(StoreOp { verb: Verb::Delete, key: key.clone() });
        if finalized {
            inner.mark_deleting(key);
        } else {
            inner.remove_cascade(key);
        }
        Ok(())
    }
}
