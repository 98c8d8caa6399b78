//! Trellis apply: walks a built graph against the store, dependencies first.
//!
//! Per-action semantics:
//! - create: "already exists" counts as success
//! - update / patch: "not found" counts as success
//! - delete: the root only loses its finalizer; anything else is deleted with background cascade
//! - status: merge patch against the pristine snapshot, then one event per real change

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kube::core::DynamicObject;
use metrics::{counter, histogram};
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};
use trellis_core::conditions::{set_condition, Condition};
use trellis_core::labels::CLUSTER_FINALIZER;
use trellis_core::{Error, Result};
use trellis_graph::{Action, Dag, Vertex};
use trellis_kubehub::{EventRecord, EventSink, ObjectKey, ObjectStore};

mod diff;
mod events;

pub use diff::{diff_summary, merge_patch, strip_noisy, DiffSummary};
pub use events::{status_events, StatusEvent};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Vertices visited, noops included.
    pub visited: usize,
    /// Store writes issued.
    pub writes: usize,
    pub events: usize,
}

pub struct Executor {
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventSink>,
}

fn status_of(obj: Option<&DynamicObject>) -> Json {
    obj.and_then(|o| o.data.get("status")).cloned().unwrap_or(Json::Null)
}

/// Intent-only JSON of an object: type meta, metadata minus server fields, spec-like fields.
fn intent(obj: &DynamicObject) -> Result<Json> {
    Ok(strip_noisy(serde_json::to_value(obj)?))
}

impl Executor {
    pub fn new(store: Arc<dyn ObjectStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Apply every vertex, stopping at the first failure. Vertices applied before the failure
    /// stay applied.
    pub async fn execute(&self, dag: &Dag) -> Result<ApplyReport> {
        let t0 = Instant::now();
        let tally = std::sync::Mutex::new(ApplyReport::default());
        let tally_ref = &tally;
        let walked = dag
            .walk_reverse_topo_async(|v| async move {
                let (writes, events) = self.apply_vertex(v).await?;
                if let Ok(mut r) = tally_ref.lock() {
                    r.writes += writes;
                    r.events += events;
                }
                Ok::<(), Error>(())
            })
            .await;
        let mut report = tally.into_inner().unwrap_or_default();
        match walked {
            Ok(n) => {
                report.visited = n;
                histogram!("trellis_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
                debug!(visited = n, writes = report.writes, "graph applied");
                Ok(report)
            }
            Err(e) => {
                counter!("trellis_apply_err", 1u64);
                warn!(vertex = %e.vertex, applied = e.visited, error = %e.source, "apply stopped");
                Err(e.source)
            }
        }
    }

    /// Returns (store writes, events emitted).
    async fn apply_vertex(&self, v: &Vertex) -> Result<(usize, usize)> {
        let key = v.key();
        let out = match v.action() {
            Action::Noop => return Ok((0, 0)),
            Action::Create => self.create(v).await.map(|_| (1, 0)),
            Action::Update => self.update(v).await.map(|w| (w, 0)),
            Action::Patch => self.patch(v).await.map(|w| (w, 0)),
            Action::Delete => self.delete(v).await.map(|w| (w, 0)),
            Action::Status => self.status(v).await,
        };
        counter!("trellis_apply_total", 1u64, "action" => v.action().as_str());
        match &out {
            Ok((w, _)) if *w > 0 => info!(action = %v.action(), object = %key, "applied"),
            Ok(_) => debug!(action = %v.action(), object = %key, "nothing to write"),
            Err(e) => warn!(action = %v.action(), object = %key, error = %e, "apply failed"),
        }
        out
    }

    async fn create(&self, v: &Vertex) -> Result<()> {
        let obj = desired(v)?;
        match self.store.create(obj).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!(object = %v.key(), "already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, v: &Vertex) -> Result<usize> {
        let obj = desired(v)?;
        if let Some(old) = v.old() {
            let summary = diff_summary(&intent(obj)?, &intent(old)?);
            if summary.is_empty() {
                return Ok(0);
            }
            debug!(object = %v.key(), adds = summary.adds, updates = summary.updates, removes = summary.removes, "update");
        }
        let mut obj = obj.clone();
        if obj.metadata.resource_version.is_none() {
            obj.metadata.resource_version = v.old().and_then(|o| o.metadata.resource_version.clone());
        }
        match self.store.replace(&obj).await {
            Ok(_) => Ok(1),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch(&self, v: &Vertex) -> Result<usize> {
        let obj = desired(v)?;
        let base = match v.old() {
            Some(old) => intent(old)?,
            None => Json::Object(Default::default()),
        };
        let Some(patch) = merge_patch(&base, &intent(obj)?) else { return Ok(0) };
        match self.store.patch(v.key(), &patch).await {
            Ok(_) => Ok(1),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, v: &Vertex) -> Result<usize> {
        if v.is_root() {
            let finalizers = v.old().and_then(|o| o.metadata.finalizers.clone()).unwrap_or_default();
            if !finalizers.iter().any(|f| f == CLUSTER_FINALIZER) {
                return Ok(0);
            }
            let rest: Vec<String> = finalizers.into_iter().filter(|f| f != CLUSTER_FINALIZER).collect();
            let patch = json!({"metadata": {"finalizers": if rest.is_empty() { Json::Null } else { json!(rest) }}});
            return match self.store.patch(v.key(), &patch).await {
                Ok(_) => Ok(1),
                Err(e) if e.is_not_found() => Ok(0),
                Err(e) => Err(e.into()),
            };
        }
        match self.store.delete(v.key()).await {
            Ok(()) => Ok(1),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self, v: &Vertex) -> Result<(usize, usize)> {
        let old = status_of(v.old());
        let new = status_of(v.obj());
        let Some(patch) = merge_patch(&old, &new) else { return Ok((0, 0)) };
        let stored = match self.store.patch_status(v.key(), &json!({ "status": patch })).await {
            Ok(o) => o,
            Err(e) if e.is_not_found() => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };
        let emitted = self.emit(v.key(), stored.metadata.uid.clone(), &old, &new).await;
        Ok((1, emitted))
    }

    async fn emit(&self, key: &ObjectKey, uid: Option<String>, old: &Json, new: &Json) -> usize {
        let mut n = 0;
        for ev in status_events(old, new) {
            let rec = EventRecord { kind: ev.kind, reason: ev.reason, message: ev.message, object: key.clone(), uid: uid.clone() };
            match self.events.publish(rec).await {
                Ok(()) => n += 1,
                Err(e) => warn!(object = %key, error = %e, "event not published"),
            }
        }
        n
    }

    /// Merge `conds` into the pristine root's conditions and write them through the status
    /// subresource. Used for failures recorded outside the graph walk. Returns whether anything
    /// was written.
    pub async fn record_conditions(&self, pristine: &DynamicObject, conds: Vec<Condition>) -> Result<bool> {
        let key = ObjectKey::of(pristine)?;
        let old = status_of(Some(pristine));
        let mut current: Vec<Condition> =
            old.get("conditions").cloned().map(serde_json::from_value).transpose()?.unwrap_or_default();
        let mut changed = false;
        for c in conds {
            changed |= set_condition(&mut current, c);
        }
        if !changed {
            return Ok(false);
        }
        let mut new = if old.is_object() { old.clone() } else { json!({}) };
        new["conditions"] = serde_json::to_value(&current)?;
        match self.store.patch_status(&key, &json!({"status": {"conditions": current}})).await {
            Ok(stored) => {
                self.emit(&key, stored.metadata.uid.clone(), &old, &new).await;
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn desired(v: &Vertex) -> Result<&DynamicObject> {
    v.obj().ok_or_else(|| Error::Graph(format!("{v} has no desired object")))
}
