//! Staging helpers shared by the transformers: desired vs observed, merged and diffed.

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;
use trellis_apply::{merge_patch, strip_noisy};
use trellis_core::Result;
use trellis_graph::{Action, Dag, Vertex, VertexId};
use trellis_kubehub::{from_dynamic, to_dynamic, Kind, StoreReader};

pub(crate) fn dynamic<K>(obj: &K) -> Result<DynamicObject>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    Ok(to_dynamic(obj)?)
}

pub(crate) fn typed<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(from_dynamic(obj)?)
}

/// Observed object with the desired one laid over it: labels and annotations are added to
/// (never dropped), owner references are set when missing, every top-level body field the
/// desired object carries replaces the observed one.
pub(crate) fn overlay(observed: &DynamicObject, desired: DynamicObject) -> DynamicObject {
    let mut out = observed.clone();
    extend_map(&mut out.metadata.labels, desired.metadata.labels);
    extend_map(&mut out.metadata.annotations, desired.metadata.annotations);
    if out.metadata.owner_references.is_none() {
        out.metadata.owner_references = desired.metadata.owner_references;
    }
    if let (Some(o), Json::Object(d)) = (out.data.as_object_mut(), desired.data) {
        for (k, v) in d {
            if k != "status" {
                o.insert(k, v);
            }
        }
    }
    out
}

fn extend_map(into: &mut Option<BTreeMap<String, String>>, from: Option<BTreeMap<String, String>>) {
    match from {
        Some(from) if !from.is_empty() => into.get_or_insert_with(BTreeMap::new).extend(from),
        _ => {}
    }
}

/// The merged object differs from what the store holds, on intent fields.
pub(crate) fn differs(observed: &DynamicObject, merged: &DynamicObject) -> Result<bool> {
    let a = strip_noisy(serde_json::to_value(observed)?);
    let b = strip_noisy(serde_json::to_value(merged)?);
    Ok(merge_patch(&a, &b).is_some())
}

/// Create when nothing is observed, otherwise overlay and stage `how` (update or patch), or a
/// noop when nothing would change.
pub(crate) fn stage(dag: &mut Dag, desired: DynamicObject, observed: Option<DynamicObject>, how: Action) -> Result<VertexId> {
    match observed {
        None => Ok(dag.add_vertex(Vertex::create(desired)?)),
        Some(obs) => {
            let merged = overlay(&obs, desired);
            stage_merged(dag, merged, obs, how)
        }
    }
}

/// Like [`stage`] for an object the caller already merged.
pub(crate) fn stage_merged(dag: &mut Dag, merged: DynamicObject, observed: DynamicObject, how: Action) -> Result<VertexId> {
    let v = if !differs(&observed, &merged)? {
        Vertex::noop(observed)?
    } else if how == Action::Update {
        Vertex::update(merged, observed)?
    } else {
        Vertex::patch(merged, observed)?
    };
    Ok(dag.add_vertex(v))
}

pub(crate) fn stage_delete(dag: &mut Dag, observed: DynamicObject) -> Result<VertexId> {
    Ok(dag.add_vertex(Vertex::delete(observed)?))
}

/// Fetch the observed counterpart of `desired` (same kind, namespace and name).
pub(crate) async fn observed_of(reader: &StoreReader, desired: &DynamicObject) -> Result<Option<DynamicObject>> {
    let key = trellis_kubehub::ObjectKey::of(desired)?;
    Ok(reader.get_dynamic(&key).await?)
}

pub(crate) fn is_terminating(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// Objects of `ty` in `namespace` carrying every label of `selector`.
pub(crate) async fn list_owned(
    reader: &StoreReader,
    ty: &Kind,
    namespace: &str,
    selector: &BTreeMap<String, String>,
) -> Result<Vec<DynamicObject>> {
    Ok(reader.list_dynamic(ty, Some(namespace), selector).await?)
}

/// Chain `groups` in order: every vertex of group i+1 depends on every vertex of group i.
/// Names without a staged vertex are skipped.
pub(crate) fn order_groups(dag: &mut Dag, groups: &[Vec<String>], ids: &BTreeMap<String, Vec<VertexId>>) -> Result<()> {
    let staged: Vec<Vec<VertexId>> = groups
        .iter()
        .map(|g| g.iter().filter_map(|n| ids.get(n)).flatten().copied().collect::<Vec<_>>())
        .filter(|g| !g.is_empty())
        .collect();
    for pair in staged.windows(2) {
        for &later in &pair[1] {
            for &earlier in &pair[0] {
                dag.depend_on(later, earlier)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn cm(data: &[(&str, &str)], labels: &[(&str, &str)]) -> DynamicObject {
        let mut c = ConfigMap::default();
        c.metadata.name = Some("c-a-env".into());
        c.metadata.namespace = Some("ns".into());
        if !labels.is_empty() {
            c.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        }
        c.data = Some(data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        dynamic(&c).unwrap()
    }

    #[test]
    fn overlay_keeps_foreign_labels_and_replaces_body() {
        let observed = cm(&[("A", "1"), ("B", "2")], &[("team", "db")]);
        let desired = cm(&[("A", "9")], &[("app", "x")]);
        let merged = overlay(&observed, desired);
        let labels = merged.metadata.labels.clone().unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("db"));
        assert_eq!(labels.get("app").map(String::as_str), Some("x"));
        assert_eq!(merged.data["data"], serde_json::json!({"A": "9"}));
        assert!(differs(&observed, &merged).unwrap());
    }

    #[test]
    fn unchanged_object_stages_noop() {
        let observed = cm(&[("A", "1")], &[]);
        let mut dag = Dag::new();
        let id = stage(&mut dag, cm(&[("A", "1")], &[]), Some(observed), Action::Patch).unwrap();
        assert_eq!(dag.get(id).action(), Action::Noop);
        assert!(!dag.has_changes());
    }

    #[test]
    fn groups_chain_in_order() {
        let mut dag = Dag::new();
        let mut ids = BTreeMap::new();
        for n in ["a", "b", "c"] {
            let mut c = ConfigMap::default();
            c.metadata.name = Some(n.into());
            c.metadata.namespace = Some("ns".into());
            ids.insert(n.to_string(), vec![dag.add_vertex(Vertex::create(dynamic(&c).unwrap()).unwrap())]);
        }
        let groups = vec![vec!["c".to_string()], vec!["a".to_string(), "missing".to_string()], vec!["b".to_string()]];
        order_groups(&mut dag, &groups, &ids).unwrap();
        let order: Vec<String> = dag.order().unwrap().into_iter().map(|id| dag.get(id).key().name.clone()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }
}
