//! JSON merge-patch construction and change summaries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds + self.updates + self.removes == 0
    }
}

/// Drop server-populated fields so desired and observed objects compare on intent only.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for f in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "deletionTimestamp", "selfLink"] {
            meta.remove(f);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// RFC 7386 patch turning `base` into `target`; None when they are equal.
pub fn merge_patch(base: &Json, target: &Json) -> Option<Json> {
    match (base, target) {
        (Json::Object(b), Json::Object(t)) => {
            let mut out = Map::new();
            for (k, tv) in t {
                match b.get(k) {
                    Some(bv) => {
                        if let Some(d) = merge_patch(bv, tv) {
                            out.insert(k.clone(), d);
                        }
                    }
                    None if tv.is_null() => {}
                    None => {
                        out.insert(k.clone(), tv.clone());
                    }
                }
            }
            for k in b.keys() {
                if !t.contains_key(k) {
                    out.insert(k.clone(), Json::Null);
                }
            }
            (!out.is_empty()).then_some(Json::Object(out))
        }
        (b, t) if b == t => None,
        (_, t) => Some(t.clone()),
    }
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "managedFields": [{"foo": "bar"}],
                "resourceVersion": "123",
                "generation": 5,
                "uid": "u",
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": {"obs": true},
            "data": {"k": "v"}
        });
        let pruned = strip_noisy(v);
        assert_eq!(pruned, json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}, "data": {"k": "v"}}));
    }

    #[test]
    fn merge_patch_carries_only_changes() {
        let base = json!({"a": 1, "b": {"x": 1, "y": 2}, "c": [1, 2]});
        let target = json!({"a": 1, "b": {"x": 3, "y": 2}, "c": [1], "d": "new"});
        assert_eq!(merge_patch(&base, &target), Some(json!({"b": {"x": 3}, "c": [1], "d": "new"})));
        assert_eq!(merge_patch(&base, &base), None);
        assert_eq!(merge_patch(&json!({"a": 1, "z": 0}), &json!({"a": 1})), Some(json!({"z": null})));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert!(diff_summary(&base, &base).is_empty());
    }
}
