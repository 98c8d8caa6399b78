//! Trellis graph: the per-pass set of staged mutations and their ordering.
//!
//! `depend_on(a, b)` reads "a depends on b": b is visited before a. Edges that would close a
//! cycle are refused when added, so a built graph is always walkable.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;

use kube::core::DynamicObject;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, trace};
use trellis_kubehub::ObjectKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle through {0}")]
    Cycle(String),
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl From<GraphError> for trellis_core::Error {
    fn from(e: GraphError) -> Self {
        trellis_core::Error::Graph(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Action {
    Create,
    Update,
    Patch,
    Delete,
    Status,
    Noop,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::Status => "status",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status writes go through their own subresource, so one object may carry an object vertex and
/// a status vertex in the same pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Slot {
    Object,
    Status,
}

/// One staged mutation. Built through the action constructors so that every non-noop vertex
/// carries a desired object and every delete carries the observed one.
#[derive(Debug, Clone)]
pub struct Vertex {
    key: ObjectKey,
    obj: Option<DynamicObject>,
    old: Option<DynamicObject>,
    action: Action,
    root: bool,
}

impl Vertex {
    fn build(action: Action, obj: Option<DynamicObject>, old: Option<DynamicObject>) -> Result<Self, GraphError> {
        let src = obj.as_ref().or(old.as_ref()).ok_or_else(|| GraphError::Invalid(format!("{action} vertex without object")))?;
        let key = ObjectKey::of(src).map_err(|e| GraphError::Invalid(e.to_string()))?;
        Ok(Self { key, obj, old, action, root: false })
    }

    pub fn create(obj: DynamicObject) -> Result<Self, GraphError> {
        Self::build(Action::Create, Some(obj), None)
    }

    /// Full replace of `old` by `obj`.
    pub fn update(obj: DynamicObject, old: DynamicObject) -> Result<Self, GraphError> {
        Self::build(Action::Update, Some(obj), Some(old))
    }

    /// Merge patch computed from `old` to `obj`.
    pub fn patch(obj: DynamicObject, old: DynamicObject) -> Result<Self, GraphError> {
        Self::build(Action::Patch, Some(obj), Some(old))
    }

    pub fn delete(old: DynamicObject) -> Result<Self, GraphError> {
        Self::build(Action::Delete, None, Some(old))
    }

    /// Status write of `obj`, diffed against the pristine `old`.
    pub fn status(obj: DynamicObject, old: DynamicObject) -> Result<Self, GraphError> {
        Self::build(Action::Status, Some(obj), Some(old))
    }

    /// Ordering anchor: the object stays as it is.
    pub fn noop(obj: DynamicObject) -> Result<Self, GraphError> {
        Self::build(Action::Noop, Some(obj.clone()), Some(obj))
    }

    pub fn mark_root(mut self) -> Self {
        self.root = true;
        self
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn obj(&self) -> Option<&DynamicObject> {
        self.obj.as_ref()
    }

    /// Desired object, editable by later transformers.
    pub fn obj_mut(&mut self) -> Option<&mut DynamicObject> {
        self.obj.as_mut()
    }

    pub fn old(&self) -> Option<&DynamicObject> {
        self.old.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn slot(&self) -> Slot {
        if self.action == Action::Status { Slot::Status } else { Slot::Object }
    }

    /// Turn an update/patch into a noop once a later stage finds nothing to change.
    pub fn demote_to_noop(&mut self) {
        if matches!(self.action, Action::Update | Action::Patch) {
            self.action = Action::Noop;
        }
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(NodeIndex);

/// Walk stopped at `vertex` after `visited` successful visits.
#[derive(Debug)]
pub struct WalkError<E> {
    pub visited: usize,
    pub vertex: String,
    pub source: E,
}

impl<E: fmt::Display> fmt::Display for WalkError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed after {} vertices: {}", self.vertex, self.visited, self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VertexSummary {
    pub key: String,
    pub action: Action,
    pub depends_on: Vec<String>,
}

/// Staged mutations plus must-apply-before edges. An edge `a -> b` in the underlying graph means
/// a depends on b.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    graph: DiGraph<Vertex, ()>,
    index: FxHashMap<(ObjectKey, Slot), NodeIndex>,
    root: Option<NodeIndex>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Stage a vertex. Staging the same object (and slot) twice replaces the earlier vertex but
    /// keeps its edges.
    pub fn add_vertex(&mut self, v: Vertex) -> VertexId {
        let slot = (v.key.clone(), v.slot());
        let is_root = v.root;
        let idx = match self.index.get(&slot) {
            Some(&idx) => {
                debug!(vertex = %v, "restaged");
                self.graph[idx] = v;
                idx
            }
            None => {
                trace!(vertex = %v, "staged");
                let idx = self.graph.add_node(v);
                self.index.insert(slot, idx);
                idx
            }
        };
        if is_root && self.root.is_none() {
            self.root = Some(idx);
        }
        VertexId(idx)
    }

    /// `a` depends on `b`; refused when it would close a cycle.
    pub fn depend_on(&mut self, a: VertexId, b: VertexId) -> Result<(), GraphError> {
        if a == b || has_path_connecting(&self.graph, b.0, a.0, None) {
            return Err(GraphError::Cycle(format!("{} <-> {}", self.graph[a.0], self.graph[b.0])));
        }
        if self.graph.find_edge(a.0, b.0).is_none() {
            self.graph.add_edge(a.0, b.0, ());
        }
        Ok(())
    }

    /// `a` depends on every other vertex currently staged.
    pub fn depend_on_all(&mut self, a: VertexId) -> Result<(), GraphError> {
        let others: Vec<NodeIndex> = self.graph.node_indices().filter(|&i| i != a.0).collect();
        for b in others {
            self.depend_on(a, VertexId(b))?;
        }
        Ok(())
    }

    pub fn find(&self, key: &ObjectKey) -> Option<VertexId> {
        self.index.get(&(key.clone(), Slot::Object)).copied().map(VertexId)
    }

    pub fn find_status(&self, key: &ObjectKey) -> Option<VertexId> {
        self.index.get(&(key.clone(), Slot::Status)).copied().map(VertexId)
    }

    pub fn root(&self) -> Option<VertexId> {
        self.root.map(VertexId)
    }

    pub fn get(&self, id: VertexId) -> &Vertex {
        &self.graph[id.0]
    }

    pub fn get_mut(&mut self, id: VertexId) -> &mut Vertex {
        &mut self.graph[id.0]
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.graph.node_weights()
    }

    /// Vertices whose kind matches `kind`, in staging order.
    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = (VertexId, &'a Vertex)> + 'a {
        self.graph.node_indices().filter(move |&i| self.graph[i].key.ty.kind == kind).map(|i| (VertexId(i), &self.graph[i]))
    }

    /// Any vertex that would write to the store.
    pub fn has_changes(&self) -> bool {
        self.graph.node_weights().any(|v| v.action != Action::Noop)
    }

    /// Dependencies-first order; ties are broken by staging order so the walk is reproducible.
    pub fn order(&self) -> Result<Vec<VertexId>, GraphError> {
        let mut pending: FxHashMap<NodeIndex, usize> = FxHashMap::default();
        let mut ready = BTreeSet::new();
        for i in self.graph.node_indices() {
            let deps = self.graph.neighbors_directed(i, Direction::Outgoing).count();
            if deps == 0 {
                ready.insert(i);
            } else {
                pending.insert(i, deps);
            }
        }
        let mut out = Vec::with_capacity(self.graph.node_count());
        while let Some(i) = ready.pop_first() {
            out.push(VertexId(i));
            for dependent in self.graph.neighbors_directed(i, Direction::Incoming) {
                if let Some(n) = pending.get_mut(&dependent) {
                    *n -= 1;
                    if *n == 0 {
                        pending.remove(&dependent);
                        ready.insert(dependent);
                    }
                }
            }
        }
        if let Some(stuck) = pending.keys().min() {
            return Err(GraphError::Cycle(self.graph[*stuck].to_string()));
        }
        Ok(out)
    }

    /// Visit every vertex once, dependencies first, stopping at the first error.
    pub fn walk_reverse_topo<E>(&self, mut visit: impl FnMut(&Vertex) -> Result<(), E>) -> Result<usize, WalkError<E>>
    where
        E: From<GraphError>,
    {
        let order = self.order().map_err(|e| WalkError { visited: 0, vertex: String::new(), source: e.into() })?;
        for (n, id) in order.iter().enumerate() {
            let v = &self.graph[id.0];
            visit(v).map_err(|source| WalkError { visited: n, vertex: v.to_string(), source })?;
        }
        Ok(order.len())
    }

    /// Async counterpart of [`Dag::walk_reverse_topo`]; vertices are visited one at a time.
    pub async fn walk_reverse_topo_async<'a, E, F, Fut>(&'a self, mut visit: F) -> Result<usize, WalkError<E>>
    where
        E: From<GraphError>,
        F: FnMut(&'a Vertex) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let order = self.order().map_err(|e| WalkError { visited: 0, vertex: String::new(), source: e.into() })?;
        for (n, id) in order.iter().enumerate() {
            let v = &self.graph[id.0];
            visit(v).await.map_err(|source| WalkError { visited: n, vertex: v.to_string(), source })?;
        }
        Ok(order.len())
    }

    /// Serializable view in walk order.
    pub fn summary(&self) -> Result<Vec<VertexSummary>, GraphError> {
        Ok(self
            .order()?
            .into_iter()
            .map(|id| {
                let v = &self.graph[id.0];
                VertexSummary {
                    key: v.key.to_string(),
                    action: v.action,
                    depends_on: self
                        .graph
                        .neighbors_directed(id.0, Direction::Outgoing)
                        .map(|d| self.graph[d].key.to_string())
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect(),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use trellis_kubehub::to_dynamic;

    fn obj(name: &str) -> DynamicObject {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.into());
        cm.metadata.namespace = Some("ns".into());
        to_dynamic(&cm).unwrap()
    }

    fn names(dag: &Dag) -> Vec<String> {
        dag.order().unwrap().into_iter().map(|id| dag.get(id).key().name.clone()).collect()
    }

    #[test]
    fn dependencies_come_first_and_ties_follow_staging_order() {
        let mut dag = Dag::new();
        let a = dag.add_vertex(Vertex::create(obj("a")).unwrap());
        let b = dag.add_vertex(Vertex::create(obj("b")).unwrap());
        let c = dag.add_vertex(Vertex::create(obj("c")).unwrap());
        let d = dag.add_vertex(Vertex::create(obj("d")).unwrap());
        dag.depend_on(a, b).unwrap();
        dag.depend_on(b, c).unwrap();
        assert_eq!(names(&dag), vec!["c", "b", "a", "d"]);
        dag.depend_on(c, d).unwrap();
        assert_eq!(names(&dag), vec!["d", "c", "b", "a"]);
    }

    #[test]
    fn cycle_is_refused_when_edge_is_added() {
        let mut dag = Dag::new();
        let a = dag.add_vertex(Vertex::create(obj("a")).unwrap());
        let b = dag.add_vertex(Vertex::create(obj("b")).unwrap());
        let c = dag.add_vertex(Vertex::create(obj("c")).unwrap());
        dag.depend_on(a, b).unwrap();
        dag.depend_on(b, c).unwrap();
        assert!(matches!(dag.depend_on(c, a), Err(GraphError::Cycle(_))));
        assert!(matches!(dag.depend_on(a, a), Err(GraphError::Cycle(_))));
        assert_eq!(dag.order().unwrap().len(), 3);
    }

    #[test]
    fn walk_stops_at_first_error_with_partial_count() {
        let mut dag = Dag::new();
        let a = dag.add_vertex(Vertex::create(obj("a")).unwrap());
        let b = dag.add_vertex(Vertex::create(obj("b")).unwrap());
        let c = dag.add_vertex(Vertex::create(obj("c")).unwrap());
        dag.depend_on(a, b).unwrap();
        dag.depend_on(b, c).unwrap();
        let mut seen = vec![];
        let err = dag
            .walk_reverse_topo(|v| {
                seen.push(v.key().name.clone());
                if v.key().name == "b" { Err(GraphError::Invalid("boom".into())) } else { Ok(()) }
            })
            .unwrap_err();
        assert_eq!(err.visited, 1);
        assert_eq!(seen, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn async_walk_visits_each_vertex_once() {
        let mut dag = Dag::new();
        for n in ["x", "y", "z"] {
            dag.add_vertex(Vertex::create(obj(n)).unwrap());
        }
        let visited = std::sync::Mutex::new(Vec::new());
        let n = dag
            .walk_reverse_topo_async(|v| {
                visited.lock().unwrap().push(v.key().name.clone());
                async { Ok::<(), GraphError>(()) }
            })
            .await
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(visited.into_inner().unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn restaging_replaces_vertex_and_keeps_edges() {
        let mut dag = Dag::new();
        let a = dag.add_vertex(Vertex::create(obj("a")).unwrap());
        let b = dag.add_vertex(Vertex::create(obj("b")).unwrap());
        dag.depend_on(a, b).unwrap();
        let a2 = dag.add_vertex(Vertex::noop(obj("a")).unwrap());
        assert_eq!(a, a2);
        assert_eq!(dag.len(), 2);
        assert_eq!(dag.get(a).action(), Action::Noop);
        assert!(dag.has_changes());
        let s = dag.summary().unwrap();
        assert_eq!(s[1].depends_on, vec!["ConfigMap/ns/b".to_string()]);
    }

    #[test]
    fn status_vertex_can_depend_on_everything() {
        let mut dag = Dag::new();
        let a = dag.add_vertex(Vertex::create(obj("a")).unwrap());
        let root = obj("root");
        let st = dag.add_vertex(Vertex::status(root.clone(), root).unwrap());
        dag.add_vertex(Vertex::create(obj("b")).unwrap());
        dag.depend_on_all(st).unwrap();
        assert_eq!(names(&dag).last().map(String::as_str), Some("root"));
        let _ = a;
    }

    #[test]
    fn delete_requires_observed_object() {
        let v = Vertex::delete(obj("gone")).unwrap();
        assert!(v.obj().is_none());
        assert!(v.old().is_some());
        assert_eq!(v.action(), Action::Delete);
    }
}
