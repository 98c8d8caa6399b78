//! Per-pass transform context and the injected services it is built from.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::DynamicObject;
use kube::Resource;
use trellis_cache::{ComponentRef, HostPortAllocator, PendingSecrets};
use trellis_core::api::cluster::{Cluster, ComponentSpec};
use trellis_core::api::definition::{ClusterDefinition, ClusterTopology, ComponentDefinition};
use trellis_core::labels::{self, LABEL_SHARDING};
use trellis_core::{Capabilities, Config, Outcome};
use trellis_graph::VertexId;
use trellis_kubehub::{EventSink, ObjectStore, StoreReader};
use trellis_ops::SidecarOps;

/// Long-lived collaborators shared by every pass.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn ObjectStore>,
    pub events: Arc<dyn EventSink>,
    pub ops: Arc<dyn SidecarOps>,
    pub secrets: Arc<PendingSecrets>,
    pub ports: Arc<HostPortAllocator>,
    pub config: Arc<Config>,
}

impl Services {
    pub fn new(store: Arc<dyn ObjectStore>, events: Arc<dyn EventSink>, ops: Arc<dyn SidecarOps>, config: Config) -> Self {
        Self {
            store,
            events,
            ops,
            secrets: Arc::new(PendingSecrets::new()),
            ports: Arc::new(HostPortAllocator::new(config.host_port_range)),
            config: Arc::new(config),
        }
    }
}

/// One consolidated component: declared directly or expanded from a sharding.
#[derive(Debug, Clone)]
pub struct Component {
    pub name: String,
    pub sharding: Option<String>,
    pub spec: ComponentSpec,
    pub def: ComponentDefinition,
}

impl Component {
    pub fn def_name(&self) -> &str {
        self.def.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.def.spec.workload_kind.capabilities()
    }

    pub fn desired_replicas(&self) -> i32 {
        self.spec.desired_replicas()
    }
}

/// What the scale step decided for a component's workload this pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScaleDecision {
    /// Replica count to write; lags the desired count while a data clone runs.
    pub replicas: i32,
    /// Offline instances to write; held at the observed list while replicas are held.
    pub offline: Vec<String>,
    /// Pods still waiting for member join; written to the workload annotation.
    pub join_pending: BTreeSet<String>,
    /// Vertices that must wait for the workload write (volume and clone cleanup).
    pub after_workload: Vec<VertexId>,
}

/// Everything one reconciliation pass knows. Built by the plan builder, consumed by the chain,
/// dropped when the pass ends.
pub struct TransformContext {
    /// The root being built; transformers edit metadata and status here.
    pub cluster: Cluster,
    /// The root as loaded; never edited.
    pub pristine: Cluster,
    pub pristine_obj: DynamicObject,
    pub reader: StoreReader,
    pub config: Arc<Config>,
    pub ops: Arc<dyn SidecarOps>,
    pub secrets: Arc<PendingSecrets>,
    pub ports: Arc<HostPortAllocator>,
    pub cluster_def: Option<ClusterDefinition>,
    pub topology: Option<ClusterTopology>,
    pub components: Vec<Component>,
    /// (component, account) -> password, filled by the account step.
    pub credentials: BTreeMap<(String, String), String>,
    /// (component, container, port name) -> host port, filled by the vars step.
    pub host_ports: BTreeMap<(String, String, String), u16>,
    pub scale: BTreeMap<String, ScaleDecision>,
    /// Components whose data clone backup or restore failed.
    pub clone_failed: BTreeSet<String>,
    pub now: DateTime<Utc>,
    outcome: Outcome,
    halted: bool,
}

impl TransformContext {
    pub fn new(cluster: Cluster, pristine_obj: DynamicObject, services: &Services) -> Self {
        Self {
            pristine: cluster.clone(),
            cluster,
            pristine_obj,
            reader: StoreReader::new(services.store.clone()),
            config: services.config.clone(),
            ops: services.ops.clone(),
            secrets: services.secrets.clone(),
            ports: services.ports.clone(),
            cluster_def: None,
            topology: None,
            components: Vec::new(),
            credentials: BTreeMap::new(),
            host_ports: BTreeMap::new(),
            scale: BTreeMap::new(),
            clone_failed: BTreeSet::new(),
            now: Utc::now(),
            outcome: Outcome::Settled,
            halted: false,
        }
    }

    pub fn namespace(&self) -> &str {
        self.cluster.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn name(&self) -> &str {
        self.cluster.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn generation(&self) -> Option<i64> {
        self.pristine.metadata.generation
    }

    pub fn is_deleting(&self) -> bool {
        self.pristine.is_deleting()
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn component_ref(&self, comp: &str) -> ComponentRef {
        ComponentRef::new(self.namespace(), self.name(), comp)
    }

    pub fn workload_name(&self, comp: &str) -> String {
        labels::workload_name(self.name(), comp)
    }

    /// Ask for another pass after `after` without failing this one.
    pub fn requeue(&mut self, after: Duration, reason: impl Into<String>) {
        let o = std::mem::replace(&mut self.outcome, Outcome::Settled);
        self.outcome = o.merge(Outcome::requeue(after, reason));
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Stop the chain after the current transformer.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn owner_ref(&self) -> Option<OwnerReference> {
        let uid = self.pristine.metadata.uid.clone()?;
        Some(OwnerReference {
            api_version: Cluster::api_version(&()).into_owned(),
            kind: Cluster::kind(&()).into_owned(),
            name: self.name().to_string(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    /// Metadata for an object owned by the cluster, labelled for `comp` when given.
    pub fn owned_meta(&self, name: impl Into<String>, comp: Option<&Component>) -> ObjectMeta {
        let mut l = match comp {
            Some(c) => labels::component_labels(self.name(), &c.name),
            None => labels::cluster_labels(self.name()),
        };
        if let Some(sharding) = comp.and_then(|c| c.sharding.as_ref()) {
            l.insert(LABEL_SHARDING.to_string(), sharding.clone());
        }
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some(self.namespace().to_string()),
            labels: Some(l),
            owner_references: self.owner_ref().map(|r| vec![r]),
            ..Default::default()
        }
    }

    pub fn into_outcome(self) -> Outcome {
        self.outcome
    }
}
