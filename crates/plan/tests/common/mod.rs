#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use trellis_core::labels::{component_labels, LABEL_ROLE};
use trellis_core::prelude::*;
use trellis_kubehub::{Kind, MemEvents, MemStore, ObjectKey, ObjectStore, Verb};
use trellis_ops::FakeOps;
use trellis_plan::{Plan, PlanBuilder, Services};

pub const NS: &str = "ns";
pub const CLUSTER: &str = "demo";

pub const MYSQL_DEF: &str = r#"
apiVersion: apps.trellis.io/v1
kind: ComponentDefinition
metadata:
  name: mysql-8
spec:
  serviceKind: mysql
  serviceVersion: "8.0.33"
  workloadKind: Replication
  runtime:
    containers:
      - name: mysql
        image: mysql:8.0.33
  releases:
    - serviceVersion: "8.0.33"
      images: { mysql: "mysql:8.0.33" }
  roles:
    - { name: primary, isLeader: true, votable: true }
    - { name: secondary }
  vars:
    - name: MYSQL_PODS
      valueFrom:
        componentRef: { field: PodNames }
    - name: MYSQL_ROOT_PASSWORD
      valueFrom:
        credentialRef: { account: root, key: Password }
  systemAccounts:
    - { name: root, initAccount: true }
  configTemplates:
    - name: my.cnf
      defaults: { max_connections: "100" }
  lifecycleActions: { switchover: true, memberJoin: true, memberLeave: true }
  dataClone: { backupMethod: xtrabackup }
status:
  phase: Available
"#;

pub const MYSQL_BPT: &str = r#"
apiVersion: dataprotection.trellis.io/v1
kind: BackupPolicyTemplate
metadata:
  name: mysql-bpt
  labels:
    apps.trellis.io/service-kind: mysql
spec:
  backupPolicies:
    - componentDefs: [mysql]
      targetRole: primary
      backupMethods:
        - name: xtrabackup
      schedules:
        - backupMethod: xtrabackup
"#;

pub const TOPOLOGY_DEF: &str = r#"
apiVersion: apps.trellis.io/v1
kind: ClusterDefinition
metadata:
  name: mysql-cluster
spec:
  topologies:
    - name: replication
      default: true
      components:
        - { name: mysql, compDef: mysql-8 }
        - { name: proxy, compDef: mysql-8 }
      orders:
        provision: ["mysql", "proxy"]
        terminate: ["proxy", "mysql"]
"#;

/// One `mysql` component on `mysql-8` with a 10Gi data volume.
pub fn cluster_yaml(replicas: i32, policy: &str) -> String {
    format!(
        r#"
apiVersion: apps.trellis.io/v1
kind: Cluster
metadata:
  name: demo
  namespace: ns
spec:
  terminationPolicy: {policy}
  componentSpecs:
    - name: mysql
      componentDef: mysql-8
      replicas: {replicas}
      volumeClaimTemplates:
        - name: data
          spec:
            accessModes: [ReadWriteOnce]
            resources:
              requests:
                storage: 10Gi
"#
    )
}

pub struct Harness {
    pub store: Arc<MemStore>,
    pub events: Arc<MemEvents>,
    pub ops: Arc<FakeOps>,
    pub services: Services,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_ops(FakeOps::new())
    }

    pub fn with_ops(ops: FakeOps) -> Self {
        let store = Arc::new(MemStore::new());
        let events = Arc::new(MemEvents::default());
        let ops = Arc::new(ops);
        let services = Services::new(store.clone(), events.clone(), ops.clone(), Config::default());
        Self { store, events, ops, services }
    }

    pub fn seed_yaml<K>(&self, yaml: &str)
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let obj: K = serde_yaml::from_str(yaml).expect("fixture parses");
        self.store.seed(&obj).expect("seed");
    }

    /// Same store and fakes, fresh in-process caches: what a controller restart looks like.
    pub fn restarted(&self) -> Self {
        let services = Services::new(self.store.clone(), self.events.clone(), self.ops.clone(), Config::default());
        Self { store: self.store.clone(), events: self.events.clone(), ops: self.ops.clone(), services }
    }

    pub async fn plan(&self) -> Result<Plan> {
        self.plan_for(CLUSTER).await
    }

    pub async fn plan_for(&self, cluster: &str) -> Result<Plan> {
        let mut b = PlanBuilder::new(self.services.clone(), NS, cluster);
        b.init().await?;
        b.validate().await?;
        b.build().await
    }

    pub async fn pass(&self) -> Result<Outcome> {
        self.plan().await?.execute().await
    }

    pub async fn pass_for(&self, cluster: &str) -> Result<Outcome> {
        self.plan_for(cluster).await?.execute().await
    }

    pub fn cluster(&self) -> Cluster {
        self.store.typed(Some(NS), CLUSTER).expect("cluster stored")
    }

    pub fn workload(&self, comp: &str) -> Option<InstanceSet> {
        self.store.typed(Some(NS), &format!("{CLUSTER}-{comp}"))
    }

    pub async fn patch_cluster(&self, patch: Value) {
        self.store.patch(&cluster_key(), &patch).await.expect("cluster patch");
    }

    pub fn set_phase<K: Resource<DynamicType = ()>>(&self, name: &str, phase: &str) {
        self.store.set_status(&ObjectKey::for_kind::<K>(Some(NS), name), json!({ "phase": phase })).expect("status");
    }

    /// Names of objects of kind `K` written with `verb`, in write order.
    pub fn written<K: Resource<DynamicType = ()>>(&self, verb: Verb) -> Vec<String> {
        let ty = Kind::of::<K>();
        self.store.ops().into_iter().filter(|o| o.verb == verb && o.key.ty == ty).map(|o| o.key.name).collect()
    }

    /// Position of the first write of `name` (kind `K`) with `verb` in the op log.
    pub fn position<K: Resource<DynamicType = ()>>(&self, verb: Verb, name: &str) -> Option<usize> {
        let ty = Kind::of::<K>();
        self.store.ops().iter().position(|o| o.verb == verb && o.key.ty == ty && o.key.name == name)
    }

    pub fn seed_pod(&self, name: &str, comp: &str, role: Option<&str>) {
        let mut labels = component_labels(CLUSTER, comp);
        if let Some(r) = role {
            labels.insert(LABEL_ROLE.to_string(), r.to_string());
        }
        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "namespace": NS, "labels": labels },
            "status": {
                "podIP": "10.0.0.10",
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        }))
        .expect("pod fixture");
        self.store.seed(&pod).expect("seed pod");
    }

    pub fn seed_pvc(&self, name: &str, storage: &str) {
        let pvc: PersistentVolumeClaim = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": { "name": name, "namespace": NS },
            "spec": { "accessModes": ["ReadWriteOnce"], "resources": { "requests": { "storage": storage } } }
        }))
        .expect("pvc fixture");
        self.store.seed(&pvc).expect("seed pvc");
    }
}

pub fn cluster_key() -> ObjectKey {
    ObjectKey::for_kind::<Cluster>(Some(NS), CLUSTER)
}

pub fn key<K: Resource<DynamicType = ()>>(name: &str) -> ObjectKey {
    ObjectKey::for_kind::<K>(Some(NS), name)
}

pub fn conditions_of(c: &Cluster, type_: &str) -> Vec<Condition> {
    c.status.iter().flat_map(|s| s.conditions.iter()).filter(|c| c.type_ == type_).cloned().collect()
}

pub fn annotation(obj: &InstanceSet, key: &str) -> Option<String> {
    obj.metadata.annotations.as_ref().and_then(|a: &BTreeMap<String, String>| a.get(key)).cloned()
}
