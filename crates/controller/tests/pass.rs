use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use serde_json::json;
use trellis_controller::{next_action, reconcile_pass};
use trellis_core::prelude::*;
use trellis_kubehub::{MemEvents, MemStore, ObjectKey, ObjectStore};
use trellis_ops::FakeOps;
use trellis_plan::Services;

const DEF: &str = r#"
apiVersion: apps.trellis.io/v1
kind: ComponentDefinition
metadata:
  name: pg-16
spec:
  serviceKind: postgresql
  serviceVersion: "16.2"
  workloadKind: Replication
  runtime:
    containers:
      - name: postgres
        image: postgres:16.2
  roles:
    - { name: primary, isLeader: true }
    - { name: replica }
  lifecycleActions: { switchover: true, memberJoin: true, memberLeave: true }
  dataClone: { backupMethod: basebackup }
status:
  phase: Available
"#;

const CLUSTER: &str = r#"
apiVersion: apps.trellis.io/v1
kind: Cluster
metadata:
  name: pg
  namespace: db
spec:
  terminationPolicy: Delete
  componentSpecs:
    - name: pg
      componentDef: pg-16
      replicas: 1
      volumeClaimTemplates:
        - name: data
          spec:
            resources:
              requests:
                storage: 5Gi
"#;

fn services(store: &Arc<MemStore>, config: Config) -> Services {
    Services::new(store.clone(), Arc::new(MemEvents::default()), Arc::new(FakeOps::new()), config)
}

fn seed(store: &MemStore) {
    let def: ComponentDefinition = serde_yaml::from_str(DEF).expect("definition fixture");
    let cluster: Cluster = serde_yaml::from_str(CLUSTER).expect("cluster fixture");
    store.seed(&def).expect("seed definition");
    store.seed(&cluster).expect("seed cluster");
}

#[tokio::test]
async fn vanished_cluster_settles() {
    let store = Arc::new(MemStore::new());
    let out = reconcile_pass(&services(&store, Config::default()), "db", "pg").await.expect("no error");
    assert!(out.is_settled());
    assert!(store.ops().is_empty());
}

#[tokio::test]
async fn settled_cluster_resyncs_without_writes() {
    let store = Arc::new(MemStore::new());
    seed(&store);
    let svc = services(&store, Config::default());
    reconcile_pass(&svc, "db", "pg").await.expect("first pass");
    assert!(store.contains(&ObjectKey::for_kind::<InstanceSet>(Some("db"), "pg-pg")));
    store.take_ops();

    let out = reconcile_pass(&svc, "db", "pg").await.expect("second pass");
    assert!(store.ops().is_empty(), "unexpected writes: {:?}", store.ops());
    assert_eq!(next_action(&out, &svc.config), Action::requeue(svc.config.resync_after));
}

#[tokio::test]
async fn missing_definition_surfaces_as_validation_error() {
    let store = Arc::new(MemStore::new());
    let cluster: Cluster = serde_yaml::from_str(CLUSTER).expect("cluster fixture");
    store.seed(&cluster).expect("seed cluster");

    let err = reconcile_pass(&services(&store, Config::default()), "db", "pg").await.expect_err("no definition");
    assert!(matches!(err, Error::Validation(_)), "{err}");
}

#[tokio::test]
async fn clone_in_flight_requeues_at_the_poll_interval() {
    let store = Arc::new(MemStore::new());
    seed(&store);
    let config = Config { clone_poll: Duration::from_secs(4), ..Config::default() };
    let svc = services(&store, config);
    reconcile_pass(&svc, "db", "pg").await.expect("first pass");

    let key = ObjectKey::for_kind::<Cluster>(Some("db"), "pg");
    let patch = json!({ "spec": { "componentSpecs": [{
        "name": "pg", "componentDef": "pg-16", "replicas": 2,
        "volumeClaimTemplates": [{ "name": "data", "spec": { "resources": { "requests": { "storage": "5Gi" } } } }]
    }] } });
    store.patch(&key, &patch).await.expect("scale out");

    let out = reconcile_pass(&svc, "db", "pg").await.expect("clone pass");
    assert_eq!(next_action(&out, &svc.config), Action::requeue(Duration::from_secs(4)));
    assert!(store.contains(&ObjectKey::for_kind::<Backup>(Some("db"), "pg-pg-clone-backup")));
}
