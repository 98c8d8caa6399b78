mod common;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde_json::json;
use trellis_core::labels::ANNO_MEMBER_JOIN_PENDING;
use trellis_core::prelude::*;
use trellis_kubehub::Verb;
use trellis_ops::{FakeOps, OpsAction, OpsCall};

use common::*;

async fn running(h: &Harness, replicas: i32) {
    h.seed_yaml::<ComponentDefinition>(MYSQL_DEF);
    h.seed_yaml::<Cluster>(&cluster_yaml(replicas, "Delete"));
    h.pass().await.expect("initial pass");
    assert_eq!(h.workload("mysql").map(|w| w.spec.replicas), Some(replicas));
}

async fn scale_to(h: &Harness, replicas: i32) {
    let patch = json!({ "spec": { "componentSpecs": [{
        "name": "mysql",
        "componentDef": "mysql-8",
        "replicas": replicas,
        "volumeClaimTemplates": [{
            "name": "data",
            "spec": { "accessModes": ["ReadWriteOnce"], "resources": { "requests": { "storage": "10Gi" } } }
        }]
    }] } });
    h.patch_cluster(patch).await;
    h.store.take_ops();
}

fn replicas(h: &Harness) -> i32 {
    h.workload("mysql").map(|w| w.spec.replicas).unwrap_or_default()
}

#[tokio::test]
async fn scale_out_waits_for_every_restore() {
    let h = Harness::new();
    running(&h, 1).await;
    scale_to(&h, 3).await;

    let outcome = h.pass().await.expect("backup requested");
    assert!(!outcome.is_settled());
    assert_eq!(replicas(&h), 1);
    assert!(h.store.contains(&key::<Backup>("demo-mysql-clone-backup")));

    h.pass().await.expect("backup still running");
    assert!(!h.store.contains(&key::<Restore>("demo-mysql-1-clone-restore")), "restores wait for the backup");

    h.set_phase::<Backup>("demo-mysql-clone-backup", "Completed");
    h.pass().await.expect("restores requested");
    assert_eq!(replicas(&h), 1);
    let restore: Restore = h.store.typed(Some(NS), "demo-mysql-1-clone-restore").expect("restore for ordinal 1");
    assert_eq!(restore.spec.volume_claims, vec!["data-demo-mysql-1"]);
    assert!(h.store.contains(&key::<Restore>("demo-mysql-2-clone-restore")));

    h.set_phase::<Restore>("demo-mysql-1-clone-restore", "Completed");
    h.pass().await.expect("one restore left");
    assert_eq!(replicas(&h), 1, "never ahead of the restores");

    h.set_phase::<Restore>("demo-mysql-2-clone-restore", "Completed");
    h.store.take_ops();
    h.pass().await.expect("all restores done");
    assert_eq!(replicas(&h), 3);
    assert!(!h.store.contains(&key::<Backup>("demo-mysql-clone-backup")));
    assert!(!h.store.contains(&key::<Restore>("demo-mysql-1-clone-restore")));
    let raised = h.position::<InstanceSet>(Verb::Replace, "demo-mysql").expect("workload raised");
    assert!(raised < h.position::<Backup>(Verb::Delete, "demo-mysql-clone-backup").expect("backup removed"));

    let w = h.workload("mysql").expect("workload");
    assert_eq!(annotation(&w, ANNO_MEMBER_JOIN_PENDING).as_deref(), Some("demo-mysql-1,demo-mysql-2"));
}

#[tokio::test]
async fn failed_restore_holds_replicas_and_fails_the_component() {
    let h = Harness::new();
    running(&h, 1).await;
    scale_to(&h, 2).await;
    h.pass().await.expect("backup requested");
    h.set_phase::<Backup>("demo-mysql-clone-backup", "Completed");
    h.pass().await.expect("restore requested");
    h.set_phase::<Restore>("demo-mysql-1-clone-restore", "Failed");

    let outcome = h.pass().await.expect("clone failure is not a pass error");
    assert!(!outcome.is_settled());
    assert_eq!(replicas(&h), 1);
    let status = h.cluster().status.expect("status");
    assert_eq!(status.components.get("mysql").and_then(|c| c.phase), Some(ComponentPhase::Failed));
}

#[tokio::test]
async fn pending_joins_drain_as_pods_come_up() {
    let h = Harness::new();
    h.seed_yaml::<ComponentDefinition>(&MYSQL_DEF.replace("  dataClone: { backupMethod: xtrabackup }\n", ""));
    h.seed_yaml::<Cluster>(&cluster_yaml(1, "Delete"));
    h.pass().await.expect("initial pass");
    scale_to(&h, 2).await;

    let outcome = h.pass().await.expect("scale out");
    assert_eq!(replicas(&h), 2, "no data clone declared");
    assert!(!outcome.is_settled(), "join still pending");
    let w = h.workload("mysql").expect("workload");
    assert_eq!(annotation(&w, ANNO_MEMBER_JOIN_PENDING).as_deref(), Some("demo-mysql-1"));

    h.seed_pod("demo-mysql-0", "mysql", Some("primary"));
    h.seed_pod("demo-mysql-1", "mysql", Some("secondary"));
    h.pass().await.expect("join");
    let joins: Vec<OpsCall> = h.ops.calls().into_iter().filter(|c| c.action == OpsAction::JoinMember).collect();
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].pod, "demo-mysql-1");
    let w = h.workload("mysql").expect("workload");
    assert_eq!(annotation(&w, ANNO_MEMBER_JOIN_PENDING), None);
}

#[tokio::test]
async fn scale_in_hands_off_leadership_then_drops_volumes() {
    let h = Harness::new();
    running(&h, 3).await;
    h.seed_pod("demo-mysql-0", "mysql", Some("secondary"));
    h.seed_pod("demo-mysql-1", "mysql", Some("secondary"));
    h.seed_pod("demo-mysql-2", "mysql", Some("primary"));
    for pod in ["demo-mysql-0", "demo-mysql-1", "demo-mysql-2"] {
        h.seed_pvc(&format!("data-{pod}"), "10Gi");
    }
    scale_to(&h, 2).await;

    h.pass().await.expect("scale in");
    assert_eq!(
        h.ops.calls(),
        vec![
            OpsCall { action: OpsAction::Switchover, pod: "demo-mysql-2".into(), candidate: Some("demo-mysql-0".into()) },
            OpsCall { action: OpsAction::LeaveMember, pod: "demo-mysql-2".into(), candidate: None },
        ]
    );
    assert_eq!(replicas(&h), 2);
    assert_eq!(h.written::<PersistentVolumeClaim>(Verb::Delete), vec!["data-demo-mysql-2"]);
    let lowered = h.position::<InstanceSet>(Verb::Replace, "demo-mysql").expect("workload lowered");
    assert!(lowered < h.position::<PersistentVolumeClaim>(Verb::Delete, "data-demo-mysql-2").expect("pvc removed"));
}

#[tokio::test]
async fn unreachable_sidecar_does_not_block_scale_in() {
    let h = Harness::with_ops(FakeOps::new().with_unreachable("demo-mysql-1"));
    running(&h, 2).await;
    h.seed_pod("demo-mysql-0", "mysql", Some("primary"));
    h.seed_pod("demo-mysql-1", "mysql", Some("secondary"));
    h.seed_pvc("data-demo-mysql-1", "10Gi");
    scale_to(&h, 1).await;

    h.pass().await.expect("scale in");
    assert_eq!(replicas(&h), 1);
    assert_eq!(h.written::<PersistentVolumeClaim>(Verb::Delete), vec!["data-demo-mysql-1"]);
}

#[tokio::test]
async fn stopping_keeps_volumes_and_skips_member_leave() {
    let h = Harness::new();
    running(&h, 2).await;
    h.seed_pod("demo-mysql-0", "mysql", Some("primary"));
    h.seed_pvc("data-demo-mysql-0", "10Gi");
    h.seed_pvc("data-demo-mysql-1", "10Gi");
    h.patch_cluster(json!({ "spec": { "componentSpecs": [{
        "name": "mysql", "componentDef": "mysql-8", "replicas": 2, "stop": true,
        "volumeClaimTemplates": [{ "name": "data", "spec": { "resources": { "requests": { "storage": "10Gi" } } } }]
    }] } }))
    .await;
    h.store.take_ops();

    h.pass().await.expect("stop");
    assert_eq!(replicas(&h), 0);
    assert!(h.ops.calls().is_empty());
    assert!(h.written::<PersistentVolumeClaim>(Verb::Delete).is_empty());
    let status = h.cluster().status.expect("status");
    assert_eq!(status.components.get("mysql").and_then(|c| c.phase), Some(ComponentPhase::Stopping));
}

#[tokio::test]
async fn growing_the_claim_template_patches_existing_volumes() {
    let h = Harness::new();
    running(&h, 1).await;
    h.seed_pvc("data-demo-mysql-0", "10Gi");
    h.patch_cluster(json!({ "spec": { "componentSpecs": [{
        "name": "mysql", "componentDef": "mysql-8", "replicas": 1,
        "volumeClaimTemplates": [{ "name": "data", "spec": { "resources": { "requests": { "storage": "20Gi" } } } }]
    }] } }))
    .await;
    h.store.take_ops();

    h.pass().await.expect("expand");
    assert_eq!(h.written::<PersistentVolumeClaim>(Verb::Patch), vec!["data-demo-mysql-0"]);
    let pvc: PersistentVolumeClaim = h.store.typed(Some(NS), "data-demo-mysql-0").expect("pvc");
    let storage = serde_json::to_value(&pvc).expect("json")["spec"]["resources"]["requests"]["storage"].clone();
    assert_eq!(storage, json!("20Gi"));
}

#[tokio::test]
async fn offline_swap_waits_for_the_replacement_clone() {
    let h = Harness::new();
    running(&h, 3).await;
    h.seed_pod("demo-mysql-0", "mysql", Some("secondary"));
    h.seed_pod("demo-mysql-1", "mysql", Some("primary"));
    h.seed_pod("demo-mysql-2", "mysql", Some("secondary"));
    h.seed_pvc("data-demo-mysql-0", "10Gi");
    let patch = json!({ "spec": { "componentSpecs": [{
        "name": "mysql",
        "componentDef": "mysql-8",
        "replicas": 3,
        "offlineInstances": ["demo-mysql-0"],
        "volumeClaimTemplates": [{
            "name": "data",
            "spec": { "accessModes": ["ReadWriteOnce"], "resources": { "requests": { "storage": "10Gi" } } }
        }]
    }] } });
    h.patch_cluster(patch).await;
    h.store.take_ops();

    let outcome = h.pass().await.expect("backup requested");
    assert!(!outcome.is_settled());
    assert!(h.ops.calls().is_empty(), "member left while its replacement is cloning");
    assert!(h.written::<PersistentVolumeClaim>(Verb::Delete).is_empty());
    assert!(h.workload("mysql").is_some_and(|w| w.spec.offline_instances.is_empty()));
    assert!(h.store.contains(&key::<Backup>("demo-mysql-clone-backup")));

    h.pass().await.expect("backup still running");
    assert!(h.ops.calls().is_empty());
    assert!(h.store.contains(&key::<PersistentVolumeClaim>("data-demo-mysql-0")));

    h.set_phase::<Backup>("demo-mysql-clone-backup", "Completed");
    h.pass().await.expect("restore requested");
    assert!(h.ops.calls().is_empty());
    h.set_phase::<Restore>("demo-mysql-3-clone-restore", "Completed");
    h.store.take_ops();
    h.pass().await.expect("swap");

    let leaves: Vec<String> =
        h.ops.calls().into_iter().filter(|c| c.action == OpsAction::LeaveMember).map(|c| c.pod).collect();
    assert_eq!(leaves, vec!["demo-mysql-0"]);
    let w = h.workload("mysql").expect("workload");
    assert_eq!(w.spec.offline_instances, vec!["demo-mysql-0"]);
    let swapped = h.position::<InstanceSet>(Verb::Replace, "demo-mysql").expect("workload swapped");
    assert!(swapped < h.position::<PersistentVolumeClaim>(Verb::Delete, "data-demo-mysql-0").expect("pvc removed"));
}

#[tokio::test]
async fn clone_backup_runs_under_the_identified_policy() {
    let h = Harness::new();
    h.seed_yaml::<BackupPolicyTemplate>(&MYSQL_BPT.replace("spec:\n", "spec:\n  identifier: hourly\n"));
    running(&h, 1).await;
    assert!(h.store.contains(&key::<BackupPolicy>("demo-mysql-backup-policy-hourly")));
    scale_to(&h, 2).await;

    h.pass().await.expect("backup requested");
    let backup: Backup = h.store.typed(Some(NS), "demo-mysql-clone-backup").expect("clone backup");
    assert_eq!(backup.spec.backup_policy_name, "demo-mysql-backup-policy-hourly");
    assert_eq!(backup.spec.backup_method, "xtrabackup");
}
