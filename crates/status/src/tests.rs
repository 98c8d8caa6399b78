use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use trellis_core::api::cluster::{ClusterPhase, ComponentPhase};
use trellis_core::api::workload::{InstanceSet, InstanceSetSpec, InstanceSetStatus};
use trellis_core::conditions::ConditionStatus;

use super::*;

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn pod(name: &str, ready: bool, since: &str, labels: &[(&str, &str)]) -> Pod {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "creationTimestamp": "2024-05-01T10:00:00Z",
            "labels": labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>(),
        },
        "status": {
            "phase": "Running",
            "conditions": [{"type": "Ready", "status": if ready { "True" } else { "False" }, "lastTransitionTime": since}]
        }
    }))
    .unwrap()
}

fn workload(replicas: i32, ready: i32) -> InstanceSet {
    let mut w = InstanceSet::new("c-a", InstanceSetSpec { replicas, ..Default::default() });
    w.metadata.generation = Some(1);
    w.status = Some(InstanceSetStatus {
        observed_generation: Some(1),
        replicas,
        ready_replicas: ready,
        update_revision: Some("rev2".into()),
    });
    w
}

fn pvc(request: &str, capacity: &str, condition: Option<&str>) -> PersistentVolumeClaim {
    let conds = condition.map(|t| vec![serde_json::json!({"type": t, "status": "True"})]).unwrap_or_default();
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {"name": "data-c-a-0"},
        "spec": {"resources": {"requests": {"storage": request}}},
        "status": {"capacity": {"storage": capacity}, "conditions": conds}
    }))
    .unwrap()
}

fn obs<'a>(pods: &'a [Pod], w: Option<&'a InstanceSet>, vols: &'a [PersistentVolumeClaim]) -> ComponentObservation<'a> {
    ComponentObservation {
        deleting: false,
        desired_replicas: 1,
        pods,
        workload: w,
        volumes: vols,
        params_synced: true,
        clone_failed: false,
        leader_role: None,
        previous: Some(ComponentPhase::Running),
        now: now(),
        pod_failed_timeout: Duration::from_secs(60),
    }
}

#[test]
fn zero_replicas_with_pods_is_stopping_even_when_not_ready() {
    let pods = [pod("c-a-0", false, "2024-05-01T11:00:00Z", &[])];
    let w = workload(0, 0);
    let mut o = obs(&pods, Some(&w), &[]);
    o.desired_replicas = 0;
    assert_eq!(component_phase(&o).phase, ComponentPhase::Stopping);
    let none: [Pod; 0] = [];
    let o = ComponentObservation { pods: &none, ..o };
    assert_eq!(component_phase(&o).phase, ComponentPhase::Stopped);
}

#[test]
fn deletion_marker_beats_everything() {
    let mut o = obs(&[], None, &[]);
    o.deleting = true;
    o.desired_replicas = 0;
    assert_eq!(component_phase(&o).phase, ComponentPhase::Deleting);
}

#[test]
fn ready_workload_with_synced_params_runs() {
    let pods = [pod("c-a-0", true, "2024-05-01T11:00:00Z", &[(LABEL_REVISION, "rev2")])];
    let w = workload(1, 1);
    assert_eq!(component_phase(&obs(&pods, Some(&w), &[])).phase, ComponentPhase::Running);

    let mut o = obs(&pods, Some(&w), &[]);
    o.params_synced = false;
    assert_eq!(component_phase(&o).phase, ComponentPhase::Updating);

    let vols = [pvc("20Gi", "10Gi", None)];
    assert_eq!(component_phase(&obs(&pods, Some(&w), &vols)).phase, ComponentPhase::Updating);
}

#[test]
fn gated_workload_is_not_running_yet() {
    let pods = [pod("c-a-0", true, "2024-05-01T11:00:00Z", &[])];
    let w = workload(1, 1);
    let mut o = obs(&pods, Some(&w), &[]);
    o.desired_replicas = 3;
    o.previous = None;
    assert_eq!(component_phase(&o).phase, ComponentPhase::Creating);
}

#[test]
fn long_unready_pod_with_available_leader_is_abnormal() {
    let pods = [
        pod("c-a-0", true, "2024-05-01T11:00:00Z", &[(LABEL_REVISION, "rev2"), (LABEL_ROLE, "primary")]),
        pod("c-a-1", false, "2024-05-01T11:00:00Z", &[(LABEL_REVISION, "rev2"), (LABEL_ROLE, "secondary")]),
    ];
    let w = workload(2, 1);
    let mut o = obs(&pods, Some(&w), &[]);
    o.desired_replicas = 2;
    o.leader_role = Some("primary");
    let v = component_phase(&o);
    assert_eq!(v.phase, ComponentPhase::Abnormal);
    assert!(v.message.contains_key("c-a-1"));

    // no leader left -> unavailable -> failed
    let pods = [pods[1].clone()];
    let o = ComponentObservation { pods: &pods, ..o };
    assert_eq!(component_phase(&o).phase, ComponentPhase::Failed);
}

#[test]
fn recently_unready_pod_is_not_a_failure() {
    let pods = [pod("c-a-0", false, "2024-05-01T11:59:30Z", &[])];
    let w = workload(1, 0);
    assert_eq!(component_phase(&obs(&pods, Some(&w), &[])).phase, ComponentPhase::Updating);
}

#[test]
fn clone_failure_and_stalled_expansion_count_as_failures() {
    let pods = [pod("c-a-0", true, "2024-05-01T11:00:00Z", &[(LABEL_REVISION, "rev2")])];
    let w = workload(2, 1);
    let mut o = obs(&pods, Some(&w), &[]);
    o.desired_replicas = 2;
    o.clone_failed = true;
    assert_eq!(component_phase(&o).phase, ComponentPhase::Abnormal);

    let vols = [pvc("20Gi", "10Gi", Some("ControllerResizeError"))];
    let mut o = obs(&pods, Some(&w), &vols);
    o.desired_replicas = 2;
    assert!(expansion_stalled(&vols[0]));
    assert_eq!(component_phase(&o).phase, ComponentPhase::Abnormal);
}

#[test]
fn cluster_phase_follows_priority() {
    use ComponentPhase as C;
    assert_eq!(cluster_phase(true, &[C::Running]), ClusterPhase::Deleting);
    assert_eq!(cluster_phase(false, &[]), ClusterPhase::Creating);
    assert_eq!(cluster_phase(false, &[C::Stopped, C::Stopped]), ClusterPhase::Stopped);
    assert_eq!(cluster_phase(false, &[C::Stopping, C::Stopped]), ClusterPhase::Stopping);
    assert_eq!(cluster_phase(false, &[C::Running, C::Running]), ClusterPhase::Running);
    assert_eq!(cluster_phase(false, &[C::Creating, C::Creating]), ClusterPhase::Creating);
    assert_eq!(cluster_phase(false, &[C::Creating, C::Running]), ClusterPhase::Updating);
    assert_eq!(cluster_phase(false, &[C::Failed, C::Failed]), ClusterPhase::Failed);
    assert_eq!(cluster_phase(false, &[C::Failed, C::Running]), ClusterPhase::Abnormal);
    assert_eq!(cluster_phase(false, &[C::Failed, C::Abnormal]), ClusterPhase::Abnormal);
}

#[test]
fn roles_are_summarised_per_label() {
    let pods = [
        pod("c-a-1", true, "2024-05-01T11:00:00Z", &[(LABEL_ROLE, "secondary")]),
        pod("c-a-0", true, "2024-05-01T11:00:00Z", &[(LABEL_ROLE, "primary")]),
        pod("c-a-2", true, "2024-05-01T11:00:00Z", &[(LABEL_ROLE, "secondary")]),
    ];
    let m = role_members(&pods);
    assert_eq!(m["primary"].as_slice(), ["c-a-0".to_string()]);
    assert_eq!(m["secondary"].as_slice(), ["c-a-1".to_string(), "c-a-2".to_string()]);
}

#[test]
fn ready_condition_lists_lagging_components() {
    let mut comps = BTreeMap::from([("a".to_string(), Some(ComponentPhase::Running))]);
    assert_eq!(ready_condition(Some(1), &comps).status, ConditionStatus::True);
    comps.insert("b".into(), Some(ComponentPhase::Updating));
    let c = ready_condition(Some(1), &comps);
    assert_eq!(c.status, ConditionStatus::False);
    assert!(c.message.ends_with(": b"));
}
