//! Label/annotation keys and object naming conventions shared by all transformers.

use std::collections::{BTreeMap, BTreeSet};

pub const MANAGED_BY: &str = "trellis";
pub const CLUSTER_FINALIZER: &str = "cluster.trellis.io/finalizer";

pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_COMPONENT: &str = "apps.trellis.io/component-name";
pub const LABEL_SHARDING: &str = "apps.trellis.io/sharding-name";
pub const LABEL_ROLE: &str = "trellis.io/role";
pub const LABEL_REVISION: &str = "controller-revision-hash";
pub const LABEL_CLUSTER_DEF: &str = "apps.trellis.io/cluster-def";
pub const LABEL_SERVICE_KIND: &str = "apps.trellis.io/service-kind";
pub const LABEL_CLONE_SESSION: &str = "dataprotection.trellis.io/clone-session";

pub const ANNO_COMPONENT_DEF: &str = "apps.trellis.io/component-def";
pub const ANNO_SERVICE_VERSION: &str = "apps.trellis.io/service-version";
/// Comma separated pods still waiting for member join.
pub const ANNO_MEMBER_JOIN_PENDING: &str = "apps.trellis.io/member-join-pending";
/// JSON map `container/port -> host port` on the env ConfigMap.
pub const ANNO_HOST_PORTS: &str = "apps.trellis.io/host-ports";

pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_INSTANCE.to_string(), cluster.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

pub fn component_labels(cluster: &str, component: &str) -> BTreeMap<String, String> {
    let mut m = cluster_labels(cluster);
    m.insert(LABEL_COMPONENT.to_string(), component.to_string());
    m
}

pub fn workload_name(cluster: &str, component: &str) -> String {
    format!("{cluster}-{component}")
}

pub fn parameter_name(cluster: &str, component: &str) -> String {
    format!("{cluster}-{component}")
}

pub fn env_config_name(cluster: &str, component: &str) -> String {
    format!("{cluster}-{component}-env")
}

pub fn account_secret_name(cluster: &str, component: &str, account: &str) -> String {
    format!("{cluster}-{component}-account-{account}")
}

pub fn backup_policy_name(cluster: &str, component: &str, identifier: Option<&str>) -> String {
    match identifier {
        Some(id) => format!("{cluster}-{component}-backup-policy-{id}"),
        None => format!("{cluster}-{component}-backup-policy"),
    }
}

pub fn backup_schedule_name(cluster: &str, component: &str, identifier: Option<&str>) -> String {
    match identifier {
        Some(id) => format!("{cluster}-{component}-backup-schedule-{id}"),
        None => format!("{cluster}-{component}-backup-schedule"),
    }
}

pub fn clone_backup_name(workload: &str) -> String {
    format!("{workload}-clone-backup")
}

pub fn clone_restore_name(pod: &str) -> String {
    format!("{pod}-clone-restore")
}

pub fn pod_name(workload: &str, ordinal: i32) -> String {
    format!("{workload}-{ordinal}")
}

pub fn pvc_name(claim_template: &str, pod: &str) -> String {
    format!("{claim_template}-{pod}")
}

pub fn ordinal_of(pod: &str) -> Option<i32> {
    pod.rsplit_once('-').and_then(|(_, o)| o.parse().ok())
}

/// Pod names a workload with `replicas` and `offline` converges to: ordinals ascend from 0,
/// offline names are skipped instead of renumbered.
pub fn desired_pod_names(workload: &str, replicas: i32, offline: &[String]) -> BTreeSet<String> {
    let offline: BTreeSet<&str> = offline.iter().map(String::as_str).collect();
    let mut out = BTreeSet::new();
    let mut ordinal = 0;
    while (out.len() as i32) < replicas.max(0) {
        let name = pod_name(workload, ordinal);
        if !offline.contains(name.as_str()) {
            out.insert(name);
        }
        ordinal += 1;
    }
    out
}

/// `k=v,k2=v2` selector string for list queries.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}
