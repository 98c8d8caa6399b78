//! Trellis status: phase aggregation from observed workloads, pods, parameters and volumes.
//!
//! Everything here is a pure function of its inputs; the status transformer gathers the
//! observations and stages the result.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use smallvec::SmallVec;
use trellis_core::api::cluster::{ClusterPhase, ComponentPhase};
use trellis_core::api::workload::InstanceSet;
use trellis_core::conditions::{Condition, ConditionStatus, REASON_CLUSTER_READY, REASON_COMPONENTS_NOT_READY, TYPE_READY};
use trellis_core::labels::{LABEL_REVISION, LABEL_ROLE};
use trellis_core::quantity::parse_bytes;

mod pods;
mod volumes;

pub use pods::{is_pod_ready, pod_failed};
pub use volumes::{expansion_in_progress, expansion_stalled};

/// What the status transformer observed for one component in this pass.
#[derive(Debug, Clone)]
pub struct ComponentObservation<'a> {
    pub deleting: bool,
    pub desired_replicas: i32,
    /// Pods owned by the component, as listed from the store.
    pub pods: &'a [Pod],
    pub workload: Option<&'a InstanceSet>,
    pub volumes: &'a [PersistentVolumeClaim],
    pub params_synced: bool,
    /// A data clone backup or restore reported failure.
    pub clone_failed: bool,
    /// Leader role name when the definition declares roles.
    pub leader_role: Option<&'a str>,
    pub previous: Option<ComponentPhase>,
    pub now: DateTime<Utc>,
    pub pod_failed_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentVerdict {
    pub phase: ComponentPhase,
    /// Short human-readable notes keyed by object name.
    pub message: BTreeMap<String, String>,
}

/// At least one ready pod on the latest revision, carrying the leader role when roles exist.
pub fn is_available(pods: &[Pod], update_revision: Option<&str>, leader_role: Option<&str>) -> bool {
    pods.iter().any(|p| {
        let labels = p.metadata.labels.as_ref();
        let label = |k: &str| labels.and_then(|l| l.get(k)).map(String::as_str);
        let latest = match update_revision {
            Some(rev) => label(LABEL_REVISION) == Some(rev),
            None => true,
        };
        let leader = match leader_role {
            Some(role) => label(LABEL_ROLE) == Some(role),
            None => true,
        };
        is_pod_ready(p) && latest && leader
    })
}

/// Pods grouped by the role label they currently carry.
pub fn role_members(pods: &[Pod]) -> BTreeMap<String, SmallVec<[String; 4]>> {
    let mut out: BTreeMap<String, SmallVec<[String; 4]>> = BTreeMap::new();
    for p in pods {
        let role = p.metadata.labels.as_ref().and_then(|l| l.get(LABEL_ROLE));
        if let (Some(role), Some(name)) = (role, p.metadata.name.as_ref()) {
            out.entry(role.clone()).or_default().push(name.clone());
        }
    }
    for members in out.values_mut() {
        members.sort();
    }
    out
}

fn workload_ready(obs: &ComponentObservation<'_>) -> bool {
    obs.workload.is_some_and(|w| w.is_ready() && w.spec.replicas == obs.desired_replicas)
}

/// First matching rule wins:
/// deleting, stopping, stopped, running, creating, updating, failed, abnormal.
pub fn component_phase(obs: &ComponentObservation<'_>) -> ComponentVerdict {
    let mut message = BTreeMap::new();
    let phase = evaluate(obs, &mut message);
    ComponentVerdict { phase, message }
}

fn evaluate(obs: &ComponentObservation<'_>, message: &mut BTreeMap<String, String>) -> ComponentPhase {
    if obs.deleting {
        return ComponentPhase::Deleting;
    }
    if obs.desired_replicas == 0 {
        return if obs.pods.is_empty() { ComponentPhase::Stopped } else { ComponentPhase::Stopping };
    }
    let expanding = obs.volumes.iter().any(expansion_in_progress);
    if workload_ready(obs) && obs.params_synced && !expanding {
        return ComponentPhase::Running;
    }

    let mut failed = obs.clone_failed;
    if obs.clone_failed {
        message.insert("dataClone".into(), "backup or restore failed".into());
    }
    for p in obs.pods {
        if pod_failed(p, obs.now, obs.pod_failed_timeout) {
            failed = true;
            message.insert(p.metadata.name.clone().unwrap_or_default(), "pod not ready past timeout".into());
        }
    }
    for v in obs.volumes {
        if expansion_stalled(v) {
            failed = true;
            message.insert(v.metadata.name.clone().unwrap_or_default(), "volume expansion failed".into());
        }
    }

    if !failed {
        return match obs.previous {
            None | Some(ComponentPhase::Creating) => ComponentPhase::Creating,
            Some(_) => ComponentPhase::Updating,
        };
    }
    let revision = obs.workload.and_then(InstanceSet::update_revision);
    if !is_available(obs.pods, revision, obs.leader_role) {
        ComponentPhase::Failed
    } else {
        ComponentPhase::Abnormal
    }
}

/// Cluster phase from component phases, by the same priority scheme.
pub fn cluster_phase(deleting: bool, components: &[ComponentPhase]) -> ClusterPhase {
    use ComponentPhase as C;
    let all = |f: &dyn Fn(ComponentPhase) -> bool| components.iter().all(|p| f(*p));
    if deleting {
        ClusterPhase::Deleting
    } else if components.is_empty() {
        ClusterPhase::Creating
    } else if all(&|p| p == C::Stopped) {
        ClusterPhase::Stopped
    } else if all(&|p| matches!(p, C::Stopping | C::Stopped)) {
        ClusterPhase::Stopping
    } else if all(&|p| p == C::Running) {
        ClusterPhase::Running
    } else if all(&|p| p == C::Creating) {
        ClusterPhase::Creating
    } else if all(&|p| !p.is_failure()) {
        ClusterPhase::Updating
    } else if all(&|p| p == C::Failed) {
        ClusterPhase::Failed
    } else {
        ClusterPhase::Abnormal
    }
}

/// `Ready` condition for the cluster: true only while every component runs.
pub fn ready_condition(generation: Option<i64>, components: &BTreeMap<String, Option<ComponentPhase>>) -> Condition {
    let lagging: Vec<&str> = components
        .iter()
        .filter(|(_, p)| **p != Some(ComponentPhase::Running))
        .map(|(n, _)| n.as_str())
        .collect();
    if lagging.is_empty() && !components.is_empty() {
        Condition::new(TYPE_READY, ConditionStatus::True, REASON_CLUSTER_READY, "all components are running")
            .with_generation(generation)
    } else {
        Condition::new(
            TYPE_READY,
            ConditionStatus::False,
            REASON_COMPONENTS_NOT_READY,
            format!("components not running: {}", lagging.join(",")),
        )
        .with_generation(generation)
    }
}

/// Requested storage of a claim, in bytes.
pub(crate) fn storage_of(map: Option<&BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>>) -> Option<f64> {
    map.and_then(|m| m.get("storage")).and_then(|q| parse_bytes(&q.0))
}

#[cfg(test)]
mod tests;
