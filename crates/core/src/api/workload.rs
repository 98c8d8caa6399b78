//! The replica-counted, role-aware workload each component runs as.
//!
//! Pods are created by the workload controller (an external collaborator); this crate only
//! produces the desired InstanceSet and reads its status.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::api::cluster::ClaimTemplate;
use crate::api::definition::ReplicaRole;

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "workloads.trellis.io",
    version = "v1",
    kind = "InstanceSet",
    plural = "instancesets",
    shortname = "its",
    namespaced,
    status = "InstanceSetStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetSpec {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offline_instances: Vec<String>,
    /// matchLabels; immutable once the workload exists.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
    #[serde(default)]
    pub template: PodTemplateSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<ClaimTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<ReplicaRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_reconfiguration: Option<MembershipReconfiguration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipReconfiguration {
    #[serde(default)]
    pub switchover: bool,
    #[serde(default)]
    pub member_join: bool,
    #[serde(default)]
    pub member_leave: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    /// Revision hash pods of the latest template carry in `controller-revision-hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,
}

impl InstanceSet {
    /// The workload has observed its latest spec and every replica is ready.
    pub fn is_ready(&self) -> bool {
        let Some(st) = self.status.as_ref() else { return false };
        let observed = match (st.observed_generation, self.metadata.generation) {
            (Some(o), Some(g)) => o >= g,
            (_, None) => true,
            (None, Some(_)) => false,
        };
        observed && st.replicas == self.spec.replicas && st.ready_replicas == self.spec.replicas
    }

    pub fn update_revision(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.update_revision.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn its(replicas: i32, generation: i64, status: Option<InstanceSetStatus>) -> InstanceSet {
        let mut w = InstanceSet::new("c-a", InstanceSetSpec { replicas, ..Default::default() });
        w.metadata.generation = Some(generation);
        w.status = status;
        w
    }

    #[test]
    fn ready_requires_observed_generation_and_all_replicas() {
        assert!(!its(3, 2, None).is_ready());
        let st = InstanceSetStatus { observed_generation: Some(1), replicas: 3, ready_replicas: 3, update_revision: None };
        assert!(!its(3, 2, Some(st.clone())).is_ready(), "stale generation");
        let st2 = InstanceSetStatus { observed_generation: Some(2), ..st.clone() };
        assert!(its(3, 2, Some(st2.clone())).is_ready());
        let st3 = InstanceSetStatus { ready_replicas: 2, ..st2 };
        assert!(!its(3, 2, Some(st3)).is_ready());
    }
}
