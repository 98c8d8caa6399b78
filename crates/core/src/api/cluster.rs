//! The root object: a database cluster made of named components.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{Affinity, PersistentVolumeClaimSpec, ResourceRequirements, Toleration};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::conditions::Condition;

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "apps.trellis.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    shortname = "cl",
    namespaced,
    status = "ClusterStatus",
    schema = "disabled",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster-wide definition; enables topologies and definition-scoped backup templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_def: Option<String>,
    /// Topology name inside `cluster_def`; the definition's default topology when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<String>,
    #[serde(default)]
    pub termination_policy: TerminationPolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_specs: Vec<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shardings: Vec<ShardingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<ClusterBackup>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationPolicy {
    DoNotTerminate,
    #[default]
    Delete,
    WipeOut,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    pub name: String,
    /// Referenced ComponentDefinition; may be left empty when the topology names it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component_def: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
    #[serde(default)]
    pub replicas: i32,
    /// Pod names to take out of service; ordinals are skipped rather than renumbered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offline_instances: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<ClaimTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<bool>,
}

impl ComponentSpec {
    pub fn is_stopped(&self) -> bool {
        self.stop.unwrap_or(false)
    }

    /// Replica count the workload should converge to (zero while stopped).
    pub fn desired_replicas(&self) -> i32 {
        if self.is_stopped() { 0 } else { self.replicas.max(0) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTemplate {
    pub name: String,
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

/// A component template replicated across `shards` named shards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardingSpec {
    pub name: String,
    pub template: ComponentSpec,
    pub shards: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBackup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_period: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ComponentStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ComponentPhase>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message: BTreeMap<String, String>,
    /// Role name -> pods currently carrying it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub members: BTreeMap<String, SmallVec<[String; 4]>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentPhase {
    Creating,
    Updating,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Failed,
    Abnormal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterPhase {
    Creating,
    Updating,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Failed,
    Abnormal,
}

impl ComponentPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "Creating",
            Self::Updating => "Updating",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Deleting => "Deleting",
            Self::Failed => "Failed",
            Self::Abnormal => "Abnormal",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Abnormal)
    }
}

impl ClusterPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "Creating",
            Self::Updating => "Updating",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Deleting => "Deleting",
            Self::Failed => "Failed",
            Self::Abnormal => "Abnormal",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Abnormal)
    }
}

impl fmt::Display for ComponentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Cluster {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn status_or_default(&self) -> ClusterStatus {
        self.status.clone().unwrap_or_default()
    }
}
