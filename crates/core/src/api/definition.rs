//! Definitions: what a component (and a whole cluster shape) looks like.
//!
//! These are opaque input data to the engine; only the fields the planner reads are modelled.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodSpec;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::kind::WorkloadKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefinitionPhase {
    Available,
    Unavailable,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "apps.trellis.io",
    version = "v1",
    kind = "ClusterDefinition",
    plural = "clusterdefinitions",
    shortname = "cd",
    status = "DefinitionStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDefinitionSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topologies: Vec<ClusterTopology>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    pub name: String,
    #[serde(default)]
    pub components: Vec<TopologyComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orders: Option<TopologyOrders>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyComponent {
    pub name: String,
    pub comp_def: String,
}

/// Each entry is a comma separated group; groups are applied in list order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyOrders {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provision: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terminate: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update: Vec<String>,
}

impl ClusterDefinition {
    /// Named topology, or the default one when `name` is None.
    pub fn topology(&self, name: Option<&str>) -> Option<&ClusterTopology> {
        match name {
            Some(n) => self.spec.topologies.iter().find(|t| t.name == n),
            None => self
                .spec
                .topologies
                .iter()
                .find(|t| t.default)
                .or_else(|| self.spec.topologies.first()),
        }
    }
}

impl TopologyOrders {
    /// Split `"a,b"` style entries into groups of component names.
    pub fn groups(entries: &[String]) -> Vec<Vec<String>> {
        entries
            .iter()
            .map(|g| g.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect::<Vec<_>>())
            .filter(|g| !g.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DefinitionPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "apps.trellis.io",
    version = "v1",
    kind = "ComponentDefinition",
    plural = "componentdefinitions",
    shortname = "cmpd",
    status = "DefinitionStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinitionSpec {
    #[serde(default)]
    pub service_kind: String,
    #[serde(default)]
    pub service_version: String,
    #[serde(default)]
    pub workload_kind: WorkloadKind,
    #[serde(default)]
    pub runtime: PodSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<Release>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<ReplicaRole>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<Var>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_accounts: Vec<SystemAccount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_templates: Vec<ConfigTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<HostNetwork>,
    #[serde(default)]
    pub lifecycle_actions: LifecycleActions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_clone: Option<DataClonePolicy>,
}

impl ComponentDefinition {
    pub fn is_available(&self) -> bool {
        matches!(self.status.as_ref().and_then(|s| s.phase), Some(DefinitionPhase::Available))
    }

    /// Images for a service version; falls back to the definition's own version.
    pub fn images_for(&self, service_version: Option<&str>) -> Option<&BTreeMap<String, String>> {
        let want = service_version.unwrap_or(self.spec.service_version.as_str());
        self.spec.releases.iter().find(|r| r.service_version == want).map(|r| &r.images)
    }

    pub fn leader_role(&self) -> Option<&ReplicaRole> {
        self.spec.roles.iter().find(|r| r.is_leader)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub service_version: String,
    /// container name -> image
    #[serde(default)]
    pub images: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRole {
    pub name: String,
    #[serde(default)]
    pub is_leader: bool,
    #[serde(default)]
    pub votable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Var {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<VarSource>,
}

/// Where a var's value comes from. Exactly one reference is expected; the first set one wins,
/// in field order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VarSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_ref: Option<ComponentVarRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<CredentialVarRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network_ref: Option<HostNetworkVarRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVarRef {
    /// Definition-name prefix of the referenced component; the owning component when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comp_def: Option<String>,
    pub field: ComponentField,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentField {
    #[default]
    ShortName,
    Replicas,
    PodNames,
    PodFqdns,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialVarRef {
    pub account: String,
    pub key: CredentialKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialKey {
    Username,
    Password,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostNetworkVarRef {
    pub container: String,
    pub port: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAccount {
    pub name: String,
    #[serde(default)]
    pub init_account: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_length: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigTemplate {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostNetwork {
    #[serde(default)]
    pub container_ports: Vec<HostPortRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPortRef {
    pub container: String,
    pub port: String,
}

/// Which sidecar actions the engine may invoke for this definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleActions {
    #[serde(default)]
    pub switchover: bool,
    #[serde(default)]
    pub member_join: bool,
    #[serde(default)]
    pub member_leave: bool,
}

impl LifecycleActions {
    pub fn any(&self) -> bool {
        self.switchover || self.member_join || self.member_leave
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataClonePolicy {
    pub backup_method: String,
}
