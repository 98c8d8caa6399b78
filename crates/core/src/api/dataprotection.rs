//! Data protection kinds: policy templates, policies, schedules, backups and restores.
//!
//! The backup/restore transport is external; the engine only stages these objects and reads
//! their phase.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "dataprotection.trellis.io",
    version = "v1",
    kind = "BackupPolicyTemplate",
    plural = "backuppolicytemplates",
    shortname = "bpt",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicyTemplateSpec {
    /// Distinguishes policies generated from several templates for the same component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default)]
    pub backup_policies: Vec<BackupPolicyTpl>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicyTpl {
    /// Component definition name prefixes this entry applies to.
    #[serde(default)]
    pub component_defs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_role: Option<String>,
    #[serde(default)]
    pub backup_methods: Vec<BackupMethod>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schedules: Vec<SchedulePolicy>,
}

impl BackupPolicyTpl {
    pub fn matches_component_def(&self, comp_def: &str) -> bool {
        self.component_defs.iter().any(|p| comp_def.starts_with(p.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMethod {
    pub name: String,
    #[serde(default)]
    pub snapshot_volumes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_set_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePolicy {
    pub backup_method: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cron_expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_period: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "dataprotection.trellis.io",
    version = "v1",
    kind = "BackupPolicy",
    plural = "backuppolicies",
    shortname = "bp",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicySpec {
    /// User-managed; preserved across syncs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_repo_name: Option<String>,
    /// User-managed; preserved across syncs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    pub target: BackupTarget,
    #[serde(default)]
    pub backup_methods: Vec<BackupMethod>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "dataprotection.trellis.io",
    version = "v1",
    kind = "BackupSchedule",
    plural = "backupschedules",
    shortname = "bs",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    pub backup_policy_name: String,
    #[serde(default)]
    pub schedules: Vec<SchedulePolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataProtectionPhase {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProtectionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<DataProtectionPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "dataprotection.trellis.io",
    version = "v1",
    kind = "Backup",
    plural = "backups",
    namespaced,
    status = "DataProtectionStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    pub backup_policy_name: String,
    pub backup_method: String,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "dataprotection.trellis.io",
    version = "v1",
    kind = "Restore",
    plural = "restores",
    namespaced,
    status = "DataProtectionStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    pub backup_name: String,
    /// Pod the restored volumes are prepared for.
    pub target_pod: String,
    /// PVCs to provision from the backup.
    #[serde(default)]
    pub volume_claims: Vec<String>,
}

impl Backup {
    pub fn phase(&self) -> Option<DataProtectionPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}

impl Restore {
    pub fn phase(&self) -> Option<DataProtectionPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}
