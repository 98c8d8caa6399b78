//! Trellis core: the object model every other crate speaks, plus conditions,
//! naming conventions, process config and the error taxonomy.

#![forbid(unsafe_code)]

pub mod api;
pub mod conditions;
pub mod config;
pub mod error;
pub mod kind;
pub mod labels;
pub mod quantity;

pub use config::Config;
pub use error::{Error, Outcome, Result, StoreError};
pub use kind::{Capabilities, WorkloadKind};

pub mod prelude {
    pub use super::api::cluster::{
        Cluster, ClusterBackup, ClusterPhase, ClusterSpec, ClusterStatus, ClaimTemplate, ComponentPhase, ComponentSpec,
        ComponentStatus, ShardingSpec, TerminationPolicy,
    };
    pub use super::api::dataprotection::{
        Backup, BackupMethod, BackupPolicy, BackupPolicySpec, BackupPolicyTemplate, BackupSchedule, BackupScheduleSpec,
        BackupSpec, BackupTarget, DataProtectionPhase, Restore, RestoreSpec, SchedulePolicy,
    };
    pub use super::api::definition::{ClusterDefinition, ComponentDefinition, DefinitionPhase};
    pub use super::api::parameters::{ComponentParameter, ComponentParameterSpec, ConfigItem};
    pub use super::api::workload::{InstanceSet, InstanceSetSpec, InstanceSetStatus, MembershipReconfiguration};
    pub use super::conditions::{Condition, ConditionStatus};
    pub use super::{Capabilities, Config, Error, Outcome, Result, StoreError, WorkloadKind};
}
