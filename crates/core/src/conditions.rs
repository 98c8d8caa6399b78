//! Status conditions keyed by unique `type`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};

pub const TYPE_PROVISIONING_STARTED: &str = "ProvisioningStarted";
pub const TYPE_APPLY_RESOURCES: &str = "ApplyResources";
pub const TYPE_READY: &str = "Ready";
pub const TYPE_TERMINATION: &str = "Termination";

pub const REASON_PRECHECK_SUCCEED: &str = "PreCheckSucceed";
pub const REASON_PRECHECK_FAILED: &str = "PreCheckFailed";
pub const REASON_APPLY_SUCCEED: &str = "ApplyResourcesSucceed";
pub const REASON_APPLY_FAILED: &str = "ApplyResourcesFailed";
pub const REASON_CLUSTER_READY: &str = "ClusterReady";
pub const REASON_COMPONENTS_NOT_READY: &str = "ComponentsNotReady";
pub const REASON_DO_NOT_TERMINATE: &str = "DoNotTerminate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: None,
        }
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Same observable value, ignoring the transition timestamp.
    pub fn same_value(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

pub fn find<'a>(conds: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conds.iter().find(|c| c.type_ == type_)
}

/// Insert or update `cond` by type. Returns true when the stored value changed.
/// The transition time only moves when the status flips (or on first insert).
pub fn set_condition(conds: &mut Vec<Condition>, mut cond: Condition) -> bool {
    match conds.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(existing) => {
            if existing.same_value(&cond) {
                return false;
            }
            if existing.status != cond.status || existing.last_transition_time.is_none() {
                existing.last_transition_time = Some(Time(chrono::Utc::now()));
            }
            existing.status = cond.status;
            existing.reason = cond.reason;
            existing.message = cond.message;
            existing.observed_generation = cond.observed_generation;
            true
        }
        None => {
            cond.last_transition_time = Some(Time(chrono::Utc::now()));
            conds.push(cond);
            true
        }
    }
}

pub fn provisioning_started(generation: Option<i64>) -> Condition {
    Condition::new(TYPE_PROVISIONING_STARTED, ConditionStatus::True, REASON_PRECHECK_SUCCEED, "preflight checks passed")
        .with_generation(generation)
}

pub fn provisioning_failed(generation: Option<i64>, err: &str) -> Condition {
    Condition::new(TYPE_PROVISIONING_STARTED, ConditionStatus::False, REASON_PRECHECK_FAILED, err).with_generation(generation)
}

pub fn apply_succeeded(generation: Option<i64>) -> Condition {
    Condition::new(TYPE_APPLY_RESOURCES, ConditionStatus::True, REASON_APPLY_SUCCEED, "resources applied")
        .with_generation(generation)
}

pub fn apply_failed(generation: Option<i64>, err: &str) -> Condition {
    Condition::new(TYPE_APPLY_RESOURCES, ConditionStatus::False, REASON_APPLY_FAILED, err).with_generation(generation)
}
