use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

fn ready_condition(pod: &Pod) -> Option<&k8s_openapi::api::core::v1::PodCondition> {
    pod.status.as_ref()?.conditions.as_ref()?.iter().find(|c| c.type_ == "Ready")
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none() && ready_condition(pod).is_some_and(|c| c.status == "True")
}

/// Pod phase Failed, or not ready for longer than `timeout` (measured from the Ready condition's
/// last transition, or from creation when the pod never reported one).
pub fn pod_failed(pod: &Pod, now: DateTime<Utc>, timeout: Duration) -> bool {
    if pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed") {
        return true;
    }
    if is_pod_ready(pod) || pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let since = ready_condition(pod)
        .and_then(|c| c.last_transition_time.as_ref())
        .or(pod.metadata.creation_timestamp.as_ref())
        .map(|t| t.0);
    match (since, chrono::Duration::from_std(timeout)) {
        (Some(since), Ok(grace)) => now - since > grace,
        _ => false,
    }
}
