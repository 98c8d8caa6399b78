use k8s_openapi::api::core::v1::PersistentVolumeClaim;

use crate::storage_of;

/// Bound capacity still below the requested size.
pub fn expansion_in_progress(pvc: &PersistentVolumeClaim) -> bool {
    let requested = storage_of(pvc.spec.as_ref().and_then(|s| s.resources.as_ref()).and_then(|r| r.requests.as_ref()));
    let capacity = storage_of(pvc.status.as_ref().and_then(|s| s.capacity.as_ref()));
    matches!((requested, capacity), (Some(r), Some(c)) if c < r)
}

/// The resizer reported an error for this claim.
pub fn expansion_stalled(pvc: &PersistentVolumeClaim) -> bool {
    pvc.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cs| cs.iter().any(|c| c.type_.ends_with("ResizeError") && c.status == "True"))
}
