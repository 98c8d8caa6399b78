//! The transformers of a reconciliation pass and the default chain they run in.

use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use trellis_core::api::dataprotection::{Backup, BackupPolicy, BackupSchedule, Restore};
use trellis_core::api::parameters::ComponentParameter;
use trellis_core::api::workload::InstanceSet;
use trellis_kubehub::Kind;

use crate::{Parallel, TransformerChain};

mod account;
mod backup;
mod deletion;
mod finalizer;
mod parameters;
mod removal;
mod scale;
mod status;
mod vars;
mod workload;

pub use account::AccountTransformer;
pub use backup::BackupPolicyTransformer;
pub use deletion::DeletionTransformer;
pub use finalizer::FinalizerTransformer;
pub use parameters::ParametersTransformer;
pub use removal::ComponentRemovalTransformer;
pub use scale::ScaleTransformer;
pub use status::StatusTransformer;
pub use vars::VarsTransformer;
pub use workload::WorkloadTransformer;

pub fn default_chain() -> TransformerChain {
    TransformerChain::new()
        .with(FinalizerTransformer)
        .with(DeletionTransformer)
        .with(ComponentRemovalTransformer)
        .with(AccountTransformer)
        .with(VarsTransformer)
        .with(Parallel(vec![Box::new(ParametersTransformer), Box::new(BackupPolicyTransformer)]))
        .with(ScaleTransformer)
        .with(WorkloadTransformer)
        .with(StatusTransformer)
}

/// Kinds created on behalf of a cluster, workload first. Pods go away with their workload.
pub(crate) fn owned_kinds(with_backups: bool) -> Vec<Kind> {
    let mut kinds = vec![
        Kind::of::<InstanceSet>(),
        Kind::of::<ComponentParameter>(),
        Kind::of::<BackupSchedule>(),
        Kind::of::<BackupPolicy>(),
        Kind::of::<Restore>(),
        Kind::of::<ConfigMap>(),
        Kind::of::<Secret>(),
        Kind::of::<PersistentVolumeClaim>(),
    ];
    if with_backups {
        kinds.push(Kind::of::<Backup>());
    }
    kinds
}
