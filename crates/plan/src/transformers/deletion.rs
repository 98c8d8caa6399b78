use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::core::DynamicObject;
use tracing::{debug, info};
use trellis_core::api::cluster::{ComponentPhase, ClusterPhase, TerminationPolicy};
use trellis_core::api::definition::TopologyOrders;
use trellis_core::conditions::{set_condition, Condition, ConditionStatus, REASON_DO_NOT_TERMINATE, TYPE_TERMINATION};
use trellis_core::labels::{cluster_labels, LABEL_COMPONENT, LABEL_SHARDING};
use trellis_core::Result;
use trellis_graph::{Dag, Vertex, VertexId};

use super::owned_kinds;
use super::status::stage_root_status;
use crate::stage::{is_terminating, list_owned, order_groups, stage_delete};
use crate::{TransformContext, Transformer};

/// Owned objects staged for removal under one selector.
#[derive(Debug, Default)]
pub(crate) struct Reap {
    /// Objects still in the store, already terminating ones included.
    pub remaining: usize,
    /// Workload delete vertices by component (or sharding) name.
    pub workloads: BTreeMap<String, Vec<VertexId>>,
}

/// Stage deletes for every object of the owned kinds matching `selector`. Within a component
/// the workload goes first; schedules go before their policies.
pub(crate) async fn stage_reap(
    ctx: &TransformContext,
    dag: &mut Dag,
    selector: &BTreeMap<String, String>,
    with_backups: bool,
) -> Result<Reap> {
    let mut reap = Reap::default();
    let mut by_comp: BTreeMap<String, Vec<(String, VertexId)>> = BTreeMap::new();
    for kind in owned_kinds(with_backups) {
        for obj in list_owned(&ctx.reader, &kind, ctx.namespace(), selector).await? {
            reap.remaining += 1;
            if is_terminating(&obj) {
                continue;
            }
            let comp = label(&obj, LABEL_COMPONENT);
            let group = label(&obj, LABEL_SHARDING).or_else(|| comp.clone());
            let id = stage_delete(dag, obj)?;
            if kind.kind == "InstanceSet" {
                if let Some(g) = group {
                    reap.workloads.entry(g).or_default().push(id);
                }
            }
            by_comp.entry(comp.unwrap_or_default()).or_default().push((kind.kind.clone(), id));
        }
    }
    for staged in by_comp.values() {
        let workloads: Vec<VertexId> = staged.iter().filter(|(k, _)| k == "InstanceSet").map(|(_, id)| *id).collect();
        let schedules: Vec<VertexId> = staged.iter().filter(|(k, _)| k == "BackupSchedule").map(|(_, id)| *id).collect();
        for (kind, id) in staged {
            if kind != "InstanceSet" {
                for &w in &workloads {
                    dag.depend_on(*id, w)?;
                }
            }
            if kind == "BackupPolicy" {
                for &s in &schedules {
                    dag.depend_on(*id, s)?;
                }
            }
        }
    }
    Ok(reap)
}

fn label(obj: &DynamicObject, key: &str) -> Option<String> {
    obj.metadata.labels.as_ref().and_then(|l| l.get(key)).cloned()
}

/// Honours the termination policy once the cluster is marked for deletion, then stops the
/// chain. The finalizer is released only when nothing owned is left.
pub struct DeletionTransformer;

#[async_trait]
impl Transformer for DeletionTransformer {
    fn name(&self) -> &'static str {
        "deletion"
    }

    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        if !ctx.is_deleting() {
            return Ok(());
        }
        ctx.halt();
        let generation = ctx.generation();
        let policy = ctx.cluster.spec.termination_policy;
        let status = ctx.cluster.status.get_or_insert_with(Default::default);
        status.phase = Some(ClusterPhase::Deleting);
        for c in status.components.values_mut() {
            c.phase = Some(ComponentPhase::Deleting);
        }

        if policy == TerminationPolicy::DoNotTerminate {
            let cond = Condition::new(
                TYPE_TERMINATION,
                ConditionStatus::False,
                REASON_DO_NOT_TERMINATE,
                "termination policy DoNotTerminate blocks deletion",
            )
            .with_generation(generation);
            set_condition(&mut status.conditions, cond);
            stage_root_status(ctx, dag)?;
            info!(cluster = %ctx.name(), "deletion blocked by termination policy");
            return Ok(());
        }

        let selector = cluster_labels(ctx.name());
        let reap = stage_reap(ctx, dag, &selector, policy == TerminationPolicy::WipeOut).await?;
        if let Some(orders) = ctx.topology.as_ref().and_then(|t| t.orders.as_ref()) {
            order_groups(dag, &TopologyOrders::groups(&orders.terminate), &reap.workloads)?;
        }

        if reap.remaining > 0 {
            debug!(cluster = %ctx.name(), remaining = reap.remaining, "waiting for owned objects");
            stage_root_status(ctx, dag)?;
            let after = ctx.config.retry_after;
            ctx.requeue(after, "owned objects still present");
            return Ok(());
        }

        ctx.secrets.forget_cluster(ctx.namespace(), ctx.name());
        let names: Vec<String> = ctx
            .components
            .iter()
            .map(|c| c.name.clone())
            .chain(ctx.pristine.status.iter().flat_map(|s| s.components.keys().cloned()))
            .collect();
        for n in names {
            ctx.ports.release_component(&ctx.component_ref(&n));
        }
        info!(cluster = %ctx.name(), "owned objects gone; releasing finalizer");
        dag.add_vertex(Vertex::delete(ctx.pristine_obj.clone())?.mark_root());
        Ok(())
    }
}
