use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::info;
use trellis_core::api::workload::InstanceSet;
use trellis_core::labels::{cluster_labels, component_labels, LABEL_COMPONENT};
use trellis_core::Result;
use trellis_graph::Dag;
use trellis_kubehub::Kind;

use super::deletion::stage_reap;
use crate::stage::list_owned;
use crate::{TransformContext, Transformer};

/// Reaps components that left the spec. Their status entry goes once nothing of theirs remains.
pub struct ComponentRemovalTransformer;

#[async_trait]
impl Transformer for ComponentRemovalTransformer {
    fn name(&self) -> &'static str {
        "component-removal"
    }

    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        let wanted: BTreeSet<&str> = ctx.components.iter().map(|c| c.name.as_str()).collect();
        let mut present: BTreeSet<String> =
            ctx.pristine.status.iter().flat_map(|s| s.components.keys().cloned()).collect();
        let workloads = list_owned(&ctx.reader, &Kind::of::<InstanceSet>(), ctx.namespace(), &cluster_labels(ctx.name())).await?;
        present.extend(workloads.iter().filter_map(|w| w.metadata.labels.as_ref()?.get(LABEL_COMPONENT).cloned()));
        let stale: Vec<String> = present.into_iter().filter(|n| !wanted.contains(n.as_str())).collect();

        for comp in stale {
            let reap = stage_reap(ctx, dag, &component_labels(ctx.name(), &comp), false).await?;
            if reap.remaining > 0 {
                info!(cluster = %ctx.name(), component = %comp, remaining = reap.remaining, "removing component");
                let after = ctx.config.retry_after;
                ctx.requeue(after, format!("component {comp} being removed"));
                continue;
            }
            ctx.ports.release_component(&ctx.component_ref(&comp));
            if let Some(st) = ctx.cluster.status.as_mut() {
                st.components.remove(&comp);
            }
        }
        Ok(())
    }
}
