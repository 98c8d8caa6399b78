use async_trait::async_trait;
use trellis_core::labels::CLUSTER_FINALIZER;
use trellis_core::Result;
use trellis_graph::{Dag, Vertex};

use crate::{TransformContext, Transformer};

/// Stages the root object vertex and makes sure it carries the cluster finalizer.
pub struct FinalizerTransformer;

#[async_trait]
impl Transformer for FinalizerTransformer {
    fn name(&self) -> &'static str {
        "finalizer"
    }

    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        let pristine = ctx.pristine_obj.clone();
        let has = pristine.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|f| f == CLUSTER_FINALIZER));
        if has || ctx.is_deleting() {
            dag.add_vertex(Vertex::noop(pristine)?.mark_root());
            return Ok(());
        }
        ctx.cluster.metadata.finalizers.get_or_insert_with(Vec::new).push(CLUSTER_FINALIZER.to_string());
        let mut desired = pristine.clone();
        desired.metadata.finalizers = ctx.cluster.metadata.finalizers.clone();
        dag.add_vertex(Vertex::patch(desired, pristine)?.mark_root());
        Ok(())
    }
}
