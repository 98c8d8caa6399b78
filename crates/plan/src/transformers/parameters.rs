use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use kube::core::DynamicObject;
use tracing::debug;
use trellis_core::api::parameters::{ComponentParameter, ComponentParameterSpec, ConfigItem};
use trellis_core::labels::{cluster_labels, parameter_name};
use trellis_core::Result;
use trellis_graph::{Action, Dag};
use trellis_kubehub::Kind;

use crate::context::Component;
use crate::stage::{dynamic, list_owned, stage, stage_delete};
use crate::{TransformContext, Transformer};

/// One parameter object per consolidated component. Only the difference between what exists and
/// what is expected is staged: extra objects are deleted, missing ones created, shared ones
/// patched when their content moved.
pub struct ParametersTransformer;

fn expected(ctx: &TransformContext, comp: &Component) -> ComponentParameter {
    let config_items = comp
        .def
        .spec
        .config_templates
        .iter()
        .map(|t| {
            let mut parameters = t.defaults.clone();
            parameters.extend(comp.spec.parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
            ConfigItem { name: t.name.clone(), parameters }
        })
        .collect();
    let mut p = ComponentParameter::new(
        &parameter_name(ctx.name(), &comp.name),
        ComponentParameterSpec { cluster_name: ctx.name().to_string(), component_name: comp.name.clone(), config_items },
    );
    p.metadata = ctx.owned_meta(parameter_name(ctx.name(), &comp.name), Some(comp));
    p
}

#[async_trait]
impl Transformer for ParametersTransformer {
    fn name(&self) -> &'static str {
        "parameters"
    }

    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        let existing: BTreeMap<String, DynamicObject> =
            list_owned(&ctx.reader, &Kind::of::<ComponentParameter>(), ctx.namespace(), &cluster_labels(ctx.name()))
                .await?
                .into_iter()
                .filter_map(|o| Some((o.metadata.name.clone()?, o)))
                .collect();
        let mut want: BTreeMap<String, ComponentParameter> = BTreeMap::new();
        for comp in &ctx.components {
            let p = expected(ctx, comp);
            want.insert(parameter_name(ctx.name(), &comp.name), p);
        }

        let have: BTreeSet<&String> = existing.keys().collect();
        let need: BTreeSet<&String> = want.keys().collect();
        let (mut created, mut deleted, mut kept) = (0, 0, 0);
        for name in have.difference(&need) {
            if let Some(obj) = existing.get(*name) {
                stage_delete(dag, obj.clone())?;
                deleted += 1;
            }
        }
        for (name, p) in &want {
            let observed = existing.get(name).cloned();
            if observed.is_some() {
                kept += 1;
            } else {
                created += 1;
            }
            stage(dag, dynamic(p)?, observed, Action::Patch)?;
        }
        debug!(cluster = %ctx.name(), created, deleted, kept, "parameter objects");
        Ok(())
    }
}
