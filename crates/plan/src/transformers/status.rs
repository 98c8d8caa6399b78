use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use serde_json::{Map, Value as Json};
use tracing::debug;
use trellis_apply::merge_patch;
use trellis_core::api::cluster::{ComponentPhase, ComponentStatus};
use trellis_core::api::parameters::ComponentParameter;
use trellis_core::api::workload::InstanceSet;
use trellis_core::conditions::{apply_succeeded, set_condition};
use trellis_core::labels::{component_labels, parameter_name};
use trellis_core::Result;
use trellis_graph::{Dag, Vertex, VertexId};
use trellis_status::{cluster_phase, component_phase, ready_condition, role_members, ComponentObservation};

use crate::stage::dynamic;
use crate::{TransformContext, Transformer};

/// Status fields this engine owns; anything else another writer put there is left alone.
const OWNED_STATUS_FIELDS: [&str; 4] = ["phase", "observedGeneration", "components", "conditions"];

/// Recomputes component and cluster phases from what the store reports and stages the root
/// status write, last in the graph.
pub struct StatusTransformer;

#[async_trait]
impl Transformer for StatusTransformer {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        let ns = ctx.namespace().to_string();
        let generation = ctx.generation();
        let mut phases: BTreeMap<String, Option<ComponentPhase>> = BTreeMap::new();
        let mut entries = Vec::with_capacity(ctx.components.len());

        for comp in &ctx.components {
            let selector = component_labels(ctx.name(), &comp.name);
            let pods: Vec<Pod> = ctx.reader.list(Some(&ns), &selector).await?;
            let volumes: Vec<PersistentVolumeClaim> = ctx.reader.list(Some(&ns), &selector).await?;
            let workload: Option<InstanceSet> = ctx.reader.get(Some(&ns), &ctx.workload_name(&comp.name)).await?;

            let templates: Vec<&str> = comp.def.spec.config_templates.iter().map(|t| t.name.as_str()).collect();
            let params_synced = templates.is_empty()
                || ctx
                    .reader
                    .get::<ComponentParameter>(Some(&ns), &parameter_name(ctx.name(), &comp.name))
                    .await?
                    .is_some_and(|p| p.is_synced(templates.iter().copied()));

            let leader_role = if comp.capabilities().leader_election { comp.def.leader_role().map(|r| r.name.as_str()) } else { None };
            let previous = ctx.pristine.status.as_ref().and_then(|s| s.components.get(&comp.name)).and_then(|c| c.phase);
            let obs = ComponentObservation {
                deleting: ctx.is_deleting(),
                desired_replicas: comp.desired_replicas(),
                pods: &pods,
                workload: workload.as_ref(),
                volumes: &volumes,
                params_synced,
                clone_failed: ctx.clone_failed.contains(&comp.name),
                leader_role,
                previous,
                now: ctx.now,
                pod_failed_timeout: ctx.config.pod_failed_timeout,
            };
            let verdict = component_phase(&obs);
            if previous != Some(verdict.phase) {
                debug!(cluster = %ctx.name(), component = %comp.name, phase = %verdict.phase, "component phase");
            }
            phases.insert(comp.name.clone(), Some(verdict.phase));
            entries.push((
                comp.name.clone(),
                ComponentStatus { phase: Some(verdict.phase), message: verdict.message, members: role_members(&pods) },
            ));
        }

        let deleting = ctx.is_deleting();
        let status = ctx.cluster.status.get_or_insert_with(Default::default);
        status.components.extend(entries);
        let observed: Vec<ComponentPhase> = phases.values().flatten().copied().collect();
        status.phase = Some(cluster_phase(deleting, &observed));
        status.observed_generation = generation;
        set_condition(&mut status.conditions, apply_succeeded(generation));
        set_condition(&mut status.conditions, ready_condition(generation, &phases));

        stage_root_status(ctx, dag)?;
        Ok(())
    }
}

/// Stage the root status write when it differs from the pristine status. It depends on every
/// vertex staged so far, so it is applied only after all of them succeed.
pub(crate) fn stage_root_status(ctx: &TransformContext, dag: &mut Dag) -> Result<Option<VertexId>> {
    let old_status = ctx.pristine_obj.data.get("status").cloned().unwrap_or(Json::Null);
    let ours = serde_json::to_value(ctx.cluster.status.clone().unwrap_or_default())?;
    let mut merged = match &old_status {
        Json::Object(m) => m.clone(),
        _ => Map::new(),
    };
    for field in OWNED_STATUS_FIELDS {
        match ours.get(field) {
            Some(v) => merged.insert(field.to_string(), v.clone()),
            None => merged.remove(field),
        };
    }
    let new_status = Json::Object(merged);
    if merge_patch(&old_status, &new_status).is_none() {
        return Ok(None);
    }
    let mut desired = dynamic(&ctx.cluster)?;
    if let Some(body) = desired.data.as_object_mut() {
        body.insert("status".into(), new_status);
    }
    let id = dag.add_vertex(Vertex::status(desired, ctx.pristine_obj.clone())?);
    dag.depend_on_all(id)?;
    Ok(Some(id))
}
