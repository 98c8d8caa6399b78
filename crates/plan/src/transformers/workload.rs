use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, EnvFromSource, PersistentVolumeClaim, PodTemplateSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use serde_json::{json, Value as Json};
use tracing::{debug, info};
use trellis_core::api::definition::TopologyOrders;
use trellis_core::api::parameters::ComponentParameter;
use trellis_core::api::workload::{InstanceSet, InstanceSetSpec, MembershipReconfiguration};
use trellis_core::labels::{
    account_secret_name, desired_pod_names, env_config_name, parameter_name, pvc_name, ANNO_COMPONENT_DEF,
    ANNO_MEMBER_JOIN_PENDING, ANNO_SERVICE_VERSION, LABEL_SHARDING,
};
use trellis_core::quantity::parse_bytes;
use trellis_core::Result;
use trellis_graph::{Action, Dag, Vertex, VertexId};
use trellis_kubehub::ObjectKey;

use crate::context::{Component, ScaleDecision};
use crate::stage::{dynamic, order_groups, overlay, stage_merged, typed};
use crate::{TransformContext, Transformer};

/// Synthesises each component's InstanceSet, merges it over the running one and orders the
/// workload writes by the topology.
pub struct WorkloadTransformer;

#[async_trait]
impl Transformer for WorkloadTransformer {
    fn name(&self) -> &'static str {
        "workload"
    }

    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        let ns = ctx.namespace().to_string();
        let mut created: BTreeMap<String, Vec<VertexId>> = BTreeMap::new();
        let mut updated: BTreeMap<String, Vec<VertexId>> = BTreeMap::new();

        for comp in &ctx.components {
            let decision = ctx.scale.get(&comp.name).cloned().unwrap_or_else(|| ScaleDecision {
                replicas: comp.desired_replicas(),
                offline: comp.spec.offline_instances.clone(),
                ..Default::default()
            });
            let name = ctx.workload_name(&comp.name);
            let desired = proto(ctx, comp, &decision)?;
            let observed = ctx.reader.get_dynamic(&ObjectKey::for_kind::<InstanceSet>(Some(&ns), name.clone())).await?;

            let id = match observed {
                None => {
                    info!(cluster = %ctx.name(), component = %comp.name, replicas = decision.replicas, "workload staged for create");
                    let id = dag.add_vertex(Vertex::create(dynamic(&desired)?)?);
                    created.entry(topology_name(comp)).or_default().push(id);
                    id
                }
                Some(obs) => {
                    let existing: InstanceSet = typed(&obs)?;
                    let merged = merge(&obs, &existing, desired, comp, &decision)?;
                    let id = stage_merged(dag, merged, obs, Action::Update)?;
                    updated.entry(topology_name(comp)).or_default().push(id);
                    id
                }
            };

            for prereq in prerequisites(ctx, comp, &ns) {
                if let Some(p) = dag.find(&prereq) {
                    dag.depend_on(id, p)?;
                }
            }
            for &later in &decision.after_workload {
                dag.depend_on(later, id)?;
            }
            expand_volumes(ctx, dag, comp, &decision, id).await?;
        }

        if let Some(orders) = ctx.topology.as_ref().and_then(|t| t.orders.as_ref()) {
            order_groups(dag, &TopologyOrders::groups(&orders.provision), &created)?;
            order_groups(dag, &TopologyOrders::groups(&orders.update), &updated)?;
        }
        Ok(())
    }
}

/// Topology orders name shardings, not the shards expanded from them.
fn topology_name(comp: &Component) -> String {
    comp.sharding.clone().unwrap_or_else(|| comp.name.clone())
}

/// Objects the workload's pods read at start: the env ConfigMap, account Secrets and the
/// parameter object.
fn prerequisites(ctx: &TransformContext, comp: &Component, ns: &str) -> Vec<ObjectKey> {
    let mut keys = vec![
        ObjectKey::for_kind::<ConfigMap>(Some(ns), env_config_name(ctx.name(), &comp.name)),
        ObjectKey::for_kind::<ComponentParameter>(Some(ns), parameter_name(ctx.name(), &comp.name)),
    ];
    keys.extend(
        comp.def
            .spec
            .system_accounts
            .iter()
            .map(|a| ObjectKey::for_kind::<Secret>(Some(ns), account_secret_name(ctx.name(), &comp.name, &a.name))),
    );
    keys
}

fn proto(ctx: &TransformContext, comp: &Component, decision: &ScaleDecision) -> Result<InstanceSet> {
    let name = ctx.workload_name(&comp.name);
    let meta = ctx.owned_meta(name.clone(), Some(comp));
    let mut selector = meta.labels.clone().unwrap_or_default();
    selector.remove(LABEL_SHARDING);

    let mut pod = comp.def.spec.runtime.clone();
    let images = comp.def.images_for(comp.spec.service_version.as_deref());
    let env_from: EnvFromSource =
        serde_json::from_value(json!({ "configMapRef": { "name": env_config_name(ctx.name(), &comp.name) } }))?;
    for (i, c) in pod.containers.iter_mut().enumerate() {
        if let Some(image) = images.and_then(|m| m.get(&c.name)) {
            c.image = Some(image.clone());
        }
        if i == 0 {
            if let Some(r) = &comp.spec.resources {
                c.resources = Some(r.clone());
            }
        }
        c.env_from.get_or_insert_with(Vec::new).push(env_from.clone());
        for p in c.ports.iter_mut().flatten() {
            let Some(port_name) = p.name.clone() else { continue };
            if let Some(&host) = ctx.host_ports.get(&(comp.name.clone(), c.name.clone(), port_name)) {
                p.container_port = i32::from(host);
                p.host_port = Some(i32::from(host));
            }
        }
    }
    if comp.def.spec.host_network.is_some() {
        pod.host_network = Some(true);
    }
    if comp.spec.affinity.is_some() {
        pod.affinity = comp.spec.affinity.clone();
    }
    if !comp.spec.tolerations.is_empty() {
        pod.tolerations.get_or_insert_with(Vec::new).extend(comp.spec.tolerations.iter().cloned());
    }

    let service_version = comp.spec.service_version.clone().unwrap_or_else(|| comp.def.spec.service_version.clone());
    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: meta.labels.clone(),
            annotations: Some(BTreeMap::from([
                (ANNO_COMPONENT_DEF.to_string(), comp.def_name().to_string()),
                (ANNO_SERVICE_VERSION.to_string(), service_version.clone()),
            ])),
            ..Default::default()
        }),
        spec: Some(pod),
    };

    let actions = comp.def.spec.lifecycle_actions;
    let membership = (comp.capabilities().member_join_leave && actions.any()).then_some(
        MembershipReconfiguration {
            switchover: actions.switchover,
            member_join: actions.member_join,
            member_leave: actions.member_leave,
        },
    );
    let mut its = InstanceSet::new(
        &name,
        InstanceSetSpec {
            replicas: decision.replicas,
            offline_instances: decision.offline.clone(),
            selector,
            service_version: Some(service_version),
            template,
            volume_claim_templates: comp.spec.volume_claim_templates.clone(),
            roles: comp.def.spec.roles.clone(),
            membership_reconfiguration: membership,
        },
    );
    its.metadata = meta;
    if !decision.join_pending.is_empty() {
        its.metadata.annotations = Some(BTreeMap::from([(ANNO_MEMBER_JOIN_PENDING.to_string(), join_list(decision))]));
    }
    Ok(its)
}

fn join_list(decision: &ScaleDecision) -> String {
    decision.join_pending.iter().cloned().collect::<Vec<_>>().join(",")
}

/// The running workload wins on the selector (immutable) and, unless the definition or the
/// service version moved, on container images. Pod-template annotations set by others are kept.
fn merge(
    obs: &DynamicObject,
    existing: &InstanceSet,
    mut desired: InstanceSet,
    comp: &Component,
    decision: &ScaleDecision,
) -> Result<DynamicObject> {
    if !existing.spec.selector.is_empty() {
        desired.spec.selector = existing.spec.selector.clone();
    }
    let old_def = existing.spec.template.metadata.as_ref().and_then(|m| m.annotations.as_ref()?.get(ANNO_COMPONENT_DEF));
    let same_def = old_def.is_some_and(|d| d == comp.def_name());
    let same_version = existing.spec.service_version == desired.spec.service_version;
    if same_def && same_version {
        keep_images(existing, &mut desired);
    }
    keep_template_annotations(existing, &mut desired);

    let mut merged = overlay(obs, dynamic(&desired)?);
    if decision.join_pending.is_empty() {
        if let Some(a) = merged.metadata.annotations.as_mut() {
            a.remove(ANNO_MEMBER_JOIN_PENDING);
        }
    }
    Ok(merged)
}

fn keep_template_annotations(existing: &InstanceSet, desired: &mut InstanceSet) {
    let Some(old) = existing.spec.template.metadata.as_ref().and_then(|m| m.annotations.as_ref()) else { return };
    let meta = desired.spec.template.metadata.get_or_insert_with(Default::default);
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    for (k, v) in old {
        annotations.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

fn keep_images(existing: &InstanceSet, desired: &mut InstanceSet) {
    let running: BTreeMap<&str, &str> = existing
        .spec
        .template
        .spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .filter_map(|c| Some((c.name.as_str(), c.image.as_deref()?)))
        .collect();
    for c in desired.spec.template.spec.iter_mut().flat_map(|s| s.containers.iter_mut()) {
        if let Some(image) = running.get(c.name.as_str()) {
            if c.image.as_deref() != Some(*image) {
                debug!(container = %c.name, from = ?c.image, to = %image, "image change without version change rolled back");
                c.image = Some(image.to_string());
            }
        }
    }
}

fn requested_storage(v: &Json) -> Option<f64> {
    v.pointer("/resources/requests/storage").and_then(Json::as_str).and_then(parse_bytes)
}

/// Grow each existing claim whose request is below its template's.
async fn expand_volumes(
    ctx: &TransformContext,
    dag: &mut Dag,
    comp: &Component,
    decision: &ScaleDecision,
    workload: VertexId,
) -> Result<()> {
    let ns = ctx.namespace();
    let pods = desired_pod_names(&ctx.workload_name(&comp.name), decision.replicas, &decision.offline);
    for tpl in &comp.spec.volume_claim_templates {
        let tpl_spec = serde_json::to_value(&tpl.spec)?;
        let (Some(want), Some(raw)) =
            (requested_storage(&tpl_spec), tpl_spec.pointer("/resources/requests/storage").cloned())
        else {
            continue;
        };
        for pod in &pods {
            let key = ObjectKey::for_kind::<PersistentVolumeClaim>(Some(ns), pvc_name(&tpl.name, pod));
            let Some(obs) = ctx.reader.get_dynamic(&key).await? else { continue };
            let have = obs.data.get("spec").and_then(requested_storage);
            if have.is_some_and(|h| h >= want) {
                continue;
            }
            let mut grown = obs.clone();
            if let Some(spec) = grown.data.get_mut("spec").and_then(Json::as_object_mut) {
                let resources = spec.entry("resources").or_insert_with(|| json!({}));
                if let Some(r) = resources.as_object_mut() {
                    let requests = r.entry("requests").or_insert_with(|| json!({}));
                    if let Some(q) = requests.as_object_mut() {
                        q.insert("storage".into(), raw.clone());
                    }
                }
            }
            let id = dag.add_vertex(Vertex::patch(grown, obs)?);
            dag.depend_on(id, workload)?;
            info!(cluster = %ctx.name(), component = %comp.name, pvc = %key.name, "volume expansion staged");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn its_with_image(image: &str) -> InstanceSet {
        let mut its = InstanceSet::new("c-a", InstanceSetSpec::default());
        its.spec.template.spec = Some(PodSpec {
            containers: vec![Container { name: "db".into(), image: Some(image.into()), ..Default::default() }],
            ..Default::default()
        });
        its
    }

    #[test]
    fn running_images_are_kept() {
        let existing = its_with_image("db:1.0");
        let mut desired = its_with_image("db:1.1");
        keep_images(&existing, &mut desired);
        let image = desired.spec.template.spec.as_ref().and_then(|s| s.containers[0].image.clone());
        assert_eq!(image.as_deref(), Some("db:1.0"));
    }

    #[test]
    fn foreign_template_annotations_survive() {
        let mut existing = its_with_image("db:1.0");
        existing.spec.template.metadata = Some(ObjectMeta {
            annotations: Some(BTreeMap::from([
                ("kubectl.kubernetes.io/restartedAt".to_string(), "2024-05-01T00:00:00Z".to_string()),
                (ANNO_SERVICE_VERSION.to_string(), "1.0".to_string()),
            ])),
            ..Default::default()
        });
        let mut desired = its_with_image("db:1.1");
        desired.spec.template.metadata = Some(ObjectMeta {
            annotations: Some(BTreeMap::from([(ANNO_SERVICE_VERSION.to_string(), "1.1".to_string())])),
            ..Default::default()
        });
        keep_template_annotations(&existing, &mut desired);
        let a = desired.spec.template.metadata.and_then(|m| m.annotations).unwrap_or_default();
        assert_eq!(a.get("kubectl.kubernetes.io/restartedAt").map(String::as_str), Some("2024-05-01T00:00:00Z"));
        assert_eq!(a.get(ANNO_SERVICE_VERSION).map(String::as_str), Some("1.1"));
    }

    #[test]
    fn storage_requests_are_read_from_claim_specs() {
        let spec = json!({"resources": {"requests": {"storage": "10Gi"}}});
        assert_eq!(requested_storage(&spec), Some(10.0 * 1024f64.powi(3)));
        assert_eq!(requested_storage(&json!({})), None);
    }

    #[test]
    fn join_list_is_sorted_and_comma_joined() {
        let d = ScaleDecision {
            join_pending: ["c-a-2".to_string(), "c-a-1".to_string()].into_iter().collect(),
            ..Default::default()
        };
        assert_eq!(join_list(&d), "c-a-1,c-a-2");
    }
}
