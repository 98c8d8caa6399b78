use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::core::DynamicObject;
use metrics::counter;
use tracing::{debug, info, warn};
use trellis_core::api::dataprotection::{Backup, BackupSpec, DataProtectionPhase, Restore, RestoreSpec};
use trellis_core::api::workload::InstanceSet;
use trellis_core::labels::{
    clone_backup_name, clone_restore_name, component_labels, desired_pod_names, pvc_name, ANNO_MEMBER_JOIN_PENDING,
    LABEL_CLONE_SESSION, LABEL_ROLE,
};
use trellis_core::{Error, Result};
use trellis_graph::{Dag, Vertex, VertexId};
use trellis_kubehub::{Kind, ObjectKey};
use trellis_ops::{tolerate_not_implemented, OpsError, PodTarget};
use trellis_status::is_pod_ready;

use crate::context::{Component, ScaleDecision};
use crate::stage::{dynamic, is_terminating, list_owned, stage_delete, typed};
use crate::transformers::backup::clone_policy_name;
use crate::{TransformContext, Transformer};

/// Decides the replica count each workload is written with and runs the member protocol around
/// it: leave (with switchover off a departing leader) before scale-in, data clone before
/// scale-out, join once new pods are up. The workload step writes what this step decided.
pub struct ScaleTransformer;

#[async_trait]
impl Transformer for ScaleTransformer {
    fn name(&self) -> &'static str {
        "scale"
    }

    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        for comp in ctx.components.clone() {
            let decision = scale_component(ctx, dag, &comp).await?;
            ctx.scale.insert(comp.name.clone(), decision);
        }
        Ok(())
    }
}

enum CloneState {
    /// Every restore finished; the ids tear the session down after the workload write.
    Done(Vec<VertexId>),
    InProgress,
    Failed(String),
}

fn pending_joins(existing: &InstanceSet) -> BTreeSet<String> {
    existing
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNO_MEMBER_JOIN_PENDING))
        .map(|s| s.split(',').filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

fn target(ns: &str, pod: &str, pods: &BTreeMap<String, Pod>) -> PodTarget {
    PodTarget {
        namespace: ns.to_string(),
        pod: pod.to_string(),
        pod_ip: pods.get(pod).and_then(|p| p.status.as_ref()?.pod_ip.clone()),
    }
}

fn is_leader(pod: Option<&Pod>, leader_role: Option<&str>) -> bool {
    let (Some(pod), Some(role)) = (pod, leader_role) else { return false };
    pod.metadata.labels.as_ref().and_then(|l| l.get(LABEL_ROLE)).is_some_and(|r| r == role)
}

async fn scale_component(ctx: &mut TransformContext, dag: &mut Dag, comp: &Component) -> Result<ScaleDecision> {
    let ns = ctx.namespace().to_string();
    let workload = ctx.workload_name(&comp.name);
    let desired = comp.desired_replicas();
    let Some(existing) = ctx.reader.get::<InstanceSet>(Some(&ns), &workload).await? else {
        return Ok(ScaleDecision { replicas: desired, offline: comp.spec.offline_instances.clone(), ..Default::default() });
    };

    let caps = comp.capabilities();
    let actions = comp.def.spec.lifecycle_actions;
    let current = desired_pod_names(&workload, existing.spec.replicas, &existing.spec.offline_instances);
    let wanted = desired_pod_names(&workload, desired, &comp.spec.offline_instances);
    let removed: Vec<String> = current.difference(&wanted).cloned().collect();
    let added: BTreeSet<String> = wanted.difference(&current).cloned().collect();

    let pods: BTreeMap<String, Pod> = ctx
        .reader
        .list::<Pod>(Some(&ns), &component_labels(ctx.name(), &comp.name))
        .await?
        .into_iter()
        .filter_map(|p| Some((p.metadata.name.clone()?, p)))
        .collect();

    let mut decision = ScaleDecision {
        replicas: desired,
        offline: comp.spec.offline_instances.clone(),
        join_pending: pending_joins(&existing),
        after_workload: Vec::new(),
    };

    // A held clone keeps the old replica set, so nothing may leave or lose its volume yet.
    let clones = caps.data_clone
        && comp.def.spec.data_clone.is_some()
        && !comp.spec.volume_claim_templates.is_empty()
        && existing.spec.replicas > 0;
    if !added.is_empty() && clones {
        match data_clone(ctx, dag, comp, &workload, &added).await? {
            CloneState::Done(cleanup) => {
                decision.after_workload.extend(cleanup);
                ctx.clone_failed.remove(&comp.name);
            }
            CloneState::InProgress => {
                decision.replicas = existing.spec.replicas;
                decision.offline = existing.spec.offline_instances.clone();
                ctx.requeue(ctx.config.clone_poll, format!("{}: data clone in progress", comp.name));
                return Ok(decision);
            }
            CloneState::Failed(why) => {
                warn!(cluster = %ctx.name(), component = %comp.name, %why, "data clone failed");
                decision.replicas = existing.spec.replicas;
                decision.offline = existing.spec.offline_instances.clone();
                ctx.clone_failed.insert(comp.name.clone());
                ctx.requeue(ctx.config.clone_poll, format!("{}: data clone failed", comp.name));
                return Ok(decision);
            }
        }
    } else if added.is_empty() {
        decision.after_workload.extend(reap_clone_session(ctx, dag, &workload).await?);
    }

    if !removed.is_empty() {
        if desired > 0 && caps.member_join_leave && actions.member_leave {
            leave_members(ctx, comp, &removed, &wanted, &pods).await?;
        }
        if desired > 0 {
            for pod in &removed {
                for tpl in &comp.spec.volume_claim_templates {
                    let key = ObjectKey::for_kind::<PersistentVolumeClaim>(Some(&ns), pvc_name(&tpl.name, pod));
                    if let Some(pvc) = ctx.reader.get_dynamic(&key).await? {
                        if !is_terminating(&pvc) {
                            decision.after_workload.push(stage_delete(dag, pvc)?);
                        }
                    }
                }
            }
        }
        for pod in &removed {
            decision.join_pending.remove(pod);
        }
        counter!("trellis_scale_total", 1u64, "direction" => "in");
        info!(cluster = %ctx.name(), component = %comp.name, from = existing.spec.replicas, to = desired, "scaling in");
    }

    if !added.is_empty() {
        if caps.member_join_leave && actions.member_join {
            decision.join_pending.extend(added.iter().cloned());
        }
        counter!("trellis_scale_total", 1u64, "direction" => "out");
        info!(cluster = %ctx.name(), component = %comp.name, from = existing.spec.replicas, to = desired, "scaling out");
    }

    if !decision.join_pending.is_empty() {
        drain_joins(ctx, &mut decision.join_pending, &pods).await;
        if !decision.join_pending.is_empty() {
            ctx.requeue(ctx.config.retry_after, format!("{}: members waiting to join", comp.name));
        }
    }
    Ok(decision)
}

/// Leaving pods hand leadership over first, then leave the membership. An unreachable sidecar
/// is logged and skipped: the pod is going away regardless.
async fn leave_members(
    ctx: &TransformContext,
    comp: &Component,
    removed: &[String],
    remaining: &BTreeSet<String>,
    pods: &BTreeMap<String, Pod>,
) -> Result<()> {
    let ns = ctx.namespace();
    let leader_role = comp.def.leader_role().map(|r| r.name.as_str());
    let candidate = remaining.iter().find(|p| pods.get(*p).is_some_and(is_pod_ready)).map(String::as_str);
    for pod in removed {
        let t = target(ns, pod, pods);
        if comp.capabilities().switchover
            && comp.def.spec.lifecycle_actions.switchover
            && is_leader(pods.get(pod), leader_role)
        {
            match tolerate_not_implemented(ctx.ops.switchover(&t, candidate).await) {
                Ok(()) => debug!(cluster = %ctx.name(), %pod, ?candidate, "switchover before leave"),
                Err(OpsError::Unreachable(_)) => warn!(cluster = %ctx.name(), %pod, "sidecar unreachable; skipping switchover"),
                Err(e) => return Err(Error::Ops(e.to_string())),
            }
        }
        match tolerate_not_implemented(ctx.ops.leave_member(&t).await) {
            Ok(()) => debug!(cluster = %ctx.name(), %pod, "member left"),
            Err(OpsError::Unreachable(_)) => warn!(cluster = %ctx.name(), %pod, "sidecar unreachable; skipping member leave"),
            Err(e) => return Err(Error::Ops(e.to_string())),
        }
    }
    Ok(())
}

/// Joins pods that are ready and addressable; the rest stay pending for a later pass.
async fn drain_joins(ctx: &TransformContext, pending: &mut BTreeSet<String>, pods: &BTreeMap<String, Pod>) {
    for pod in pending.clone() {
        let Some(p) = pods.get(&pod) else { continue };
        if !is_pod_ready(p) || p.status.as_ref().and_then(|s| s.pod_ip.as_ref()).is_none() {
            continue;
        }
        match tolerate_not_implemented(ctx.ops.join_member(&target(ctx.namespace(), &pod, pods)).await) {
            Ok(()) => {
                pending.remove(&pod);
                debug!(cluster = %ctx.name(), %pod, "member joined");
            }
            Err(e) => warn!(cluster = %ctx.name(), %pod, error = %e, "member join failed; will retry"),
        }
    }
}

async fn data_clone(
    ctx: &TransformContext,
    dag: &mut Dag,
    comp: &Component,
    workload: &str,
    added: &BTreeSet<String>,
) -> Result<CloneState> {
    let ns = ctx.namespace().to_string();
    let Some(policy) = &comp.def.spec.data_clone else { return Ok(CloneState::Done(Vec::new())) };
    let backup_name = clone_backup_name(workload);
    let session_meta = |name: String| {
        let mut meta = ctx.owned_meta(name, Some(comp));
        if let Some(l) = meta.labels.as_mut() {
            l.insert(LABEL_CLONE_SESSION.to_string(), workload.to_string());
        }
        meta
    };

    let Some(backup_obj) = ctx.reader.get_dynamic(&ObjectKey::for_kind::<Backup>(Some(&ns), backup_name.clone())).await? else {
        let mut backup = Backup::new(
            &backup_name,
            BackupSpec {
                backup_policy_name: clone_policy_name(ctx, comp, &policy.backup_method).await?,
                backup_method: policy.backup_method.clone(),
            },
        );
        backup.metadata = session_meta(backup_name.clone());
        dag.add_vertex(Vertex::create(dynamic(&backup)?)?);
        info!(cluster = %ctx.name(), component = %comp.name, backup = %backup_name, "data clone backup requested");
        return Ok(CloneState::InProgress);
    };
    let backup: Backup = typed(&backup_obj)?;
    match backup.phase() {
        Some(DataProtectionPhase::Completed) => {}
        Some(DataProtectionPhase::Failed) => return Ok(CloneState::Failed(format!("backup {backup_name} failed"))),
        _ => return Ok(CloneState::InProgress),
    }

    let mut finished = vec![backup_obj];
    let mut waiting = false;
    for pod in added {
        let name = clone_restore_name(pod);
        match ctx.reader.get_dynamic(&ObjectKey::for_kind::<Restore>(Some(&ns), name.clone())).await? {
            None => {
                let volume_claims = comp.spec.volume_claim_templates.iter().map(|t| pvc_name(&t.name, pod)).collect();
                let mut restore = Restore::new(
                    &name,
                    RestoreSpec { backup_name: backup_name.clone(), target_pod: pod.clone(), volume_claims },
                );
                restore.metadata = session_meta(name);
                dag.add_vertex(Vertex::create(dynamic(&restore)?)?);
                waiting = true;
            }
            Some(obj) => {
                let restore: Restore = typed(&obj)?;
                match restore.phase() {
                    Some(DataProtectionPhase::Completed) => finished.push(obj),
                    Some(DataProtectionPhase::Failed) => return Ok(CloneState::Failed(format!("restore {name} failed"))),
                    _ => waiting = true,
                }
            }
        }
    }
    if waiting {
        return Ok(CloneState::InProgress);
    }
    let mut cleanup = Vec::with_capacity(finished.len());
    for obj in finished {
        if !is_terminating(&obj) {
            cleanup.push(stage_delete(dag, obj)?);
        }
    }
    info!(cluster = %ctx.name(), component = %comp.name, pods = added.len(), "data clone finished");
    Ok(CloneState::Done(cleanup))
}

/// Leftover clone objects of an abandoned scale-out.
async fn reap_clone_session(ctx: &TransformContext, dag: &mut Dag, workload: &str) -> Result<Vec<VertexId>> {
    let selector = BTreeMap::from([(LABEL_CLONE_SESSION.to_string(), workload.to_string())]);
    let mut leftovers: Vec<DynamicObject> = Vec::new();
    for kind in [Kind::of::<Backup>(), Kind::of::<Restore>()] {
        leftovers.extend(list_owned(&ctx.reader, &kind, ctx.namespace(), &selector).await?);
    }
    let mut ids = Vec::new();
    for obj in leftovers.into_iter().filter(|o| !is_terminating(o)) {
        ids.push(stage_delete(dag, obj)?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;

    fn pod(name: &str, role: Option<&str>) -> Pod {
        let mut p = Pod::default();
        p.metadata.name = Some(name.into());
        if let Some(r) = role {
            p.metadata.labels = Some(BTreeMap::from([(LABEL_ROLE.to_string(), r.to_string())]));
        }
        p.status = Some(PodStatus { pod_ip: Some("10.0.0.1".into()), ..Default::default() });
        p
    }

    #[test]
    fn pending_joins_parse_the_annotation() {
        let mut its = InstanceSet::new("c-a", Default::default());
        its.metadata.annotations =
            Some(BTreeMap::from([(ANNO_MEMBER_JOIN_PENDING.to_string(), "c-a-1,,c-a-2".to_string())]));
        let got = pending_joins(&its);
        assert_eq!(got.into_iter().collect::<Vec<_>>(), vec!["c-a-1", "c-a-2"]);
        assert!(pending_joins(&InstanceSet::new("c-a", Default::default())).is_empty());
    }

    #[test]
    fn leader_is_read_from_the_role_label() {
        let p = pod("c-a-0", Some("primary"));
        assert!(is_leader(Some(&p), Some("primary")));
        assert!(!is_leader(Some(&p), Some("leader")));
        assert!(!is_leader(Some(&pod("c-a-1", None)), Some("primary")));
        assert!(!is_leader(None, Some("primary")));
    }

    #[test]
    fn targets_carry_the_pod_ip_when_known() {
        let pods = BTreeMap::from([("c-a-0".to_string(), pod("c-a-0", None))]);
        assert_eq!(target("ns", "c-a-0", &pods).pod_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(target("ns", "c-a-9", &pods).pod_ip, None);
    }
}
