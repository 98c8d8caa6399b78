use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;
use trellis_core::api::cluster::ClusterBackup;
use trellis_core::api::dataprotection::{
    BackupPolicy, BackupPolicySpec, BackupPolicyTemplate, BackupPolicyTpl, BackupSchedule, BackupScheduleSpec,
    BackupTarget, SchedulePolicy,
};
use trellis_core::labels::{backup_policy_name, backup_schedule_name, component_labels, LABEL_CLUSTER_DEF, LABEL_SERVICE_KIND};
use trellis_core::Result;
use trellis_graph::{Action, Dag};
use trellis_kubehub::ObjectKey;

use crate::context::Component;
use crate::stage::{dynamic, stage, typed};
use crate::{TransformContext, Transformer};

/// Syncs a backup policy (and a schedule when the template declares one) per applicable
/// template and component, folding the cluster's own backup settings into the schedule.
pub struct BackupPolicyTransformer;

/// Templates are found by cluster definition when the cluster has one, by service kind
/// otherwise.
async fn templates_for(ctx: &TransformContext, comp: &Component) -> Result<Vec<BackupPolicyTemplate>> {
    let selector = match &ctx.cluster.spec.cluster_def {
        Some(cd) => BTreeMap::from([(LABEL_CLUSTER_DEF.to_string(), cd.clone())]),
        None => BTreeMap::from([(LABEL_SERVICE_KIND.to_string(), comp.def.spec.service_kind.clone())]),
    };
    let mut out: Vec<BackupPolicyTemplate> = ctx.reader.list(None, &selector).await?;
    out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    Ok(out)
}

/// Policy a data-clone backup of `comp` runs under: the first applicable template offering
/// `method`, else the first applicable one.
pub(crate) async fn clone_policy_name(ctx: &TransformContext, comp: &Component, method: &str) -> Result<String> {
    let mut fallback = None;
    for tpl in templates_for(ctx, comp).await? {
        let Some(entry) = tpl.spec.backup_policies.iter().find(|p| p.matches_component_def(comp.def_name())) else {
            continue;
        };
        if entry.backup_methods.iter().any(|m| m.name == method) {
            return Ok(backup_policy_name(ctx.name(), &comp.name, tpl.spec.identifier.as_deref()));
        }
        fallback.get_or_insert(tpl.spec.identifier);
    }
    Ok(backup_policy_name(ctx.name(), &comp.name, fallback.flatten().as_deref()))
}

/// Apply the cluster's backup block to the template schedules. Selecting a method switches the
/// competing methods off.
pub(crate) fn merge_schedules(
    mut schedules: Vec<SchedulePolicy>,
    backup: Option<&ClusterBackup>,
    default_cron: &str,
) -> Vec<SchedulePolicy> {
    for s in schedules.iter_mut() {
        if s.cron_expression.is_empty() {
            s.cron_expression = default_cron.to_string();
        }
    }
    let Some(b) = backup else { return schedules };
    let Some(method) = b.method.as_deref() else { return schedules };
    let enabled = b.enabled.unwrap_or(false);
    for s in schedules.iter_mut() {
        if s.backup_method == method {
            s.enabled = enabled;
            if let Some(cron) = &b.cron_expression {
                s.cron_expression = cron.clone();
            }
            if b.retention_period.is_some() {
                s.retention_period = b.retention_period.clone();
            }
        } else if enabled {
            s.enabled = false;
        }
    }
    schedules
}

#[async_trait]
impl Transformer for BackupPolicyTransformer {
    fn name(&self) -> &'static str {
        "backup-policy"
    }

    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        let ns = ctx.namespace().to_string();
        for comp in &ctx.components {
            for tpl in templates_for(ctx, comp).await? {
                let Some(entry) = tpl.spec.backup_policies.iter().find(|p| p.matches_component_def(comp.def_name())) else {
                    continue;
                };
                let id = tpl.spec.identifier.as_deref();
                let policy_name = backup_policy_name(ctx.name(), &comp.name, id);
                let policy_id = sync_policy(ctx, dag, comp, entry, &policy_name, &ns).await?;
                if entry.schedules.is_empty() {
                    continue;
                }
                let schedules =
                    merge_schedules(entry.schedules.clone(), ctx.cluster.spec.backup.as_ref(), &ctx.config.default_backup_cron);
                let name = backup_schedule_name(ctx.name(), &comp.name, id);
                let mut schedule = BackupSchedule::new(&name, BackupScheduleSpec { backup_policy_name: policy_name.clone(), schedules });
                schedule.metadata = ctx.owned_meta(name.clone(), Some(comp));
                let observed = ctx.reader.get_dynamic(&ObjectKey::for_kind::<BackupSchedule>(Some(&ns), name)).await?;
                let schedule_id = stage(dag, dynamic(&schedule)?, observed, Action::Patch)?;
                dag.depend_on(schedule_id, policy_id)?;
                debug!(cluster = %ctx.name(), component = %comp.name, policy = %policy_name, "backup policy synced");
            }
        }
        Ok(())
    }
}

async fn sync_policy(
    ctx: &TransformContext,
    dag: &mut Dag,
    comp: &Component,
    entry: &BackupPolicyTpl,
    name: &str,
    ns: &str,
) -> Result<trellis_graph::VertexId> {
    let observed = ctx.reader.get_dynamic(&ObjectKey::for_kind::<BackupPolicy>(Some(ns), name)).await?;
    let mut spec = BackupPolicySpec {
        backup_repo_name: None,
        path_prefix: None,
        target: BackupTarget { role: entry.target_role.clone(), selector: component_labels(ctx.name(), &comp.name) },
        backup_methods: entry.backup_methods.clone(),
    };
    if let Some(obs) = &observed {
        let current: BackupPolicy = typed(obs)?;
        spec.backup_repo_name = current.spec.backup_repo_name;
        spec.path_prefix = current.spec.path_prefix;
    }
    let mut policy = BackupPolicy::new(name, spec);
    policy.metadata = ctx.owned_meta(name, Some(comp));
    stage(dag, dynamic(&policy)?, observed, Action::Patch)
}
