use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use tracing::warn;
use trellis_cache::{ComponentRef, PortKey};
use trellis_core::api::definition::{ComponentField, CredentialKey, Var};
use trellis_core::labels::{
    desired_pod_names, env_config_name, workload_name, ANNO_HOST_PORTS, LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY,
    MANAGED_BY,
};
use trellis_core::{Error, Result};
use trellis_graph::{Action, Dag};
use trellis_kubehub::ObjectKey;

use crate::context::Component;
use crate::stage::{dynamic, stage};
use crate::{TransformContext, Transformer};

const NAME: &str = "vars";

/// Resolves definition vars into the per-component env ConfigMap, assigning host ports on the
/// way. The first pass in a process reserves every port recorded on any env ConfigMap in the
/// store, so a restart keeps them whichever cluster is reconciled first.
pub struct VarsTransformer;

#[async_trait]
impl Transformer for VarsTransformer {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        let ns = ctx.namespace().to_string();
        if ctx.ports.needs_seed() {
            seed_host_ports(ctx).await?;
        }
        let mut host_ports = BTreeMap::new();
        for comp in &ctx.components {
            let name = env_config_name(ctx.name(), &comp.name);
            let observed = ctx.reader.get_dynamic(&ObjectKey::for_kind::<ConfigMap>(Some(&ns), name.clone())).await?;

            let mut recorded: BTreeMap<String, u16> = BTreeMap::new();
            if let Some(hn) = &comp.def.spec.host_network {
                let previous: BTreeMap<String, u16> = observed
                    .as_ref()
                    .and_then(|o| o.metadata.annotations.as_ref()?.get(ANNO_HOST_PORTS).cloned())
                    .map(|s| serde_json::from_str(&s))
                    .transpose()?
                    .unwrap_or_default();
                for (k, port) in previous {
                    if let Some((container, port_name)) = k.split_once('/') {
                        let key = port_key(ctx, comp, container, port_name);
                        if !ctx.ports.reserve(key, port) {
                            warn!(cluster = %ctx.name(), component = %comp.name, port, "recorded host port taken; reallocating");
                        }
                    }
                }
                for cp in &hn.container_ports {
                    let port = ctx
                        .ports
                        .allocate(&port_key(ctx, comp, &cp.container, &cp.port))
                        .map_err(|e| Error::transform(NAME, e.to_string()))?;
                    recorded.insert(format!("{}/{}", cp.container, cp.port), port);
                    host_ports.insert((comp.name.clone(), cp.container.clone(), cp.port.clone()), port);
                }
            }

            let mut data = BTreeMap::new();
            for var in &comp.def.spec.vars {
                data.insert(var.name.clone(), resolve(ctx, comp, var, &host_ports)?);
            }

            let mut meta = ctx.owned_meta(name, Some(comp));
            if !recorded.is_empty() {
                meta.annotations = Some(BTreeMap::from([(ANNO_HOST_PORTS.to_string(), serde_json::to_string(&recorded)?)]));
            }
            let cm = ConfigMap { metadata: meta, data: Some(data), ..Default::default() };
            stage(dag, dynamic(&cm)?, observed, Action::Patch)?;
        }
        ctx.host_ports.extend(host_ports);
        Ok(())
    }
}

async fn seed_host_ports(ctx: &TransformContext) -> Result<()> {
    let selector = BTreeMap::from([(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string())]);
    let maps: Vec<ConfigMap> = ctx.reader.list(None, &selector).await?;
    let mut recorded = Vec::new();
    for cm in &maps {
        let meta = &cm.metadata;
        let Some(raw) = meta.annotations.as_ref().and_then(|a| a.get(ANNO_HOST_PORTS)) else { continue };
        let labels = meta.labels.as_ref();
        let (Some(ns), Some(cluster), Some(component)) = (
            meta.namespace.as_deref(),
            labels.and_then(|l| l.get(LABEL_INSTANCE)),
            labels.and_then(|l| l.get(LABEL_COMPONENT)),
        ) else {
            continue;
        };
        let ports: BTreeMap<String, u16> = match serde_json::from_str(raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(configmap = ?meta.name, error = %e, "unreadable host port record");
                continue;
            }
        };
        let comp = ComponentRef::new(ns, cluster, component);
        for (k, port) in ports {
            if let Some((container, port_name)) = k.split_once('/') {
                recorded.push((PortKey { comp: comp.clone(), container: container.into(), port: port_name.into() }, port));
            }
        }
    }
    ctx.ports.seed(recorded);
    Ok(())
}

fn port_key(ctx: &TransformContext, comp: &Component, container: &str, port: &str) -> PortKey {
    PortKey { comp: ctx.component_ref(&comp.name), container: container.to_string(), port: port.to_string() }
}

fn resolve(
    ctx: &TransformContext,
    comp: &Component,
    var: &Var,
    host_ports: &BTreeMap<(String, String, String), u16>,
) -> Result<String> {
    if let Some(v) = &var.value {
        return Ok(v.clone());
    }
    let Some(src) = &var.value_from else { return Ok(String::new()) };
    if let Some(r) = &src.component_ref {
        let target = match &r.comp_def {
            Some(prefix) => ctx.components.iter().find(|c| c.def_name().starts_with(prefix.as_str())).ok_or_else(|| {
                Error::transform(NAME, format!("var {}: no component with definition {prefix}", var.name))
            })?,
            None => comp,
        };
        let workload = workload_name(ctx.name(), &target.name);
        let pods = || desired_pod_names(&workload, target.desired_replicas(), &target.spec.offline_instances);
        return Ok(match r.field {
            ComponentField::ShortName => target.name.clone(),
            ComponentField::Replicas => target.desired_replicas().to_string(),
            ComponentField::PodNames => pods().into_iter().collect::<Vec<_>>().join(","),
            ComponentField::PodFqdns => pods()
                .into_iter()
                .map(|p| format!("{p}.{workload}-headless.{}.svc.cluster.local", ctx.namespace()))
                .collect::<Vec<_>>()
                .join(","),
        });
    }
    if let Some(r) = &src.credential_ref {
        let password = ctx
            .credentials
            .get(&(comp.name.clone(), r.account.clone()))
            .ok_or_else(|| Error::transform(NAME, format!("var {}: account {} not declared", var.name, r.account)))?;
        return Ok(match r.key {
            CredentialKey::Username => r.account.clone(),
            CredentialKey::Password => password.clone(),
        });
    }
    if let Some(r) = &src.host_network_ref {
        return host_ports
            .get(&(comp.name.clone(), r.container.clone(), r.port.clone()))
            .map(|p| p.to_string())
            .ok_or_else(|| Error::transform(NAME, format!("var {}: host port {}/{} not declared", var.name, r.container, r.port)));
    }
    Ok(String::new())
}
