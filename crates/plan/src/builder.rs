//! Plan builder state machine and the built plan.

use std::collections::BTreeSet;
use std::time::Duration;

use kube::core::DynamicObject;
use tracing::{debug, info, warn};
use trellis_apply::Executor;
use trellis_core::api::cluster::{Cluster, ComponentSpec};
use trellis_core::api::definition::{ClusterDefinition, ClusterTopology, ComponentDefinition};
use trellis_core::conditions::{apply_failed, provisioning_failed, provisioning_started, set_condition, Condition};
use trellis_core::{Error, Outcome, Result};
use trellis_graph::{Action, Dag, Slot};
use trellis_kubehub::{ObjectKey, StoreReader};

use crate::context::{Component, Services, TransformContext};
use crate::transformers::default_chain;
use crate::TransformerChain;

/// Delay before retrying a pass that lost a write race.
const CONFLICT_RETRY: Duration = Duration::from_secs(1);

pub struct PlanBuilder {
    services: Services,
    namespace: String,
    name: String,
    chain: TransformerChain,
    ctx: Option<TransformContext>,
}

impl PlanBuilder {
    pub fn new(services: Services, namespace: &str, name: &str) -> Self {
        Self { services, namespace: namespace.to_string(), name: name.to_string(), chain: default_chain(), ctx: None }
    }

    pub fn with_chain(mut self, chain: TransformerChain) -> Self {
        self.chain = chain;
        self
    }

    fn executor(&self) -> Executor {
        Executor::new(self.services.store.clone(), self.services.events.clone())
    }

    fn ctx_mut(&mut self) -> Result<&mut TransformContext> {
        self.ctx.as_mut().ok_or_else(|| Error::Validation("plan builder used before init".into()))
    }

    /// Load the root object. Fails with [`Error::RootNotFound`] when it is gone.
    pub async fn init(&mut self) -> Result<()> {
        let key = ObjectKey::for_kind::<Cluster>(Some(&self.namespace), self.name.clone());
        let reader = StoreReader::new(self.services.store.clone());
        let Some(obj) = reader.get_dynamic(&key).await? else {
            return Err(Error::RootNotFound(format!("{}/{}", self.namespace, self.name)));
        };
        let cluster: Cluster = crate::stage::typed(&obj)?;
        self.ctx = Some(TransformContext::new(cluster, obj, &self.services));
        Ok(())
    }

    /// Resolve definitions and consolidate components. A failure is recorded on the root as
    /// `ProvisioningStarted=False` before it is returned.
    pub async fn validate(&mut self) -> Result<()> {
        let ctx = self.ctx_mut()?;
        match resolve(ctx).await {
            Ok((cluster_def, topology, components)) => {
                let generation = ctx.generation();
                ctx.cluster_def = cluster_def;
                ctx.topology = topology;
                ctx.components = components;
                let status = ctx.cluster.status.get_or_insert_with(Default::default);
                set_condition(&mut status.conditions, provisioning_started(generation));
                Ok(())
            }
            Err(e) => {
                let (pristine, generation) = (ctx.pristine_obj.clone(), ctx.generation());
                self.record_failure(&pristine, &e, |m| provisioning_failed(generation, m)).await;
                Err(e)
            }
        }
    }

    /// Run the transformer chain. The first failing transformer aborts the chain; its error is
    /// recorded on the root before it is returned.
    pub async fn build(mut self) -> Result<Plan> {
        let mut ctx = self.ctx.take().ok_or_else(|| Error::Validation("plan builder used before init".into()))?;
        let mut dag = Dag::new();
        let built = match self.chain.run(&mut ctx, &mut dag).await {
            Ok(()) => anchor_root(&mut dag),
            Err(e) => Err(e),
        };
        if let Err(e) = built {
            if !e.is_conflict() {
                let generation = ctx.generation();
                self.record_failure(&ctx.pristine_obj, &e, |m| provisioning_failed(generation, m)).await;
            }
            return Err(e);
        }
        debug!(cluster = %ctx.name(), vertices = dag.len(), changes = dag.has_changes(), "plan built");
        Ok(Plan {
            dag,
            executor: self.executor(),
            pristine: ctx.pristine_obj.clone(),
            generation: ctx.generation(),
            cluster: format!("{}/{}", ctx.namespace(), ctx.name()),
            outcome: ctx.into_outcome(),
        })
    }

    async fn record_failure(&self, pristine: &DynamicObject, err: &Error, cond: impl Fn(&str) -> Condition) {
        if let Err(e) = self.executor().record_conditions(pristine, vec![cond(&err.to_string())]).await {
            warn!(cluster = %self.name, error = %e, "could not record failure condition");
        }
    }
}

/// Everything except the root status write waits for the root object vertex, so the finalizer
/// lands before any owned object. On the delete path the deletion transformer wires the root.
fn anchor_root(dag: &mut Dag) -> Result<()> {
    let Some(root) = dag.root() else { return Ok(()) };
    if dag.get(root).action() == Action::Delete {
        return Ok(());
    }
    let others: Vec<_> = dag
        .order()?
        .into_iter()
        .filter(|&id| id != root && dag.get(id).slot() == Slot::Object)
        .collect();
    for id in others {
        dag.depend_on(id, root)?;
    }
    Ok(())
}

type Resolved = (Option<ClusterDefinition>, Option<ClusterTopology>, Vec<Component>);

async fn resolve(ctx: &TransformContext) -> Result<Resolved> {
    let spec = &ctx.cluster.spec;
    let deleting = ctx.is_deleting();
    let cluster_def = match spec.cluster_def.as_deref() {
        Some(name) => match ctx.reader.get::<ClusterDefinition>(None, name).await? {
            Some(cd) => Some(cd),
            None if deleting => None,
            None => return Err(Error::Validation(format!("cluster definition {name} not found"))),
        },
        None => None,
    };
    let topology = match &cluster_def {
        Some(cd) if !cd.spec.topologies.is_empty() => match cd.topology(spec.topology.as_deref()) {
            Some(t) => Some(t.clone()),
            None => return Err(Error::Validation(format!("topology {} not found", spec.topology.as_deref().unwrap_or("<default>")))),
        },
        _ => None,
    };

    let mut declared: Vec<(ComponentSpec, Option<String>)> =
        spec.component_specs.iter().map(|c| (c.clone(), None)).collect();
    for sh in &spec.shardings {
        for i in 0..sh.shards.max(0) {
            let mut c = sh.template.clone();
            c.name = format!("{}-{i}", sh.name);
            declared.push((c, Some(sh.name.clone())));
        }
    }

    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(declared.len());
    for (mut c, sharding) in declared {
        if !seen.insert(c.name.clone()) {
            return Err(Error::Validation(format!("duplicate component name {}", c.name)));
        }
        if c.component_def.is_empty() {
            let lookup = sharding.clone().unwrap_or_else(|| c.name.clone());
            let from_topology = topology
                .as_ref()
                .and_then(|t| t.components.iter().find(|tc| tc.name == lookup))
                .map(|tc| tc.comp_def.clone());
            match from_topology {
                Some(d) => c.component_def = d,
                None => return Err(Error::Validation(format!("component {} has no definition", c.name))),
            }
        }
        let def = match ctx.reader.get::<ComponentDefinition>(None, &c.component_def).await? {
            Some(d) if d.is_available() => d,
            Some(_) if !deleting => {
                return Err(Error::Validation(format!("component definition {} is not available", c.component_def)))
            }
            Some(d) => d,
            None if deleting => {
                warn!(component = %c.name, def = %c.component_def, "definition gone; component skipped");
                continue;
            }
            None => return Err(Error::Validation(format!("component definition {} not found", c.component_def))),
        };
        out.push(Component { name: c.name.clone(), sharding, spec: c, def });
    }
    Ok((cluster_def, topology, out))
}

/// A built graph ready to apply.
pub struct Plan {
    dag: Dag,
    executor: Executor,
    pristine: DynamicObject,
    generation: Option<i64>,
    cluster: String,
    outcome: Outcome,
}

impl Plan {
    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    /// Outcome the chain asked for, before execution.
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Apply the graph. A lost write race becomes a short requeue; any other failure is recorded
    /// as `ApplyResources=False` against the pristine root and returned.
    pub async fn execute(self) -> Result<Outcome> {
        match self.executor.execute(&self.dag).await {
            Ok(report) => {
                if report.writes > 0 {
                    info!(cluster = %self.cluster, writes = report.writes, events = report.events, "plan applied");
                }
                Ok(self.outcome)
            }
            Err(e) if e.is_conflict() => {
                debug!(cluster = %self.cluster, error = %e, "write conflict; requeue");
                Ok(Outcome::requeue(CONFLICT_RETRY, "conflict"))
            }
            Err(e) => {
                let cond = apply_failed(self.generation, &e.to_string());
                if let Err(re) = self.executor.record_conditions(&self.pristine, vec![cond]).await {
                    warn!(cluster = %self.cluster, error = %re, "could not record apply failure");
                }
                Err(e)
            }
        }
    }
}
