//! Trellis plan: turns one Cluster into a staged graph of mutations.
//!
//! A pass runs `init -> validate -> build -> execute`. Transformers only read from the store and
//! stage vertices; the [`Plan`] hands the graph to the executor.

#![forbid(unsafe_code)]

use std::time::Instant;

use async_trait::async_trait;
use metrics::histogram;
use tracing::{debug, trace};
use trellis_core::Result;
use trellis_graph::Dag;

mod builder;
mod context;
mod stage;
pub mod transformers;

pub use builder::{Plan, PlanBuilder};
pub use context::{Component, ScaleDecision, Services, TransformContext};

/// One staging step. Implementations read the context, may read the store through
/// `ctx.reader`, and add vertices and edges to the graph. They never write to the store.
#[async_trait]
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()>;
}

/// Transformers that do not interact. Their relative order carries no meaning; they run one
/// after another.
pub struct Parallel(pub Vec<Box<dyn Transformer>>);

#[async_trait]
impl Transformer for Parallel {
    fn name(&self) -> &'static str {
        "parallel"
    }

    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        for t in &self.0 {
            run_one(t.as_ref(), ctx, dag).await?;
        }
        Ok(())
    }
}

/// Transformers in registration order; the first error aborts the rest.
#[derive(Default)]
pub struct TransformerChain {
    steps: Vec<Box<dyn Transformer>>,
}

impl TransformerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, t: impl Transformer + 'static) -> Self {
        self.steps.push(Box::new(t));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|t| t.name()).collect()
    }

    pub async fn run(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        for t in &self.steps {
            run_one(t.as_ref(), ctx, dag).await?;
            if ctx.is_halted() {
                debug!(cluster = %ctx.name(), after = t.name(), "chain halted");
                break;
            }
        }
        Ok(())
    }
}

async fn run_one(t: &dyn Transformer, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
    let t0 = Instant::now();
    let before = dag.len();
    let res = t.transform(ctx, dag).await;
    histogram!("trellis_transform_ms", t0.elapsed().as_secs_f64() * 1000.0, "transformer" => t.name());
    match &res {
        Ok(()) => trace!(transformer = t.name(), staged = dag.len() - before, "transformed"),
        Err(e) => debug!(transformer = t.name(), error = %e, "transformer failed"),
    }
    res
}
