//! Trellis controller: one reconciliation pass per trigger, and the kube runtime loop that
//! schedules them.
//!
//! [`reconcile_pass`] is store-agnostic and is what tests drive against `MemStore`. The
//! [`runtime`] module binds it to a live API server.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};
use trellis_core::prelude::*;
use trellis_kubehub::Kind;
use trellis_plan::{PlanBuilder, Services};

pub mod runtime;

/// Custom kinds the controller reads or writes. Each must be served before it starts.
pub fn required_kinds() -> Vec<Kind> {
    vec![
        Kind::of::<Cluster>(),
        Kind::of::<ClusterDefinition>(),
        Kind::of::<ComponentDefinition>(),
        Kind::of::<InstanceSet>(),
        Kind::of::<ComponentParameter>(),
        Kind::of::<BackupPolicyTemplate>(),
        Kind::of::<BackupPolicy>(),
        Kind::of::<BackupSchedule>(),
        Kind::of::<Backup>(),
        Kind::of::<Restore>(),
    ]
}

/// Run Init, Validate, Build and Execute once for `namespace/name`.
///
/// A cluster that no longer exists has nothing left to reconcile and settles. A write conflict
/// means another pass (or another writer) got there first; it is retried like a requeue and
/// never surfaced as a failure.
pub async fn reconcile_pass(services: &Services, namespace: &str, name: &str) -> Result<Outcome> {
    let t0 = Instant::now();
    let res = run_pass(services, namespace, name).await;
    let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
    histogram!("trellis_reconcile_ms", took_ms);

    let res = match res {
        Err(Error::RootNotFound(_)) => {
            debug!(cluster = %name, namespace = %namespace, "cluster gone");
            Ok(Outcome::Settled)
        }
        Err(e) if e.is_conflict() => {
            debug!(cluster = %name, namespace = %namespace, error = %e, "write conflict; retrying");
            Ok(Outcome::requeue(services.config.retry_after, "write conflict"))
        }
        other => other,
    };
    match &res {
        Ok(Outcome::Settled) => {
            counter!("trellis_reconcile_total", 1u64, "result" => "settled");
            debug!(cluster = %name, took_ms = took_ms as u64, "pass settled");
        }
        Ok(Outcome::RequeueAfter { after, reason }) => {
            counter!("trellis_reconcile_total", 1u64, "result" => "requeue");
            counter!("trellis_requeue_total", 1u64);
            info!(cluster = %name, after_secs = after.as_secs(), %reason, "pass requeued");
        }
        Err(e) => {
            counter!("trellis_reconcile_total", 1u64, "result" => "error");
            warn!(cluster = %name, took_ms = took_ms as u64, error = %e, "pass failed");
        }
    }
    res
}

async fn run_pass(services: &Services, namespace: &str, name: &str) -> Result<Outcome> {
    let mut builder = PlanBuilder::new(services.clone(), namespace, name);
    builder.init().await?;
    builder.validate().await?;
    builder.build().await?.execute().await
}

/// The scheduler's next look at a cluster after a pass that did not fail. Settled clusters
/// still resync periodically.
pub fn next_action(outcome: &Outcome, config: &Config) -> Action {
    match outcome {
        Outcome::Settled => Action::requeue(config.resync_after),
        Outcome::RequeueAfter { after, .. } => Action::requeue(requeue_delay(*after, config)),
    }
}

/// Backoff after a failed pass.
pub fn retry_action(config: &Config) -> Action {
    Action::requeue(config.retry_after)
}

fn requeue_delay(after: Duration, config: &Config) -> Duration {
    if after.is_zero() {
        config.retry_after
    } else {
        after.min(config.resync_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_clusters_resync() {
        let cfg = Config::default();
        assert_eq!(next_action(&Outcome::Settled, &cfg), Action::requeue(cfg.resync_after));
    }

    #[test]
    fn requeue_delay_is_bounded() {
        let cfg = Config::default();
        let soon = Outcome::requeue(Duration::from_secs(7), "clone");
        assert_eq!(next_action(&soon, &cfg), Action::requeue(Duration::from_secs(7)));
        let zero = Outcome::requeue(Duration::ZERO, "join");
        assert_eq!(next_action(&zero, &cfg), Action::requeue(cfg.retry_after));
        let late = Outcome::requeue(Duration::from_secs(86_400), "far");
        assert_eq!(next_action(&late, &cfg), Action::requeue(cfg.resync_after));
    }

    #[test]
    fn required_kinds_are_distinct_trellis_kinds() {
        let kinds = required_kinds();
        let unique: std::collections::BTreeSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
        assert!(kinds.iter().all(|k| k.api_version.contains("trellis.io/")));
    }

    #[test]
    fn failures_back_off_by_retry_after() {
        let cfg = Config { retry_after: Duration::from_secs(2), ..Config::default() };
        assert_eq!(retry_action(&cfg), Action::requeue(Duration::from_secs(2)));
    }
}
