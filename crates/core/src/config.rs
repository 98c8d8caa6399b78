//! Process tunables, read once at start.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Requeue delay after a failed pass.
    pub retry_after: Duration,
    /// Periodic resync of a settled cluster.
    pub resync_after: Duration,
    /// Poll interval while a data clone or member change is in flight.
    pub clone_poll: Duration,
    pub default_backup_cron: String,
    pub tools_image: String,
    pub sidecar_port: u16,
    /// How long a pod may stay not-ready before it counts as failed.
    pub pod_failed_timeout: Duration,
    pub host_port_range: (u16, u16),
    pub ops_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_after: Duration::from_secs(5),
            resync_after: Duration::from_secs(300),
            clone_poll: Duration::from_secs(10),
            default_backup_cron: "0 18 * * *".to_string(),
            tools_image: "trellis/tools:latest".to_string(),
            sidecar_port: 3501,
            pod_failed_timeout: Duration::from_secs(60),
            host_port_range: (30000, 32767),
            ops_timeout: Duration::from_secs(10),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

pub fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    let (lo, hi) = s.split_once('-')?;
    let lo = lo.trim().parse::<u16>().ok()?;
    let hi = hi.trim().parse::<u16>().ok()?;
    (lo <= hi).then_some((lo, hi))
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        let host_port_range = match std::env::var("TRELLIS_HOST_PORT_RANGE") {
            Ok(s) => parse_port_range(&s).unwrap_or_else(|| {
                warn!(value = %s, "invalid TRELLIS_HOST_PORT_RANGE; expected lo-hi");
                d.host_port_range
            }),
            Err(_) => d.host_port_range,
        };
        Self {
            retry_after: env_secs("TRELLIS_RETRY_SECS", d.retry_after),
            resync_after: env_secs("TRELLIS_RESYNC_SECS", d.resync_after),
            clone_poll: env_secs("TRELLIS_CLONE_REQUEUE_SECS", d.clone_poll),
            default_backup_cron: env_string("TRELLIS_DEFAULT_BACKUP_CRON", &d.default_backup_cron),
            tools_image: env_string("TRELLIS_TOOLS_IMAGE", &d.tools_image),
            sidecar_port: std::env::var("TRELLIS_SIDECAR_PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(d.sidecar_port),
            pod_failed_timeout: env_secs("TRELLIS_POD_FAILED_TIMEOUT_SECS", d.pod_failed_timeout),
            host_port_range,
            ops_timeout: env_secs("TRELLIS_OPS_TIMEOUT_SECS", d.ops_timeout),
        }
    }
}
