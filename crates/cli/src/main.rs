use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use trellis_controller::runtime::{self, RunOptions};
use trellis_controller::required_kinds;
use trellis_core::config::parse_port_range;
use trellis_core::Config;
use trellis_kubehub::{missing_kinds, KubeEvents, KubeStore};
use trellis_ops::HttpSidecar;
use trellis_plan::Services;

#[derive(Parser, Debug)]
#[command(name = "trellisd", version, about = "Trellis database cluster controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Watch a single namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run(RunArgs),
    /// Report custom kinds the API server does not serve
    Check,
}

/// Flags override the TRELLIS_* environment read by `Config::from_env`.
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Passes in flight at once (0 = unbounded)
    #[arg(long, env = "TRELLIS_CONCURRENCY", default_value_t = 8)]
    concurrency: u16,
    /// Requeue delay after a failed pass, seconds
    #[arg(long)]
    retry_secs: Option<u64>,
    /// Resync interval for settled clusters, seconds
    #[arg(long)]
    resync_secs: Option<u64>,
    /// Sidecar port on each database pod
    #[arg(long)]
    sidecar_port: Option<u16>,
    /// Host port range, lo-hi
    #[arg(long)]
    host_port_range: Option<String>,
    /// Start even when custom kinds are missing
    #[arg(long)]
    skip_check: bool,
}

impl RunArgs {
    fn config(&self) -> Result<Config> {
        let mut cfg = Config::from_env();
        if let Some(s) = self.retry_secs {
            cfg.retry_after = Duration::from_secs(s);
        }
        if let Some(s) = self.resync_secs {
            cfg.resync_after = Duration::from_secs(s);
        }
        if let Some(p) = self.sidecar_port {
            cfg.sidecar_port = p;
        }
        if let Some(r) = &self.host_port_range {
            match parse_port_range(r) {
                Some(range) => cfg.host_port_range = range,
                None => bail!("invalid --host-port-range {r:?}; expected lo-hi"),
            }
        }
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let client = kube::Client::try_default().await?;

    match cli.command {
        Commands::Check => {
            let missing = missing_kinds(client, &required_kinds()).await?;
            match cli.output {
                Output::Human if missing.is_empty() => println!("all kinds served"),
                Output::Human => {
                    for k in &missing {
                        println!("missing • {k}");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&missing)?),
            }
            if !missing.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Run(args) => {
            let config = args.config()?;
            if !args.skip_check {
                let missing = missing_kinds(client.clone(), &required_kinds()).await?;
                if !missing.is_empty() {
                    bail!("{} custom kind(s) not served; install the CRDs or pass --skip-check", missing.len());
                }
            }
            info!(
                retry_secs = config.retry_after.as_secs(),
                resync_secs = config.resync_after.as_secs(),
                sidecar_port = config.sidecar_port,
                "config loaded"
            );
            let ops = HttpSidecar::new(config.sidecar_port, config.ops_timeout);
            let services = Services::new(
                Arc::new(KubeStore::new(client.clone())),
                Arc::new(KubeEvents::new(client.clone(), "trellisd")),
                Arc::new(ops),
                config,
            );
            let opts = RunOptions { namespace: cli.namespace, concurrency: args.concurrency };
            runtime::run(client, services, opts).await?;
        }
    }
    Ok(())
}

fn init_tracing() {
    let env = std::env::var("TRELLIS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TRELLIS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TRELLIS_METRICS_ADDR; expected host:port");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = RunArgs { retry_secs: Some(1), host_port_range: Some("40000-40010".into()), ..Default::default() };
        let cfg = args.config().expect("valid flags");
        assert_eq!(cfg.retry_after, Duration::from_secs(1));
        assert_eq!(cfg.host_port_range, (40000, 40010));
    }

    #[test]
    fn bad_port_range_is_rejected() {
        let args = RunArgs { host_port_range: Some("9-1".into()), ..Default::default() };
        assert!(args.config().is_err());
    }

    #[test]
    fn run_parses_with_defaults() {
        let cli = Cli::try_parse_from(["trellisd", "--ns", "db", "run", "--skip-check"]).expect("parses");
        assert_eq!(cli.namespace.as_deref(), Some("db"));
        assert!(matches!(cli.command, Commands::Run(RunArgs { skip_check: true, .. })));
    }
}
