//! Command line for the `cape` binary

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use cape_common::leader_election::LeaseTiming;
use cape_controller::ControllerConfig;

/// Cluster API provider for externally provisioned clusters
#[derive(Parser, Debug)]
#[command(name = "cape", version, about, long_about = None)]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "CAPE_LOG_FORMAT", global = true)]
    pub log_format: LogFormat,

    #[allow(missing_docs)]
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controllers, the admission webhook, and the probe server
    Run(RunArgs),
    /// Adopt an existing cluster into the management cluster
    Import(ImportArgs),
    /// Print the provider's CRDs as YAML and exit
    Crd,
}

/// Flags of `cape run`
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Address the metrics endpoint binds to (accepted for compatibility)
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub metrics_bind_addr: SocketAddr,

    /// Address serving /healthz and /readyz
    #[arg(long, default_value = "0.0.0.0:9440")]
    pub health_addr: SocketAddr,

    /// Wait for a Lease before reconciling
    #[arg(long)]
    pub leader_elect: bool,

    /// How long a lease is valid without renewal
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub leader_elect_lease_duration: Duration,

    /// How long the leader keeps trying to renew before giving up
    #[arg(long, default_value = "40s", value_parser = parse_duration)]
    pub leader_elect_renew_deadline: Duration,

    /// Pause between leader election attempts
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub leader_elect_retry_period: Duration,

    /// Identity recorded as the Lease holder (random when unset)
    #[arg(long, env = "POD_NAME")]
    pub leader_elect_identity: Option<String>,

    /// Namespace holding the leader election Lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub leader_elect_namespace: String,

    /// Only watch this namespace (all namespaces when empty)
    #[arg(long, default_value = "")]
    pub namespace: String,

    /// Resync period for healthy resources
    #[arg(long, default_value = "10m", value_parser = parse_duration)]
    pub sync_period: Duration,

    /// Port the admission webhook listens on
    #[arg(long, default_value_t = 9443)]
    pub webhook_port: u16,

    /// Directory holding the webhook's tls.crt and tls.key
    #[arg(long, default_value = "/tmp/k8s-webhook-server/serving-certs/")]
    pub webhook_cert_dir: PathBuf,

    /// Do not serve the admission webhook
    #[arg(long)]
    pub disable_webhook: bool,

    /// Kubeconfig of the management cluster (in-cluster or KUBECONFIG when unset)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Only reconcile objects whose watch-filter label has this value
    #[arg(long)]
    pub watch_filter: Option<String>,

    /// Concurrent reconciles per controller
    #[arg(long, default_value_t = 10)]
    pub concurrency: u16,

    /// Bound on each call against an external cluster
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub remote_timeout: Duration,

    /// Ready nodes required for a control plane to be ready
    #[arg(long, default_value_t = 1)]
    pub min_ready_nodes: usize,

    /// How long a Machine may outlive its node before it is flagged
    #[arg(long, default_value = "10m", value_parser = parse_duration)]
    pub stale_machine_grace_period: Duration,
}

impl RunArgs {
    /// Tunables handed to the controllers
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            sync_period: self.sync_period,
            remote_timeout: self.remote_timeout,
            min_ready_nodes: self.min_ready_nodes,
            stale_machine_grace: self.stale_machine_grace_period,
            watch_filter: self.watch_filter.clone().filter(|f| !f.is_empty()),
            ..Default::default()
        }
    }

    /// Leader election timing
    pub fn lease_timing(&self) -> LeaseTiming {
        LeaseTiming {
            lease_duration: self.leader_elect_lease_duration,
            renew_deadline: self.leader_elect_renew_deadline,
            retry_period: self.leader_elect_retry_period,
        }
    }

    /// Lease holder identity
    pub fn leader_identity(&self) -> String {
        self.leader_elect_identity
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("cape-{:08x}", rand::random::<u32>()))
    }

    /// Namespace to watch, `None` for all
    pub fn watch_namespace(&self) -> Option<&str> {
        Some(self.namespace.as_str()).filter(|ns| !ns.is_empty())
    }

    /// Listen address of the admission webhook
    pub fn webhook_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.webhook_port))
    }
}

/// Flags of `cape import`
#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    /// Name of the Cluster to create
    #[arg(long)]
    pub cluster_name: String,

    /// Namespace to create the resources in
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Kubeconfig of the management cluster (in-cluster or KUBECONFIG when unset)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig file of the cluster being imported
    #[arg(long)]
    pub target_kubeconfig: PathBuf,
}

/// Parse a duration such as `1h`, `10m`, `30s`, or raw seconds
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let invalid = || format!("invalid duration '{s}', expected e.g. 1h, 10m, 30s");
    let (digits, scale) = if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else if let Some(minutes) = s.strip_suffix('m') {
        (minutes, 60)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else {
        (s, 1)
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(n * scale))
}
