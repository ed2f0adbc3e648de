//! cape - Cluster API provider for externally provisioned clusters

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cape_common::kube_utils::create_client;
use cape_common::leader_election::{LeaderElector, LeaderGuard, LEADER_LEASE_NAME};
use cape_controller::Context;
use cape_operator::config::{Cli, Commands, LogFormat, RunArgs};
use cape_operator::controller_runner::{build_controllers, WatchScope};
use cape_operator::crds::render_crds;
use cape_operator::import::run_import;
use cape_operator::probes::{serve_probes, Readiness};
use cape_webhook::{KubeClusterLookup, WebhookServerConfig, WebhookState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Import(args) => run_import(&args).await,
        Commands::Crd => {
            let yaml = render_crds()
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRDs: {}", e))?;
            print!("{yaml}");
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    info!("External cluster provider starting...");
    info!(addr = %args.metrics_bind_addr, "Metrics endpoint is not served");

    let client = create_client(args.kubeconfig.as_deref()).await?;

    // probes and the webhook serve on every replica, leader or not
    let readiness = Readiness::default();
    let probes = tokio::spawn(serve_probes(args.health_addr, readiness.clone()));
    let webhook = if args.disable_webhook {
        info!("Admission webhook disabled");
        None
    } else {
        let state = Arc::new(WebhookState {
            clusters: Arc::new(KubeClusterLookup::new(client.clone())),
        });
        let config = WebhookServerConfig {
            addr: args.webhook_addr(),
            cert_dir: args.webhook_cert_dir.clone(),
        };
        Some(tokio::spawn(cape_webhook::serve(state, config)))
    };

    let mut leadership = if args.leader_elect {
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &args.leader_elect_namespace,
            &args.leader_identity(),
            args.lease_timing(),
        ));
        Some(elector.acquire().await)
    } else {
        None
    };

    let ctx = Arc::new(
        Context::builder(client.clone())
            .config(args.controller_config())
            .build(),
    );
    let scope = WatchScope {
        namespace: args.watch_namespace().map(str::to_string),
        concurrency: args.concurrency,
    };

    info!("Starting controllers...");
    let controllers = build_controllers(client, ctx, &scope);
    readiness.set_ready();

    let result = tokio::select! {
        _ = futures::future::join_all(controllers) => {
            info!("Controllers stopped");
            Ok(())
        }
        _ = leadership_lost(&mut leadership) => {
            error!("Leadership lost, exiting");
            Err(anyhow::anyhow!("leadership lost"))
        }
        result = probes => {
            Err(anyhow::anyhow!("probe server stopped: {:?}", result))
        }
        result = webhook_stopped(webhook) => {
            Err(anyhow::anyhow!("webhook server stopped: {}", result))
        }
    };

    if let Some(guard) = leadership {
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release leader lease");
        }
    }
    info!("External cluster provider shutting down");
    result
}

async fn leadership_lost(guard: &mut Option<LeaderGuard>) {
    match guard {
        Some(guard) => guard.lost().await,
        None => std::future::pending().await,
    }
}

async fn webhook_stopped(
    webhook: Option<tokio::task::JoinHandle<Result<(), cape_webhook::WebhookError>>>,
) -> String {
    match webhook {
        Some(handle) => match handle.await {
            Ok(Ok(())) => "exited".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        },
        None => std::future::pending().await,
    }
}
