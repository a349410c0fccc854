use std::net::SocketAddr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use datavolume_controller::controller::{self, parse_label, ControllerConfig};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the DataVolume controllers
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Only watch DataVolumes in this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Address of the metrics and health endpoint
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Label stamped on every created PVC, as key=value (repeatable)
    #[arg(long = "installer-label", env = "INSTALLER_LABELS", value_delimiter = ',', value_parser = parse_label)]
    installer_labels: Vec<(String, String)>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Override the HonorWaitForFirstConsumer feature gate
    #[arg(long, env = "HONOR_WFFC")]
    honor_wffc: Option<bool>,

    /// Override the DataVolumeClaimAdoption feature gate
    #[arg(long, env = "CLAIM_ADOPTION")]
    claim_adoption: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("DataVolume Controller v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn run_controller(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(args.log_json);

    info!(
        "Starting DataVolume Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    #[cfg(feature = "metrics")]
    {
        let addr = args.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = datavolume_controller::server::run_server(addr).await {
                tracing::error!("Metrics server error: {:?}", e);
            }
        });
    }

    let config = ControllerConfig {
        installer_labels: args.installer_labels.into_iter().collect(),
        honor_wffc: args.honor_wffc,
        claim_adoption: args.claim_adoption,
    };

    controller::run_controllers(client, config, args.namespace).await?;

    info!("Controllers stopped");
    Ok(())
}
