//! clusterd — the cluster workload manager controller daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clusterd::{Config, Controller};

#[derive(Parser)]
#[command(name = "clusterd")]
#[command(about = "Centralized cluster workload manager controller")]
#[command(version)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short = 'f', long, default_value = "/etc/clusterd/clusterd.json")]
    config: PathBuf,

    /// Override the listen address from the configuration
    #[arg(long)]
    listen: Option<String>,

    /// Recover no job state, start with a clean table
    #[arg(long)]
    clean_start: bool,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(spec) => EnvFilter::new(spec),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    std::fs::create_dir_all(&config.state_save_location)
        .with_context(|| format!("creating state directory {}", config.state_save_location))?;

    info!(
        "starting controller for cluster {} ({} nodes, {} partitions)",
        config.cluster_name,
        config.nodes.len(),
        config.partitions.len()
    );

    let controller = Controller::new(config).map_err(|e| anyhow::anyhow!("{}", e))?;
    if !cli.clean_start {
        controller.recover();
    }

    // save state on SIGTERM/SIGINT before going down
    {
        let ctl = controller.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("caught interrupt, saving state");
            let _ = clusterd::state::dump_all_job_state(&ctl);
            ctl.begin_shutdown();
            std::process::exit(0);
        });
    }

    controller
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("controller failed: {}", e))
}
