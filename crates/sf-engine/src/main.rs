use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use sf_config::{EngineConfig, HumanDuration};
use sf_runtime::lifecycle::{Collaborators, Pipeline, wait_for_signal};
use sf_runtime::tracing_init::init_tracing;

#[derive(Parser)]
#[command(name = "streamfold", about = "StreamFold windowed aggregation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until SIGINT/SIGTERM
    Run {
        /// Path to streamfold.toml config file
        #[arg(short, long)]
        config: PathBuf,
        /// Enable runtime metrics and periodic snapshot output
        #[arg(long)]
        metrics: bool,
        /// Override metrics report interval (e.g. "2s", "30s", "1m")
        #[arg(long)]
        metrics_interval: Option<String>,
        /// Override metrics listen address for /metrics endpoint
        #[arg(long)]
        metrics_listen: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            metrics,
            metrics_interval,
            metrics_listen,
        } => {
            let config_path = config
                .canonicalize()
                .map_err(|e| anyhow::anyhow!("config path '{}': {e}", config.display()))?;
            let mut engine_config = EngineConfig::load(&config_path)?;
            if metrics || metrics_interval.is_some() || metrics_listen.is_some() {
                engine_config.metrics.enabled = true;
            }
            if let Some(interval) = metrics_interval {
                engine_config.metrics.report_interval = HumanDuration::from_str(&interval)
                    .map_err(|e| anyhow::anyhow!("invalid --metrics-interval '{interval}': {e}"))?;
            }
            if let Some(listen) = metrics_listen {
                engine_config.metrics.prometheus_listen = listen;
            }
            let base_dir = config_path
                .parent()
                .ok_or_else(|| anyhow::anyhow!("config path '{}' has no parent", config_path.display()))?;
            engine_config.resolve_paths(base_dir);

            let _guard = init_tracing(&engine_config.logging, base_dir)?;

            let parts = Collaborators::from_config(&engine_config);
            let source = engine_config.source.path.clone();
            let pipeline = Pipeline::start(engine_config, parts)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            tracing::info!(
                domain = "sys",
                source = %source.display(),
                recovered_checkpoint = ?pipeline.recovered_checkpoint(),
                "StreamFold pipeline started"
            );
            if let Some(addr) = pipeline.metrics_addr() {
                tracing::info!(domain = "res", listen = %addr, "runtime metrics enabled");
            }

            wait_for_signal(pipeline.cancel_token()).await;
            pipeline.shutdown();
            pipeline.wait().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        }
    }

    Ok(())
}
