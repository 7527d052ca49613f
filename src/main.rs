//! Intent Operator - creates a Job per Intent and fans out dependents on success

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio_util::sync::CancellationToken;

use intent_operator::controller::{Context, Controller, ControllerConfig, KubeJobClient};
use intent_operator::event::Event;
use intent_operator::queue::WorkQueue;
use intent_operator::shutdown::spawn_signal_handler;
use intent_operator::telemetry::{init_telemetry, TelemetryConfig};
use intent_operator::watch::WatchSource;
use intent_operator::Error;

/// Intent operator - turns Intent resources into Jobs
#[derive(Parser, Debug)]
#[command(name = "intent-operator", version, about, long_about = None)]
struct Cli {
    /// Path to a kubeconfig file
    ///
    /// Without it the in-cluster config or the default kubeconfig is used.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    if let Err(e) = run_controller(cli).await {
        tracing::error!(error = %e, "intent operator failed");
        std::process::exit(1);
    }

    tracing::info!("intent operator stopped");
    Ok(())
}

/// Build a client from an explicit kubeconfig, or infer one
async fn build_client(kubeconfig: Option<PathBuf>) -> Result<Client, Error> {
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(&path).map_err(|e| {
                Error::config(format!("failed to read kubeconfig {}: {e}", path.display()))
            })?;
            kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("invalid kubeconfig {}: {e}", path.display())))?
        }
        None => kube::Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kubernetes config: {e}")))?,
    };

    Ok(Client::try_from(config)?)
}

/// Run the watchers and worker pool until a shutdown signal
async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = build_client(cli.kubeconfig).await?;
    let config = ControllerConfig::default();

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let queue: WorkQueue<Event> = WorkQueue::new(config.rate_limiter());

    tracing::info!("Starting intent operator...");
    let watch = WatchSource::spawn(
        client.clone(),
        queue.clone(),
        shutdown.clone(),
        config.watch_timeout_secs,
    );

    tracing::info!("Waiting for caches to sync...");
    if !watch.wait_for_sync(&shutdown).await? {
        tracing::info!("Shutdown requested before caches synced");
        queue.shut_down();
        watch.stopped().await;
        return Ok(());
    }
    tracing::info!(workers = config.workers, "Caches synced, starting workers");

    let ctx = Context::new(
        Arc::new(KubeJobClient::new(client)),
        Arc::new(watch.job_cache()),
        Arc::new(watch.intent_cache()),
        config.clone(),
    );
    Controller::new(queue, Arc::new(ctx), config)
        .run(shutdown)
        .await;

    watch.stopped().await;
    Ok(())
}
