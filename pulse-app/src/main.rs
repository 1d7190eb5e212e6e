use anyhow::Result;
use clap::Parser;
use pulse_api::{ApiServer, AppState};
use pulse_config::ConfigManager;
use pulse_engine::AnomalyEngine;
use std::{path::PathBuf, sync::Arc};
use tokio::{signal, sync::watch, task::JoinHandle};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file. Without it, defaults plus
    /// PULSESCAN_* environment variables are used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Disable API server
    #[arg(long)]
    no_api: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Print the resolved configuration as YAML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.debug, args.json_logs);

    let manager = match &args.config {
        Some(path) => ConfigManager::from_file(path)?,
        None => ConfigManager::from_env()?,
    };
    manager.validate()?;

    if args.print_config {
        print!("{}", manager.to_yaml()?);
        return Ok(());
    }

    info!("Starting PulseScan");
    let config = manager.into_config();

    let engine = Arc::new(AnomalyEngine::from_config(config.clone())?);
    engine.start().await?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let api_handle = if config.api.enabled && !args.no_api {
        let server = ApiServer::new(&config.api, AppState::new(engine.clone()))?;
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(e) = server.run(shutdown).await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        info!("API server disabled");
        None
    };

    wait_for_shutdown().await;

    info!("Initiating graceful shutdown...");
    shutdown(&engine, shutdown_tx, api_handle).await?;

    info!("PulseScan stopped");
    Ok(())
}

/// Stops the API before the engine so no request sees closed storage.
async fn shutdown(
    engine: &AnomalyEngine,
    shutdown_tx: watch::Sender<bool>,
    api_handle: Option<JoinHandle<()>>,
) -> Result<()> {
    let _ = shutdown_tx.send(true);
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            warn!("API server task ended abnormally: {}", e);
        }
    }

    engine.stop().await?;
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received terminate signal, shutting down..."),
    }
}

fn init_logging(debug: bool, json: bool) {
    let env_filter = if debug { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    #[tokio::test]
    async fn test_shutdown_stops_api_before_engine() {
        let engine = Arc::new(AnomalyEngine::from_config(Default::default()).unwrap());
        engine.start().await.unwrap();

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let engine_running = Arc::new(AtomicBool::new(false));
        let observed = engine_running.clone();
        let api_engine = engine.clone();
        let api_handle = tokio::spawn(async move {
            let _ = shutdown_rx.changed().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            observed.store(api_engine.is_running(), Ordering::SeqCst);
        });

        shutdown(&engine, shutdown_tx, Some(api_handle)).await.unwrap();

        assert!(engine_running.load(Ordering::SeqCst));
        assert!(!engine.is_running());
    }
}
