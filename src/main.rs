use anyhow::{Context, Result};
use clap::Parser;
use clap_serde_derive::ClapSerde;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::gateway::{router, AppState};
use crate::telemetry::init_telemetry;

mod auth;
mod config;
mod error;
mod gateway;
mod inference;
mod interpreter;
mod telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    // The default file is optional, an explicitly named one is not
    let file_config = if args.config_file == DEFAULT_CONFIG_FILE {
        Config::from_toml_if_present(&args.config_file)
    } else {
        Config::from_toml(&args.config_file).map(Some)
    }
    .with_context(|| format!("Failed to read configuration file {}", args.config_file))?;
    let config = match file_config {
        Some(conf) => conf.merge(&mut args.opt_config),
        None => Config::from(&mut args.opt_config),
    };

    let telemetry = init_telemetry(config.otel_endpoint(), config.console)?;
    if let Err(err) = config.validate() {
        exit_err!(1, "Invalid configuration: {:#}", err);
    }

    if config.api_key().is_none() {
        warn!("MOD_API_KEY is not set, /moderate accepts unauthenticated requests");
    }
    if config.inference_token().is_none() {
        warn!("HF_TOKEN is not set, /moderate will answer with a configuration error");
    }

    let state = AppState::from_config(&config)?;
    let router = router(state, config.max_upload_bytes);

    let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    info!(
        "Moderating through {} with threshold {:.2}",
        config.inference_url, config.threshold
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    telemetry.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for terminate signal: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down...");
}
