use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use omniq_core::config::AppConfig;
use omniq_core::logging::init_logging;

mod app;

use app::Application;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("omniq")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-tenant task queue and scaling orchestrator")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("Log output format")
                .value_parser(["json", "pretty", "compact"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    let log_format = matches
        .get_one::<String>("log-format")
        .map(String::as_str)
        .unwrap_or("pretty");

    init_logging(log_level, log_format)?;

    let config = AppConfig::load(config_path).context("failed to load configuration")?;
    info!(
        config = config_path.unwrap_or("<defaults>"),
        "configuration loaded"
    );

    let app = Application::new(config).await?;

    let shutdown = CancellationToken::new();
    let mut app_handle = tokio::spawn(app.run(shutdown.clone()));

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
            shutdown.cancel();
        }
        finished = &mut app_handle => {
            // the service stopped on its own: propagate its verdict
            return match finished {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("service task panicked: {e}")),
            };
        }
    }

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(result)) => {
            result?;
            info!("service stopped");
        }
        Ok(Err(e)) => return Err(anyhow::anyhow!("service task panicked: {e}")),
        Err(_) => warn!("shutdown timed out, exiting anyway"),
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
