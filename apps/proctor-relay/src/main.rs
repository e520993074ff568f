use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use proctor_relay::cli::{self, Cli, Commands};
use proctor_relay::config::RelayConfig;
use proctor_relay::telemetry::Telemetry;
use proctor_relay::{serve, AppState};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    if let Some(Commands::Watch {
        url,
        user,
        role,
        test,
    }) = cli.command
    {
        return cli::run_watch_client(url, user, role, test).await;
    }

    let config = RelayConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        registration_timeout_secs = config.registration_timeout.as_secs(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        active_tests = ?config.active_tests,
        "starting proctor-relay"
    );

    let state = Arc::new(AppState::new(&config, Some(telemetry.metrics_handle())));
    let recycler = (!config.idle_timeout.is_zero()).then(|| {
        state
            .directory()
            .spawn_recycler(config.idle_timeout, config.recycle_interval)
    });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    serve(listener, state, shutdown_signal()).await?;

    if let Some(recycler) = recycler {
        recycler.abort();
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
}
