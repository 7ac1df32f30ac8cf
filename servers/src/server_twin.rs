//! # Printer Fleet Twin Server
//!
//! Keeps a digital twin of every printer bound to the proxy account.
//!
//! ## Functionality:
//! - **Fleet admission**: lists devices on a fixed cadence, stores metadata,
//!   seeds default shadows and upserts the `printers` table.
//! - **Realtime sessions**: devices given with `--watch` are polled through
//!   bounded realtime sessions; their diffs are logged as JSON.
//! - **Supervisor**: a periodic line with live sessions against capacity.
//! - **Graceful Shutdown**: `tokio-graceful` stops every loop on signal and
//!   leaves the watched shadows marked not-live.
//!
//! Configuration comes from `server_twin.json` (or `--config-path`), then
//! `TWIN_*` environment variables and flags; `.env` files are honoured.

mod twin_logic;

use std::time::Duration;

use clap::Parser;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lib_twin::core::bootstrap_shadows;
use lib_twin::loggers::init_tracing;

use twin_logic::config::{Cli, load_config};
use twin_logic::runtime::TwinRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let _guard = match init_tracing(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };
    info!("{}", config);

    let runtime = TwinRuntime::build(&config).await?;

    match bootstrap_shadows(&runtime.gateway).await {
        Ok(created) => info!(created, "shadows bootstrapped from fleet index"),
        Err(e) => warn!(error = %e, "shadow bootstrap failed"),
    }
    match runtime.reads.fleet().await {
        Ok(fleet) => info!(devices = fleet.len(), "fleet loaded from store"),
        Err(e) => warn!(error = %e, "cannot read fleet from store"),
    }

    let shutdown = Shutdown::default();
    let cancel = CancellationToken::new();
    let watch = cli.watch_list();

    let TwinRuntime {
        bus: _,
        gateway: _,
        reads: _,
        manager,
        fleet_job,
        supervisor,
    } = runtime_with_watch(runtime, &watch);

    shutdown.spawn_task_fn({
        let cancel = cancel.clone();
        let manager = manager.clone();
        move |guard: ShutdownGuard| async move {
            guard.cancelled().await;
            info!("Signal received: initiate graceful shutdown");
            manager.shutdown();
            cancel.cancel();
        }
    });

    shutdown.spawn_task_fn({
        let cancel = cancel.clone();
        move |_guard: ShutdownGuard| async move { fleet_job.run(cancel).await }
    });

    shutdown.spawn_task_fn({
        let cancel = cancel.clone();
        move |_guard: ShutdownGuard| async move { supervisor.run(cancel).await }
    });

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            error!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    // Let the session loops write their final not-live flags.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// Subscribes the watch list and spawns the diff logger.
fn runtime_with_watch(runtime: TwinRuntime, watch: &[String]) -> TwinRuntime {
    if watch.is_empty() {
        return runtime;
    }

    let mut diffs = runtime.watch(watch);
    info!(devices = ?watch, "watching devices");
    tokio::spawn(async move {
        while let Some(diff) = diffs.recv().await {
            match serde_json::to_string(&*diff) {
                Ok(line) => info!(device_id = %diff.device_id, diff = %line, "shadow diff"),
                Err(e) => warn!(error = %e, "cannot encode diff"),
            }
        }
    });
    runtime
}
