// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! radrouted
//!
//! Background process running the router, processor, and dispatcher loops
//! over one shared data directory.

use radroute_adapters::bookkeeper::Bookkeeper;
use radroute_adapters::runner::RunnerBackend;
use radroute_adapters::target::TargetRegistry;
use radroute_core::clock::SystemClock;
use radroute_daemon::{lifecycle, Config, DispatcherLoop, LifecycleError, ProcessorLoop, RouterLoop};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

const DEFAULT_CONFIG_DIR: &str = "/etc/radroute";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let config_dir = if args.len() > 1 {
        PathBuf::from(&args[1])
    } else {
        PathBuf::from(DEFAULT_CONFIG_DIR)
    };

    let config = Config::for_dir(config_dir);
    let daemon = lifecycle::startup(&config)?;
    let _log_guard = setup_logging(&daemon.data_dir)?;

    info!(config = %config.config_dir.display(), "radrouted starting");

    let settings = {
        let mut watcher = daemon.settings.lock().unwrap_or_else(|e| e.into_inner());
        watcher.snapshot()
    };
    let sink = Arc::new(Bookkeeper::from_settings(&settings));
    let runner = Arc::new(RunnerBackend::from_settings(&settings));
    let registry = Arc::new(TargetRegistry::default());
    let clock = SystemClock;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let router = RouterLoop::new(
        Arc::clone(&daemon.settings),
        Arc::clone(&daemon.catalog),
        Arc::clone(&sink),
        clock.clone(),
    );
    let processor = ProcessorLoop::new(
        Arc::clone(&daemon.settings),
        Arc::clone(&daemon.catalog),
        Arc::clone(&sink),
        runner,
        clock.clone(),
    );
    let dispatcher = DispatcherLoop::new(
        Arc::clone(&daemon.settings),
        Arc::clone(&daemon.catalog),
        Arc::clone(&sink),
        registry,
        clock,
    );

    let mut loops = tokio::task::JoinSet::new();
    loops.spawn(router.run(shutdown_rx.clone()));
    loops.spawn(processor.run(shutdown_rx.clone()));
    loops.spawn(dispatcher.run(shutdown_rx));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    // Loops finish their in-flight tasks before exiting
    let _ = shutdown_tx.send(true);
    while loops.join_next().await.is_some() {}

    daemon.shutdown();
    info!("radrouted stopped");
    Ok(())
}

fn setup_logging(
    data_dir: &Path,
) -> Result<tracing_appender::non_blocking::WorkerGuard, LifecycleError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let file_appender = tracing_appender::rolling::never(data_dir, "radrouted.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
