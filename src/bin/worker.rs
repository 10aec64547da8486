#![forbid(unsafe_code)]

//! Queue consumer. Runs a fixed-size pool of job workers plus the periodic
//! housekeeping pass until Ctrl+C, or drains the queue once with `--once`.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::{signal, sync::watch};
use tubeharvest::{
    catalog::Catalog,
    config::{SettingsOverrides, init_logger, resolve_settings},
    jobs::JobRunner,
    pipeline::VideoPipeline,
    queue::TaskQueue,
    security::{ensure_not_root, ensure_private_dir},
    storage::{LocalBucket, ObjectStore},
    worker::{Housekeeper, WorkerPool},
    ytdlp::YtDlp,
};

#[derive(Debug, Parser)]
#[command(name = "worker", about = "Processes queued scraping jobs")]
struct WorkerArgs {
    /// Alternative `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Number of jobs processed in parallel.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Drain the queue once, run housekeeping, and exit.
    #[arg(long)]
    once: bool,
    #[arg(long)]
    no_housekeeping: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let args = WorkerArgs::parse();
    ensure_not_root("worker")?;

    let settings = resolve_settings(SettingsOverrides {
        env_path: args.env_file.clone(),
        data_root: args.data_root.clone(),
        concurrency: args.concurrency,
        ..SettingsOverrides::default()
    })?;

    YtDlp::new(&settings.extractor, &settings.pacing)
        .ensure_available()
        .await?;
    ensure_private_dir(&settings.download_path)?;

    let catalog = Catalog::open(&settings.database_path())
        .await
        .context("opening catalog")?;
    let store: Arc<dyn ObjectStore> = Arc::new(LocalBucket::new(&settings.storage));
    let pipeline = VideoPipeline::from_settings(&settings, catalog.clone(), store)?;
    let pool = WorkerPool::new(
        TaskQueue::new(catalog.clone()),
        JobRunner::new(pipeline, &settings.worker),
        &settings.worker,
    );
    let housekeeper = Housekeeper::new(
        catalog.clone(),
        settings.download_path.clone(),
        &settings.worker,
    );

    info!(
        "worker starting concurrency={} database={} scratch={}",
        settings.worker.concurrency,
        settings.database_path().display(),
        settings.download_path.display()
    );

    if args.once {
        let finished = pool.run_until_idle().await?;
        if !args.no_housekeeping {
            housekeeper.run_once().await?;
        }
        info!("queue drained, {finished} task(s) finished");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let housekeeping = (!args.no_housekeeping).then(|| {
        tokio::spawn(run_housekeeping(
            housekeeper,
            settings.worker.housekeeping_interval,
            shutdown_rx.clone(),
        ))
    });
    let consumers = tokio::spawn(async move { pool.run(shutdown_rx).await });

    shutdown_signal().await;
    info!("shutdown requested, waiting for running jobs");
    shutdown_tx.send(true).ok();

    consumers.await.context("worker pool panicked")??;
    if let Some(handle) = housekeeping {
        handle.await.context("housekeeping task panicked")?;
    }
    info!("worker stopped");
    Ok(())
}

/// Runs housekeeping right away and then every `every`, until shutdown.
async fn run_housekeeping(
    housekeeper: Housekeeper,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = housekeeper.run_once().await {
                    error!("housekeeping failed: {err:#}");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}
