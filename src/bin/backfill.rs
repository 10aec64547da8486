#![forbid(unsafe_code)]

//! Maintenance binary that fills in placeholder video rows. `--seed` adds new
//! placeholders from video URLs; every run then drains the pending rows
//! through the regular fetch pipeline. Meant to run from cron.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{info, warn};
use tubeharvest::{
    catalog::Catalog,
    classifier::{UrlKind, inspect},
    config::{SettingsOverrides, init_logger, resolve_settings},
    pipeline::VideoPipeline,
    security::{ensure_not_root, ensure_private_dir},
    storage::{LocalBucket, ObjectStore},
    ytdlp::YtDlp,
};

#[derive(Debug, Parser)]
#[command(name = "backfill", about = "Fetches media for placeholder video rows")]
struct BackfillArgs {
    /// Alternative `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Video URL to register as a placeholder. May be repeated.
    #[arg(long = "seed", value_name = "URL")]
    seeds: Vec<String>,
    /// Pending rows fetched per round.
    #[arg(long, default_value_t = 25)]
    batch_size: u32,
    /// Only seed, do not fetch anything.
    #[arg(long)]
    seed_only: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct BackfillTally {
    done: usize,
    failed: usize,
    skipped: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let args = BackfillArgs::parse();
    ensure_not_root("backfill")?;

    let settings = resolve_settings(SettingsOverrides {
        env_path: args.env_file.clone(),
        data_root: args.data_root.clone(),
        ..SettingsOverrides::default()
    })?;
    let catalog = Catalog::open(&settings.database_path())
        .await
        .context("opening catalog")?;

    let seeded = seed_placeholders(&catalog, &args.seeds).await?;
    if seeded > 0 {
        info!("seeded {seeded} placeholder row(s)");
    }
    if args.seed_only {
        return Ok(());
    }

    YtDlp::new(&settings.extractor, &settings.pacing)
        .ensure_available()
        .await?;
    ensure_private_dir(&settings.download_path)?;
    let store: Arc<dyn ObjectStore> = Arc::new(LocalBucket::new(&settings.storage));
    let pipeline = VideoPipeline::from_settings(&settings, catalog, store)?;

    let tally = drain_pending(&pipeline, args.batch_size).await?;
    info!(
        "backfill complete: {} done, {} failed, {} skipped",
        tally.done, tally.failed, tally.skipped
    );
    Ok(())
}

/// Registers each URL as a pending row. Only single-video URLs are accepted.
async fn seed_placeholders(catalog: &Catalog, urls: &[String]) -> Result<usize> {
    let mut seeded = 0;
    for url in urls {
        let classified = inspect(url).with_context(|| format!("seed {url}"))?;
        if classified.kind != UrlKind::Video {
            bail!(
                "seed {url} is a {} URL, only videos can be backfilled",
                classified.kind.as_str()
            );
        }
        if catalog
            .insert_placeholder_video(&classified.identifier, &classified.canonical_url)
            .await?
        {
            seeded += 1;
        } else {
            info!("video={} already known, not seeding", classified.identifier);
        }
    }
    Ok(seeded)
}

/// Works through pending rows in batches until none are left, or until a
/// whole batch was claimed by other workers.
async fn drain_pending(pipeline: &VideoPipeline, batch_size: u32) -> Result<BackfillTally> {
    let mut tally = BackfillTally::default();
    loop {
        let batch = pipeline
            .catalog()
            .list_pending_videos(i64::from(batch_size.max(1)))
            .await?;
        if batch.is_empty() {
            break;
        }

        let mut claimed_any = false;
        for row in &batch {
            match pipeline.process_placeholder(row).await {
                Ok(None) => tally.skipped += 1,
                Ok(Some(report)) if report.success => {
                    claimed_any = true;
                    tally.done += 1;
                }
                Ok(Some(report)) => {
                    claimed_any = true;
                    tally.failed += 1;
                    warn!("video={} failed: {}", row.source_video_id, report.message);
                }
                Err(err) => {
                    tally.failed += 1;
                    warn!("video={} failed: {err}", row.source_video_id);
                }
            }
        }
        if !claimed_any {
            break;
        }
    }
    Ok(tally)
}
