#![forbid(unsafe_code)]

//! Queue consumers and the periodic housekeeping pass.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::watch;
use walkdir::WalkDir;

use crate::{
    catalog::Catalog,
    config::WorkerSettings,
    jobs::{JobOutcome, JobRunner},
    pipeline::SCRATCH_PREFIX,
    queue::TaskQueue,
};

/// A fixed number of consumers pulling from the task queue.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    queue: TaskQueue,
    runner: JobRunner,
    concurrency: usize,
    lease: Duration,
    max_attempts: u32,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(queue: TaskQueue, runner: JobRunner, settings: &WorkerSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue,
                runner,
                concurrency: settings.concurrency.max(1),
                lease: settings.lease,
                max_attempts: settings.max_attempts.max(1),
                poll_interval: settings.poll_interval,
            }),
        }
    }

    /// Claims and runs one task. `Ok(None)` means the queue was empty.
    ///
    /// The task is acked once the job reached an outcome. Infrastructure
    /// errors leave it leased so it is redelivered after the lease, until it
    /// runs out of attempts and its job is failed.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>> {
        let claimed = self
            .inner
            .queue
            .claim(self.inner.lease, self.inner.max_attempts)
            .await?;
        let Some(task) = claimed else {
            self.inner.queue.retire_exhausted(self.inner.max_attempts).await?;
            return Ok(None);
        };
        let outcome = self
            .inner
            .runner
            .run(&task)
            .await
            .with_context(|| format!("running job {} from task {}", task.job_id, task.task_id))?;
        self.inner.queue.ack(&task.task_id).await?;
        info!("task={} job={} acked", task.task_id, task.job_id);
        Ok(Some(outcome))
    }

    /// Drains the queue with every consumer and returns how many tasks were
    /// finished. A consumer stops at the first infrastructure error.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut handles = Vec::with_capacity(self.inner.concurrency);
        for slot in 0..self.inner.concurrency {
            let pool = self.clone();
            handles.push(tokio::spawn(async move {
                let mut finished = 0usize;
                loop {
                    match pool.process_next().await {
                        Ok(Some(_)) => finished += 1,
                        Ok(None) => break,
                        Err(err) => {
                            error!("worker={slot} {err:#}");
                            break;
                        }
                    }
                }
                finished
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.context("worker task panicked")?;
        }
        Ok(total)
    }

    /// Runs the consumers until `shutdown` flips to true. A running job is
    /// finished before its consumer exits.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut handles = Vec::with_capacity(self.inner.concurrency);
        for slot in 0..self.inner.concurrency {
            let pool = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                info!("worker={slot} started");
                while !*shutdown.borrow() {
                    let idle = match pool.process_next().await {
                        Ok(Some(_)) => false,
                        Ok(None) => true,
                        Err(err) => {
                            error!("worker={slot} {err:#}");
                            true
                        }
                    };
                    if idle {
                        tokio::select! {
                            _ = tokio::time::sleep(pool.inner.poll_interval) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                info!("worker={slot} stopped");
            }));
        }
        for handle in handles {
            handle.await.context("worker task panicked")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub exhausted_jobs_failed: usize,
    pub stale_jobs_failed: u64,
    pub scratch_dirs_removed: usize,
}

/// Maintenance pass. Running it twice in a row is harmless: the second run
/// finds nothing left to do.
pub struct Housekeeper {
    catalog: Catalog,
    queue: TaskQueue,
    scratch_root: PathBuf,
    max_attempts: u32,
    stale_job_age: Duration,
    scratch_max_age: Duration,
}

impl Housekeeper {
    pub fn new(catalog: Catalog, scratch_root: PathBuf, settings: &WorkerSettings) -> Self {
        Self {
            queue: TaskQueue::new(catalog.clone()),
            catalog,
            scratch_root,
            max_attempts: settings.max_attempts.max(1),
            stale_job_age: settings.stale_job_age,
            scratch_max_age: settings.job_time_limit,
        }
    }

    pub async fn run_once(&self) -> Result<HousekeepingReport> {
        let mut report = HousekeepingReport::default();

        report.exhausted_jobs_failed = self.queue.retire_exhausted(self.max_attempts).await?;

        let age = chrono::Duration::from_std(self.stale_job_age)
            .context("stale job age out of range")?;
        report.stale_jobs_failed = self
            .catalog
            .fail_orphaned_jobs(
                Utc::now() - age,
                "Scraping job went stale without a queue task",
            )
            .await?;

        let root = self.scratch_root.clone();
        let max_age = self.scratch_max_age;
        report.scratch_dirs_removed =
            tokio::task::spawn_blocking(move || sweep_scratch(&root, max_age, SystemTime::now()))
                .await
                .context("scratch sweep panicked")??;

        info!(
            "housekeeping exhausted={} stale={} scratch_removed={}",
            report.exhausted_jobs_failed, report.stale_jobs_failed, report.scratch_dirs_removed
        );
        Ok(report)
    }
}

/// Removes scratch directories older than `max_age` left behind by crashed
/// processes. A missing root is not an error.
fn sweep_scratch(root: &Path, max_age: Duration, now: SystemTime) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("scanning {}", root.display()))?;
        if !entry.file_type().is_dir()
            || !entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX)
        {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .unwrap_or(now);
        let age = now.duration_since(modified).unwrap_or_default();
        if age < max_age {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(err) => warn!("could not remove {}: {err}", entry.path().display()),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{JobStatus, testing::submit},
        extractor::testing::FakeDownloader,
        pipeline::testing::harness,
    };
    use libsql::params;
    use std::fs;

    const VIDEO: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    fn settings() -> WorkerSettings {
        WorkerSettings {
            concurrency: 2,
            poll_interval: Duration::from_millis(20),
            ..WorkerSettings::default()
        }
    }

    #[tokio::test]
    async fn pool_drains_the_queue_and_acks() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let queue = TaskQueue::new(h.catalog.clone());
        let pool = WorkerPool::new(
            queue.clone(),
            JobRunner::new(h.pipeline.clone(), &settings()),
            &settings(),
        );

        let mut jobs = Vec::new();
        for url in [VIDEO, "https://www.youtube.com/watch?v=aaaaaaaaaaa"] {
            let (submission, job) = submit(&h.catalog, url).await?;
            queue
                .enqueue(&job.id, &submission.canonical_url, submission.url_type)
                .await?;
            jobs.push(job.id);
        }

        assert_eq!(pool.run_until_idle().await?, 2);
        assert_eq!(queue.depth().await?, 0);
        assert_eq!(queue.leased_count().await?, 0);
        for id in jobs {
            let job = h.catalog.get_job(&id).await?.context("job")?;
            assert_eq!(job.status, JobStatus::Completed);
        }
        assert_eq!(pool.run_until_idle().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let queue = TaskQueue::new(h.catalog.clone());
        let pool = WorkerPool::new(
            queue.clone(),
            JobRunner::new(h.pipeline.clone(), &settings()),
            &settings(),
        );
        let (submission, job) = submit(&h.catalog, VIDEO).await?;
        queue
            .enqueue(&job.id, &submission.canonical_url, submission.url_type)
            .await?;

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run(rx).await }
        });
        for _ in 0..100 {
            let status = h.catalog.get_job(&job.id).await?.context("job")?.status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(true)?;
        tokio::time::timeout(Duration::from_secs(5), running).await???;

        let job = h.catalog.get_job(&job.id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn housekeeping_fails_exhausted_and_stale_jobs_once() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let queue = TaskQueue::new(h.catalog.clone());
        let worker_settings = WorkerSettings {
            max_attempts: 1,
            ..settings()
        };
        let keeper = Housekeeper::new(
            h.catalog.clone(),
            h.pipeline.scratch_root().to_path_buf(),
            &worker_settings,
        );

        let (submission, exhausted_job) = submit(&h.catalog, VIDEO).await?;
        queue
            .enqueue(&exhausted_job.id, &submission.canonical_url, submission.url_type)
            .await?;
        queue.claim(Duration::ZERO, 1).await?;

        let (_, stale_job) = submit(&h.catalog, "https://youtu.be/aaaaaaaaaaa").await?;
        let conn = h.catalog.connect().await?;
        conn.execute(
            "UPDATE scraping_jobs SET updated_at = ?2 WHERE id = ?1",
            params![stale_job.id.as_str(), "2000-01-01T00:00:00.000Z"],
        )
        .await?;

        let first = keeper.run_once().await?;
        assert_eq!(first.exhausted_jobs_failed, 1);
        assert_eq!(first.stale_jobs_failed, 1);
        assert_eq!(queue.leased_count().await?, 0);

        let job = h.catalog.get_job(&exhausted_job.id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some(format!("Scraping job {} abandoned after 1 attempts", exhausted_job.id).as_str())
        );
        let job = h.catalog.get_job(&stale_job.id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Failed);

        assert_eq!(keeper.run_once().await?, HousekeepingReport::default());
        Ok(())
    }

    #[tokio::test]
    async fn pool_fails_jobs_whose_task_ran_out_of_attempts() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let queue = TaskQueue::new(h.catalog.clone());
        let worker_settings = WorkerSettings {
            max_attempts: 2,
            ..settings()
        };
        let pool = WorkerPool::new(
            queue.clone(),
            JobRunner::new(h.pipeline.clone(), &worker_settings),
            &worker_settings,
        );
        let (submission, job) = submit(&h.catalog, VIDEO).await?;
        queue
            .enqueue(&job.id, &submission.canonical_url, submission.url_type)
            .await?;
        h.catalog.begin_job(&job.id).await?;
        queue.claim(Duration::ZERO, 2).await?;
        queue.claim(Duration::ZERO, 2).await?;

        assert!(pool.process_next().await?.is_none());
        assert_eq!(queue.leased_count().await?, 0);
        let job = h.catalog.get_job(&job.id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(h.downloader.extract_calls.lock().is_empty());
        Ok(())
    }

    #[test]
    fn sweep_removes_only_old_scratch_dirs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir(dir.path().join("ingest-old"))?;
        fs::write(dir.path().join("ingest-old/partial.mp4"), b"x")?;
        fs::create_dir(dir.path().join("unrelated"))?;
        fs::write(dir.path().join("ingest-file"), b"x")?;

        let now = SystemTime::now();
        assert_eq!(sweep_scratch(dir.path(), Duration::from_secs(3600), now)?, 0);
        let later = now + Duration::from_secs(7200);
        assert_eq!(sweep_scratch(dir.path(), Duration::from_secs(3600), later)?, 1);
        assert!(!dir.path().join("ingest-old").exists());
        assert!(dir.path().join("unrelated").exists());
        assert!(dir.path().join("ingest-file").exists());

        assert_eq!(sweep_scratch(&dir.path().join("missing"), Duration::ZERO, now)?, 0);
        Ok(())
    }
}
