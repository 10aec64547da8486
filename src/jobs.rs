#![forbid(unsafe_code)]

//! Drives one scraping job through its lifecycle:
//! `pending → processing → completed | failed`.
//!
//! The work itself runs in its own tokio task under a time limit, so a panic
//! or a hung backend turns into a failed job instead of a dead worker.

use std::{any::Any, time::Duration};

use anyhow::Result;
use log::{error, info, warn};

use crate::{
    catalog::JobStatus,
    classifier::UrlKind,
    collection::process_collection,
    config::WorkerSettings,
    pipeline::VideoPipeline,
    queue::ScrapeTask,
};

/// What happened to a delivered task. `Err` from [`JobRunner::run`] is kept
/// for infrastructure trouble, where the task should be redelivered.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { message: String },
    Failed { message: String },
    /// Redelivery of a job that already reached a terminal state.
    AlreadyFinished(JobStatus),
    /// The job row is gone.
    Missing,
}

/// Result of the dispatched work, before it is written to the job row.
struct WorkResult {
    success: bool,
    message: String,
    found: i64,
    processed: i64,
    title: Option<String>,
    description: Option<String>,
}

#[derive(Clone)]
pub struct JobRunner {
    pipeline: VideoPipeline,
    time_limit: Duration,
    max_collection_items: Option<u32>,
}

impl JobRunner {
    pub fn new(pipeline: VideoPipeline, settings: &WorkerSettings) -> Self {
        Self {
            pipeline,
            time_limit: settings.job_time_limit,
            max_collection_items: settings.max_collection_items,
        }
    }

    pub fn pipeline(&self) -> &VideoPipeline {
        &self.pipeline
    }

    pub async fn run(&self, task: &ScrapeTask) -> Result<JobOutcome> {
        let catalog = self.pipeline.catalog();
        let job_id = task.job_id.as_str();

        let Some(job) = catalog.get_job(job_id).await? else {
            warn!("job={job_id} task={} has no job row", task.task_id);
            return Ok(JobOutcome::Missing);
        };
        if job.status.is_terminal() {
            info!("job={job_id} already {}, skipping redelivery", job.status.as_str());
            return Ok(JobOutcome::AlreadyFinished(job.status));
        }
        if !catalog.begin_job(job_id).await? {
            let status = catalog
                .get_job(job_id)
                .await?
                .map(|job| job.status)
                .unwrap_or(JobStatus::Failed);
            return Ok(JobOutcome::AlreadyFinished(status));
        }

        match self.execute(task, &job.submission_id).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let message = format!("Unexpected error in scraping job {job_id}: {err:#}");
                error!("job={job_id} {message}");
                if catalog.fail_job(job_id, &message).await? {
                    Ok(JobOutcome::Failed { message })
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Everything after the job moved to processing. An `Err` here is caught
    /// by [`JobRunner::run`], which fails the job so it never stays stuck.
    async fn execute(&self, task: &ScrapeTask, submission_id: &str) -> Result<JobOutcome> {
        let catalog = self.pipeline.catalog();
        let job_id = task.job_id.as_str();

        let Some(submission) = catalog.get_submission(submission_id).await? else {
            let message = format!("Submission {submission_id} not found");
            catalog.fail_job(job_id, &message).await?;
            return Ok(JobOutcome::Failed { message });
        };
        if submission.url_type != task.url_kind || submission.canonical_url != task.canonical_url {
            warn!(
                "job={job_id} task says {} {}, submission says {} {}; using the submission",
                task.url_kind.as_str(),
                task.canonical_url,
                submission.url_type.as_str(),
                submission.canonical_url
            );
        }
        info!(
            "job={job_id} processing {} {} attempt={}",
            submission.url_type.as_str(),
            submission.canonical_url,
            task.attempts
        );

        let work = self
            .dispatch(
                job_id,
                submission.canonical_url.clone(),
                submission.url_type,
                submission.id.clone(),
            )
            .await;
        let work = match work {
            Ok(work) => work,
            Err(message) => {
                error!("job={job_id} {message}");
                catalog.fail_job(job_id, &message).await?;
                return Ok(JobOutcome::Failed { message });
            }
        };

        if !work.success {
            warn!("job={job_id} failed: {}", work.message);
            catalog.fail_job(job_id, &work.message).await?;
            return Ok(JobOutcome::Failed {
                message: work.message,
            });
        }

        if submission.url_type == UrlKind::Video
            && let Err(err) = catalog
                .backfill_submission_details(
                    &submission.id,
                    work.title.as_deref(),
                    work.description.as_deref(),
                )
                .await
        {
            warn!("job={job_id} could not fill in submission details: {err:#}");
        }
        catalog
            .complete_job(job_id, work.found, work.processed)
            .await?;
        info!("job={job_id} completed: {}", work.message);
        Ok(JobOutcome::Completed {
            message: work.message,
        })
    }

    /// Runs the kind-specific work in a separate task. `Err` carries the
    /// job's error message for panics and time-outs.
    async fn dispatch(
        &self,
        job_id: &str,
        url: String,
        kind: UrlKind,
        submission_id: String,
    ) -> std::result::Result<WorkResult, String> {
        let pipeline = self.pipeline.clone();
        let owned_job_id = job_id.to_string();
        let max_items = self.max_collection_items;

        let mut handle = tokio::spawn(async move {
            if kind.is_collection() {
                let report = process_collection(
                    &pipeline,
                    &url,
                    &submission_id,
                    max_items,
                    Some(&owned_job_id),
                )
                .await;
                WorkResult {
                    success: report.success,
                    message: report.message,
                    found: report.found,
                    processed: report.processed,
                    title: None,
                    description: None,
                }
            } else {
                let report = pipeline.process(&url, &submission_id, None).await;
                WorkResult {
                    success: report.success,
                    message: report.message,
                    found: 1,
                    processed: 1,
                    title: report.title,
                    description: report.description,
                }
            }
        });

        match tokio::time::timeout(self.time_limit, &mut handle).await {
            Ok(Ok(work)) => Ok(work),
            Ok(Err(join_err)) => {
                let detail = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    join_err.to_string()
                };
                Err(format!("Unexpected error in scraping job {job_id}: {detail}"))
            }
            Err(_) => {
                handle.abort();
                Err(format!(
                    "Unexpected error in scraping job {job_id}: exceeded time limit of {}s",
                    self.time_limit.as_secs()
                ))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BoxFuture,
        catalog::testing::{submit, video_count},
        error::IngestError,
        extractor::{
            DownloadRequest, ExtractorChain, MediaDownloader, MetadataExtractor, MetadataRecord,
            testing::FakeDownloader,
        },
        pipeline::testing::{harness, quiet_pacing},
        storage::testing::MemoryStore,
    };
    use anyhow::Context;
    use std::{path::PathBuf, sync::Arc};

    const VIDEO: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
    const PLAYLIST: &str = "https://www.youtube.com/playlist?list=PL1";

    fn task_for(job_id: &str, canonical_url: &str, url_kind: UrlKind) -> ScrapeTask {
        ScrapeTask {
            task_id: format!("task-{job_id}"),
            job_id: job_id.to_string(),
            canonical_url: canonical_url.to_string(),
            url_kind,
            attempts: 1,
        }
    }

    /// Backend that either panics or never answers.
    struct Misbehaving {
        panic: bool,
    }

    impl MetadataExtractor for Misbehaving {
        fn backend(&self) -> &'static str {
            "misbehaving"
        }

        fn can_download(&self) -> bool {
            true
        }

        fn extract<'a>(
            &'a self,
            _url: &'a str,
        ) -> BoxFuture<'a, std::result::Result<MetadataRecord, IngestError>> {
            Box::pin(async move {
                if self.panic {
                    panic!("extractor blew up");
                }
                std::future::pending().await
            })
        }
    }

    impl MediaDownloader for Misbehaving {
        fn list_entries<'a>(
            &'a self,
            _url: &'a str,
            _max_items: Option<u32>,
        ) -> BoxFuture<'a, std::result::Result<Vec<String>, IngestError>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn download<'a>(
            &'a self,
            _request: DownloadRequest<'a>,
        ) -> BoxFuture<'a, std::result::Result<PathBuf, IngestError>> {
            Box::pin(async { Err(IngestError::Download("unused".into())) })
        }
    }

    async fn misbehaving_runner(
        panic: bool,
        time_limit: Duration,
    ) -> Result<(tempfile::TempDir, JobRunner)> {
        let (dir, catalog) = crate::catalog::testing::temp_catalog().await?;
        let pipeline = VideoPipeline::new(
            catalog,
            ExtractorChain::new(None, Arc::new(Misbehaving { panic })),
            Arc::new(MemoryStore::default()),
            quiet_pacing(),
            dir.path().join("scratch"),
        );
        let settings = WorkerSettings {
            job_time_limit: time_limit,
            ..WorkerSettings::default()
        };
        Ok((dir, JobRunner::new(pipeline, &settings)))
    }

    #[tokio::test]
    async fn video_job_completes_and_backfills_the_submission() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let runner = JobRunner::new(h.pipeline.clone(), &WorkerSettings::default());
        let (submission, job) = submit(&h.catalog, VIDEO).await?;

        let outcome = runner
            .run(&task_for(&job.id, &submission.canonical_url, UrlKind::Video))
            .await?;
        assert_eq!(
            outcome,
            JobOutcome::Completed {
                message: "Successfully processed video dQw4w9WgXcQ".into()
            }
        );
        let job = h.catalog.get_job(&job.id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100);
        assert_eq!((job.videos_found, job.videos_processed), (1, 1));
        assert!(job.started_at.is_some() && job.completed_at.is_some());

        let submission = h
            .catalog
            .get_submission(&submission.id)
            .await?
            .context("submission")?;
        assert_eq!(submission.title.as_deref(), Some("Title dQw4w9WgXcQ"));
        assert_eq!(submission.description.as_deref(), Some("desc"));
        Ok(())
    }

    #[tokio::test]
    async fn unwritable_submission_details_do_not_fail_the_job() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let runner = JobRunner::new(h.pipeline.clone(), &WorkerSettings::default());
        let (submission, job) = submit(&h.catalog, VIDEO).await?;
        h.catalog
            .connect()
            .await?
            .execute(
                r#"
                CREATE TRIGGER freeze_submissions BEFORE UPDATE ON url_submissions
                BEGIN SELECT RAISE(ABORT, 'submissions are read-only'); END
                "#,
                libsql::params![],
            )
            .await?;

        let outcome = runner
            .run(&task_for(&job.id, &submission.canonical_url, UrlKind::Video))
            .await?;
        assert!(matches!(outcome, JobOutcome::Completed { .. }), "{outcome:?}");
        let job = h.catalog.get_job(&job.id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(video_count(&h.catalog).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn catalog_errors_after_begin_fail_the_job() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let runner = JobRunner::new(h.pipeline.clone(), &WorkerSettings::default());
        let (submission, job) = submit(&h.catalog, VIDEO).await?;
        h.catalog
            .connect()
            .await?
            .execute(
                r#"
                CREATE TRIGGER refuse_completion BEFORE UPDATE ON scraping_jobs
                WHEN NEW.status = 'completed'
                BEGIN SELECT RAISE(ABORT, 'completion refused'); END
                "#,
                libsql::params![],
            )
            .await?;

        let outcome = runner
            .run(&task_for(&job.id, &submission.canonical_url, UrlKind::Video))
            .await?;
        let JobOutcome::Failed { message } = outcome else {
            anyhow::bail!("expected failure, got {outcome:?}");
        };
        assert!(message.contains("completion refused"), "{message}");
        let job = h.catalog.get_job(&job.id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn dispatch_follows_the_stored_submission() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let runner = JobRunner::new(h.pipeline.clone(), &WorkerSettings::default());
        let (_, job) = submit(&h.catalog, VIDEO).await?;

        let outcome = runner
            .run(&task_for(&job.id, PLAYLIST, UrlKind::Playlist))
            .await?;
        assert_eq!(
            outcome,
            JobOutcome::Completed {
                message: "Successfully processed video dQw4w9WgXcQ".into()
            }
        );
        let calls = h.downloader.extract_calls.lock().clone();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|url| url == VIDEO), "{calls:?}");
        Ok(())
    }

    #[tokio::test]
    async fn failed_video_records_the_pipeline_message() -> Result<()> {
        let downloader = FakeDownloader::default();
        downloader.broken_urls.lock().insert(VIDEO.to_string());
        let h = harness(downloader).await?;
        let runner = JobRunner::new(h.pipeline.clone(), &WorkerSettings::default());
        let (submission, job) = submit(&h.catalog, VIDEO).await?;

        let outcome = runner
            .run(&task_for(&job.id, &submission.canonical_url, UrlKind::Video))
            .await?;
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        let job = h.catalog.get_job(&job.id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Failed);
        let message = job.error_message.context("error message")?;
        assert!(message.starts_with("Failed to extract metadata:"), "{message}");
        Ok(())
    }

    #[tokio::test]
    async fn collection_job_reports_counts() -> Result<()> {
        let entries = ["aaaaaaaaaaa", "bbbbbbbbbbb", "ccccccccccc"]
            .iter()
            .map(|id| format!("https://www.youtube.com/watch?v={id}"))
            .collect::<Vec<_>>();
        let downloader = FakeDownloader::with_entries(PLAYLIST, entries.clone());
        downloader.broken_urls.lock().insert(entries[1].clone());
        let h = harness(downloader).await?;
        let runner = JobRunner::new(h.pipeline.clone(), &WorkerSettings::default());
        let (submission, job) = submit(&h.catalog, PLAYLIST).await?;

        let outcome = runner
            .run(&task_for(&job.id, &submission.canonical_url, UrlKind::Playlist))
            .await?;
        assert_eq!(
            outcome,
            JobOutcome::Completed {
                message: "Processed 2 videos successfully, 1 failed".into()
            }
        );
        let job = h.catalog.get_job(&job.id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.videos_found, job.videos_processed), (3, 2));
        assert_eq!(video_count(&h.catalog).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn redelivered_terminal_job_is_a_no_op() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let runner = JobRunner::new(h.pipeline.clone(), &WorkerSettings::default());
        let (submission, job) = submit(&h.catalog, VIDEO).await?;
        let task = task_for(&job.id, &submission.canonical_url, UrlKind::Video);

        runner.run(&task).await?;
        let calls = h.downloader.extract_calls.lock().len();
        let again = runner.run(&task).await?;
        assert_eq!(again, JobOutcome::AlreadyFinished(JobStatus::Completed));
        assert_eq!(h.downloader.extract_calls.lock().len(), calls);

        let missing = runner
            .run(&task_for("no-such-job", VIDEO, UrlKind::Video))
            .await?;
        assert_eq!(missing, JobOutcome::Missing);
        Ok(())
    }

    #[tokio::test]
    async fn panics_become_failed_jobs() -> Result<()> {
        let (_dir, runner) = misbehaving_runner(true, Duration::from_secs(30)).await?;
        let catalog = runner.pipeline().catalog().clone();
        let (submission, job) = submit(&catalog, VIDEO).await?;

        let outcome = runner
            .run(&task_for(&job.id, &submission.canonical_url, UrlKind::Video))
            .await?;
        let JobOutcome::Failed { message } = outcome else {
            anyhow::bail!("expected failure, got {outcome:?}");
        };
        assert_eq!(
            message,
            format!("Unexpected error in scraping job {}: extractor blew up", job.id)
        );
        let job = catalog.get_job(&job.id).await?.context("job")?;
        assert_eq!(job.status, JobStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn hung_jobs_fail_at_the_time_limit() -> Result<()> {
        let (_dir, runner) = misbehaving_runner(false, Duration::from_millis(100)).await?;
        let catalog = runner.pipeline().catalog().clone();
        let (submission, job) = submit(&catalog, VIDEO).await?;

        let outcome = runner
            .run(&task_for(&job.id, &submission.canonical_url, UrlKind::Video))
            .await?;
        let JobOutcome::Failed { message } = outcome else {
            anyhow::bail!("expected failure, got {outcome:?}");
        };
        assert!(message.contains("exceeded time limit"), "{message}");
        Ok(())
    }
}
