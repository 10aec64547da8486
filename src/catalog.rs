#![forbid(unsafe_code)]

//! Persistence gateway over an embedded SQLite-compatible store.
//!
//! Status changes are single conditional `UPDATE`s whose `WHERE` clause names
//! the allowed source states, so a transition that is no longer legal simply
//! affects zero rows. Callers read the returned flag instead of re-reading the
//! row.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Database, Row, params};
use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    classifier::{ClassifiedUrl, UrlKind},
    extractor::MetadataRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Pending,
    Fetching,
    Done,
    Failed,
}

impl VideoStatus {
    pub const ALL: [VideoStatus; 4] = [
        VideoStatus::Pending,
        VideoStatus::Fetching,
        VideoStatus::Done,
        VideoStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub id: String,
    pub raw_url: String,
    pub canonical_url: String,
    pub url_type: UrlKind,
    pub identifier: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub submission_id: String,
    pub status: JobStatus,
    pub progress_percent: i64,
    pub videos_found: i64,
    pub videos_processed: i64,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoRow {
    pub id: String,
    pub source_video_id: String,
    pub canonical_url: String,
    pub title: String,
    pub description: Option<String>,
    pub duration_sec: Option<i64>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub upload_date: Option<String>,
    pub uploader: Option<String>,
    pub uploader_id: Option<String>,
    pub thumbnail_url: Option<String>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
    pub resolution: Option<String>,
    pub fps: Option<f64>,
    pub file_size_bytes: Option<i64>,
    pub format_id: Option<String>,
    pub storage_key: Option<String>,
    pub storage_url: Option<String>,
    pub status: VideoStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Where a downloaded file ended up, plus the facts only known after the
/// download.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMedia {
    pub storage_key: String,
    pub storage_url: String,
    pub file_size_bytes: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardStats {
    pub total_submissions: i64,
    pub jobs_by_status: BTreeMap<String, i64>,
    pub videos_by_status: BTreeMap<String, i64>,
    pub recent_submissions: Vec<Submission>,
}

const SUBMISSION_COLUMNS: &str =
    "id, raw_url, canonical_url, url_type, identifier, title, description, created_at, updated_at";

const JOB_COLUMNS: &str = "id, submission_id, status, progress_percent, videos_found, \
     videos_processed, error_message, started_at, completed_at, created_at, updated_at";

const VIDEO_COLUMNS: &str = "id, source_video_id, canonical_url, title, description, \
     duration_sec, view_count, like_count, upload_date, uploader, uploader_id, thumbnail_url, \
     tags_json, categories_json, resolution, fps, file_size_bytes, format_id, storage_key, \
     storage_url, status, created_at, updated_at";

/// Fixed-width UTC timestamp. Columns holding these compare correctly as text.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA busy_timeout=5000;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS url_submissions (
            id TEXT PRIMARY KEY,
            raw_url TEXT NOT NULL,
            canonical_url TEXT NOT NULL,
            url_type TEXT NOT NULL CHECK (url_type IN ('video', 'channel', 'playlist', 'user')),
            identifier TEXT NOT NULL,
            title TEXT,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scraping_jobs (
            id TEXT PRIMARY KEY,
            submission_id TEXT NOT NULL REFERENCES url_submissions(id),
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
            progress_percent INTEGER NOT NULL DEFAULT 0,
            videos_found INTEGER NOT NULL DEFAULT 0,
            videos_processed INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            started_at TEXT,
            completed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            source_video_id TEXT NOT NULL UNIQUE,
            canonical_url TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            duration_sec INTEGER,
            view_count INTEGER,
            like_count INTEGER,
            upload_date TEXT,
            uploader TEXT,
            uploader_id TEXT,
            thumbnail_url TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            categories_json TEXT NOT NULL DEFAULT '[]',
            resolution TEXT,
            fps REAL,
            file_size_bytes INTEGER,
            format_id TEXT,
            storage_key TEXT,
            storage_url TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'fetching', 'done', 'failed')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS submission_videos (
            submission_id TEXT NOT NULL REFERENCES url_submissions(id),
            video_id TEXT NOT NULL REFERENCES videos(id),
            position INTEGER,
            PRIMARY KEY (submission_id, video_id)
        );

        CREATE TABLE IF NOT EXISTS task_queue (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL REFERENCES scraping_jobs(id),
            canonical_url TEXT NOT NULL,
            url_type TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL DEFAULT 'queued' CHECK (state IN ('queued', 'leased')),
            attempts INTEGER NOT NULL DEFAULT 0,
            lease_expires_at INTEGER,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status ON scraping_jobs(status, updated_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_submission ON scraping_jobs(submission_id);
        CREATE INDEX IF NOT EXISTS idx_videos_status ON videos(status);
        CREATE INDEX IF NOT EXISTS idx_submission_videos_video ON submission_videos(video_id);
        CREATE INDEX IF NOT EXISTS idx_task_queue_claim ON task_queue(state, priority, created_at);
        CREATE INDEX IF NOT EXISTS idx_task_queue_job ON task_queue(job_id);
        "#,
    )
    .await?;
    Ok(())
}

/// Shared handle to the store. Cheap to clone; every operation runs on its
/// own connection so transactions never interleave between tasks.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
}

impl Catalog {
    /// Opens (and if necessary creates) the database and its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating catalog directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening catalog DB {}", path.display()))?;
        let conn = db.connect()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").await?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        info!("catalog ready at {}", path.display());

        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) async fn connect(&self) -> Result<Connection> {
        let conn = self.db.connect().context("connecting to catalog")?;
        configure_connection(&conn).await?;
        Ok(conn)
    }

    pub async fn ping(&self) -> Result<()> {
        let conn = self.connect().await?;
        let mut rows = conn.query("SELECT 1", params![]).await?;
        rows.next().await?.context("ping returned no row")?;
        Ok(())
    }

    /// Persists a submission and its `pending` job atomically.
    pub async fn create_submission_with_job(
        &self,
        raw_url: &str,
        classified: &ClassifiedUrl,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<(Submission, Job)> {
        let now = now_timestamp();
        let submission = Submission {
            id: Uuid::new_v4().to_string(),
            raw_url: raw_url.trim().to_string(),
            canonical_url: classified.canonical_url.clone(),
            url_type: classified.kind,
            identifier: classified.identifier.clone(),
            title: title.map(str::to_string),
            description: description.map(str::to_string),
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        let job = Job {
            id: Uuid::new_v4().to_string(),
            submission_id: submission.id.clone(),
            status: JobStatus::Pending,
            progress_percent: 0,
            videos_found: 0,
            videos_processed: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now.clone(),
            updated_at: now,
        };

        let conn = self.connect().await?;
        let tx = conn.transaction().await?;
        tx.execute(
            r#"
            INSERT INTO url_submissions (
                id, raw_url, canonical_url, url_type, identifier, title, description,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                submission.id.as_str(),
                submission.raw_url.as_str(),
                submission.canonical_url.as_str(),
                submission.url_type.as_str(),
                submission.identifier.as_str(),
                submission.title.clone(),
                submission.description.clone(),
                submission.created_at.as_str(),
                submission.updated_at.as_str(),
            ],
        )
        .await
        .context("inserting submission")?;
        tx.execute(
            r#"
            INSERT INTO scraping_jobs (id, submission_id, status, created_at, updated_at)
            VALUES (?1, ?2, 'pending', ?3, ?4)
            "#,
            params![
                job.id.as_str(),
                job.submission_id.as_str(),
                job.created_at.as_str(),
                job.updated_at.as_str(),
            ],
        )
        .await
        .context("inserting scraping job")?;
        tx.commit().await?;

        info!("submission={} job={} created", submission.id, job.id);
        Ok((submission, job))
    }

    pub async fn get_submission(&self, id: &str) -> Result<Option<Submission>> {
        let conn = self.connect().await?;
        let sql = format!("SELECT {SUBMISSION_COLUMNS} FROM url_submissions WHERE id = ?1");
        let mut rows = conn.query(&sql, params![id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_submission(&row)?)),
            None => Ok(None),
        }
    }

    /// Newest first.
    pub async fn list_submissions(&self, limit: i64, offset: i64) -> Result<Vec<Submission>> {
        let conn = self.connect().await?;
        let sql = format!(
            "SELECT {SUBMISSION_COLUMNS} FROM url_submissions \
             ORDER BY created_at DESC, id LIMIT ?1 OFFSET ?2"
        );
        let mut rows = conn.query(&sql, params![limit, offset]).await?;
        let mut submissions = Vec::new();
        while let Some(row) = rows.next().await? {
            submissions.push(row_to_submission(&row)?);
        }
        Ok(submissions)
    }

    /// Fills in title and description once, without overwriting values a
    /// submitter or an earlier run already provided.
    pub async fn backfill_submission_details(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<bool> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE url_submissions
                SET title = COALESCE(title, ?2),
                    description = COALESCE(description, ?3),
                    updated_at = ?4
                WHERE id = ?1 AND (
                    (title IS NULL AND ?2 IS NOT NULL)
                    OR (description IS NULL AND ?3 IS NOT NULL)
                )
                "#,
                params![
                    id,
                    title.map(str::to_string),
                    description.map(str::to_string),
                    now_timestamp()
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.connect().await?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM scraping_jobs WHERE id = ?1");
        let mut rows = conn.query(&sql, params![id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated first.
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let conn = self.connect().await?;
        let mut rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM scraping_jobs WHERE status = ?1 \
                     ORDER BY updated_at DESC LIMIT ?2"
                );
                conn.query(&sql, params![status.as_str(), limit]).await?
            }
            None => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM scraping_jobs ORDER BY updated_at DESC LIMIT ?1"
                );
                conn.query(&sql, params![limit]).await?
            }
        };
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    /// `pending → processing`. A redelivered job that is already
    /// `processing` is accepted again; `started_at` keeps its first value.
    pub async fn begin_job(&self, id: &str) -> Result<bool> {
        let now = now_timestamp();
        self.transition(
            r#"
            UPDATE scraping_jobs
            SET status = 'processing', started_at = COALESCE(started_at, ?2), updated_at = ?2
            WHERE id = ?1 AND status IN ('pending', 'processing')
            "#,
            params![id, now],
        )
        .await
    }

    pub async fn record_job_progress(&self, id: &str, found: i64, processed: i64) -> Result<bool> {
        self.transition(
            r#"
            UPDATE scraping_jobs
            SET videos_found = ?2,
                videos_processed = ?3,
                progress_percent = CASE WHEN ?2 > 0 THEN MIN(100, (?3 * 100) / ?2) ELSE 0 END,
                updated_at = ?4
            WHERE id = ?1 AND status = 'processing'
            "#,
            params![id, found, processed, now_timestamp()],
        )
        .await
    }

    /// `processing → completed`.
    pub async fn complete_job(&self, id: &str, found: i64, processed: i64) -> Result<bool> {
        let now = now_timestamp();
        self.transition(
            r#"
            UPDATE scraping_jobs
            SET status = 'completed', progress_percent = 100, videos_found = ?2,
                videos_processed = ?3, error_message = NULL, completed_at = ?4, updated_at = ?4
            WHERE id = ?1 AND status = 'processing'
            "#,
            params![id, found, processed, now],
        )
        .await
    }

    /// `pending | processing → failed`.
    pub async fn fail_job(&self, id: &str, message: &str) -> Result<bool> {
        let now = now_timestamp();
        self.transition(
            r#"
            UPDATE scraping_jobs
            SET status = 'failed', error_message = ?2, completed_at = ?3, updated_at = ?3
            WHERE id = ?1 AND status IN ('pending', 'processing')
            "#,
            params![id, message, now],
        )
        .await
    }

    /// Fails non-terminal jobs untouched since `cutoff` that have no queue
    /// task left to drive them. Returns the number of jobs failed.
    pub async fn fail_orphaned_jobs(&self, cutoff: DateTime<Utc>, message: &str) -> Result<u64> {
        let conn = self.connect().await?;
        let now = now_timestamp();
        let changed = conn
            .execute(
                r#"
                UPDATE scraping_jobs
                SET status = 'failed', error_message = ?2, completed_at = ?3, updated_at = ?3
                WHERE status IN ('pending', 'processing')
                  AND updated_at < ?1
                  AND NOT EXISTS (SELECT 1 FROM task_queue t WHERE t.job_id = scraping_jobs.id)
                "#,
                params![timestamp(cutoff), message, now],
            )
            .await?;
        Ok(changed)
    }

    async fn transition(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<bool> {
        let conn = self.connect().await?;
        let changed = conn.execute(sql, params).await?;
        Ok(changed > 0)
    }

    pub async fn find_video_by_source_id(&self, source_video_id: &str) -> Result<Option<VideoRow>> {
        self.fetch_video("source_video_id", source_video_id).await
    }

    pub async fn get_video(&self, id: &str) -> Result<Option<VideoRow>> {
        self.fetch_video("id", id).await
    }

    async fn fetch_video(&self, column: &str, value: &str) -> Result<Option<VideoRow>> {
        let conn = self.connect().await?;
        let sql = format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE {column} = ?1");
        let mut rows = conn.query(&sql, params![value]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    /// Inserts a `done` row for `record` unless one with the same platform id
    /// exists. Returns the stored row and whether this call created it.
    pub async fn insert_video_if_absent(
        &self,
        record: &MetadataRecord,
        canonical_url: &str,
        media: &StoredMedia,
    ) -> Result<(VideoRow, bool)> {
        let tags_json = serde_json::to_string(&record.tags).context("serializing tags")?;
        let categories_json =
            serde_json::to_string(&record.categories).context("serializing categories")?;
        let best = record.best_video_format();
        let now = now_timestamp();

        let conn = self.connect().await?;
        let inserted = conn
            .execute(
                r#"
                INSERT INTO videos (
                    id, source_video_id, canonical_url, title, description, duration_sec,
                    view_count, like_count, upload_date, uploader, uploader_id, thumbnail_url,
                    tags_json, categories_json, resolution, fps, file_size_bytes, format_id,
                    storage_key, storage_url, status, created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, 'done', ?21, ?21
                )
                ON CONFLICT(source_video_id) DO NOTHING
                "#,
                params![
                    Uuid::new_v4().to_string(),
                    record.video_id.as_str(),
                    canonical_url,
                    record.title.as_str(),
                    record.description.clone(),
                    record.duration_sec,
                    record.view_count,
                    record.like_count,
                    record.upload_date.clone(),
                    record.uploader.clone(),
                    record.uploader_id.clone(),
                    record.thumbnail_url.clone(),
                    tags_json,
                    categories_json,
                    record.resolution(),
                    best.and_then(|format| format.fps),
                    media.file_size_bytes,
                    best.map(|format| format.format_id.clone()),
                    media.storage_key.as_str(),
                    media.storage_url.as_str(),
                    now,
                ],
            )
            .await
            .context("inserting video")?
            > 0;

        let row = self
            .find_video_by_source_id(&record.video_id)
            .await?
            .with_context(|| format!("video {} missing after insert", record.video_id))?;
        debug!("video={} inserted={inserted}", record.video_id);
        Ok((row, inserted))
    }

    /// Idempotent association; re-linking only refreshes the position.
    pub async fn link_video(
        &self,
        submission_id: &str,
        video_id: &str,
        position: Option<i64>,
    ) -> Result<()> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO submission_videos (submission_id, video_id, position)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(submission_id, video_id)
            DO UPDATE SET position = COALESCE(excluded.position, submission_videos.position)
            "#,
            params![submission_id, video_id, position],
        )
        .await
        .with_context(|| format!("linking video {video_id} to submission {submission_id}"))?;
        Ok(())
    }

    /// Videos linked to a submission, in listing order.
    pub async fn videos_for_submission(&self, submission_id: &str) -> Result<Vec<VideoRow>> {
        let conn = self.connect().await?;
        let columns = VIDEO_COLUMNS
            .split(", ")
            .map(|column| format!("v.{}", column.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {columns} FROM videos v \
             JOIN submission_videos sv ON sv.video_id = v.id \
             WHERE sv.submission_id = ?1 \
             ORDER BY sv.position IS NULL, sv.position, v.created_at"
        );
        let mut rows = conn.query(&sql, params![submission_id]).await?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok(videos)
    }

    /// Seeds a `pending` row to be filled in later by the backfill worker.
    /// Returns false when a row for the platform id already exists.
    pub async fn insert_placeholder_video(
        &self,
        source_video_id: &str,
        canonical_url: &str,
    ) -> Result<bool> {
        let conn = self.connect().await?;
        let now = now_timestamp();
        let inserted = conn
            .execute(
                r#"
                INSERT INTO videos (
                    id, source_video_id, canonical_url, title, status, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?2, 'pending', ?4, ?4)
                ON CONFLICT(source_video_id) DO NOTHING
                "#,
                params![
                    Uuid::new_v4().to_string(),
                    source_video_id,
                    canonical_url,
                    now
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    /// Oldest first.
    pub async fn list_pending_videos(&self, limit: i64) -> Result<Vec<VideoRow>> {
        let conn = self.connect().await?;
        let sql = format!(
            "SELECT {VIDEO_COLUMNS} FROM videos WHERE status = 'pending' \
             ORDER BY created_at LIMIT ?1"
        );
        let mut rows = conn.query(&sql, params![limit]).await?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok(videos)
    }

    /// `pending → fetching` as one compare-and-swap write. Exactly one of
    /// several concurrent callers gets `true`.
    pub async fn claim_pending_video(&self, id: &str) -> Result<bool> {
        self.transition(
            r#"
            UPDATE videos SET status = 'fetching', updated_at = ?2
            WHERE id = ?1 AND status = 'pending'
            "#,
            params![id, now_timestamp()],
        )
        .await
    }

    /// `fetching → done`, filling in everything learned while fetching.
    pub async fn finish_video(
        &self,
        id: &str,
        record: &MetadataRecord,
        media: &StoredMedia,
    ) -> Result<bool> {
        let tags_json = serde_json::to_string(&record.tags).context("serializing tags")?;
        let categories_json =
            serde_json::to_string(&record.categories).context("serializing categories")?;
        let best = record.best_video_format();
        self.transition(
            r#"
            UPDATE videos
            SET title = ?2, description = ?3, duration_sec = ?4, view_count = ?5,
                like_count = ?6, upload_date = ?7, uploader = ?8, uploader_id = ?9,
                thumbnail_url = ?10, tags_json = ?11, categories_json = ?12, resolution = ?13,
                fps = ?14, file_size_bytes = ?15, format_id = ?16, storage_key = ?17,
                storage_url = ?18, status = 'done', updated_at = ?19
            WHERE id = ?1 AND status = 'fetching'
            "#,
            params![
                id,
                record.title.as_str(),
                record.description.clone(),
                record.duration_sec,
                record.view_count,
                record.like_count,
                record.upload_date.clone(),
                record.uploader.clone(),
                record.uploader_id.clone(),
                record.thumbnail_url.clone(),
                tags_json,
                categories_json,
                record.resolution(),
                best.and_then(|format| format.fps),
                media.file_size_bytes,
                best.map(|format| format.format_id.clone()),
                media.storage_key.as_str(),
                media.storage_url.as_str(),
                now_timestamp(),
            ],
        )
        .await
    }

    /// `fetching → failed`.
    pub async fn fail_video(&self, id: &str) -> Result<bool> {
        self.transition(
            r#"
            UPDATE videos SET status = 'failed', updated_at = ?2
            WHERE id = ?1 AND status = 'fetching'
            "#,
            params![id, now_timestamp()],
        )
        .await
    }

    pub async fn dashboard(&self, recent: i64) -> Result<DashboardStats> {
        let conn = self.connect().await?;
        let mut stats = DashboardStats::default();

        let mut rows = conn
            .query("SELECT COUNT(*) FROM url_submissions", params![])
            .await?;
        if let Some(row) = rows.next().await? {
            stats.total_submissions = row.get(0)?;
        }

        for status in JobStatus::ALL {
            stats.jobs_by_status.insert(status.as_str().to_string(), 0);
        }
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM scraping_jobs GROUP BY status",
                params![],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            stats.jobs_by_status.insert(row.get(0)?, row.get(1)?);
        }

        for status in VideoStatus::ALL {
            stats.videos_by_status.insert(status.as_str().to_string(), 0);
        }
        let mut rows = conn
            .query("SELECT status, COUNT(*) FROM videos GROUP BY status", params![])
            .await?;
        while let Some(row) = rows.next().await? {
            stats.videos_by_status.insert(row.get(0)?, row.get(1)?);
        }

        stats.recent_submissions = self.list_submissions(recent, 0).await?;
        Ok(stats)
    }
}

fn row_to_submission(row: &Row) -> Result<Submission> {
    let url_type: String = row.get(3)?;
    Ok(Submission {
        id: row.get(0)?,
        raw_url: row.get(1)?,
        canonical_url: row.get(2)?,
        url_type: UrlKind::parse(&url_type)
            .with_context(|| format!("unknown url_type {url_type:?} in catalog"))?,
        identifier: row.get(4)?,
        title: row.get(5)?,
        description: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_job(row: &Row) -> Result<Job> {
    let status: String = row.get(2)?;
    Ok(Job {
        id: row.get(0)?,
        submission_id: row.get(1)?,
        status: JobStatus::parse(&status)
            .with_context(|| format!("unknown job status {status:?} in catalog"))?,
        progress_percent: row.get(3)?,
        videos_found: row.get(4)?,
        videos_processed: row.get(5)?,
        error_message: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_video(row: &Row) -> Result<VideoRow> {
    let tags_json: String = row.get(12)?;
    let categories_json: String = row.get(13)?;
    let status: String = row.get(20)?;
    Ok(VideoRow {
        id: row.get(0)?,
        source_video_id: row.get(1)?,
        canonical_url: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        duration_sec: row.get(5)?,
        view_count: row.get(6)?,
        like_count: row.get(7)?,
        upload_date: row.get(8)?,
        uploader: row.get(9)?,
        uploader_id: row.get(10)?,
        thumbnail_url: row.get(11)?,
        tags: serde_json::from_str(&tags_json).context("parsing tags_json")?,
        categories: serde_json::from_str(&categories_json).context("parsing categories_json")?,
        resolution: row.get(14)?,
        fps: row.get(15)?,
        file_size_bytes: row.get(16)?,
        format_id: row.get(17)?,
        storage_key: row.get(18)?,
        storage_url: row.get(19)?,
        status: VideoStatus::parse(&status)
            .with_context(|| format!("unknown video status {status:?} in catalog"))?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
    })
}
