#![forbid(unsafe_code)]

//! Durable at-least-once task queue stored next to the catalog tables.
//!
//! A claimed task is leased, not removed. Only `ack` deletes it, so a worker
//! that dies mid-job leaves a lease that expires and the task is handed out
//! again.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use libsql::params;
use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::{catalog::Catalog, catalog::now_timestamp, classifier::UrlKind};

const VIDEO_PRIORITY: i64 = 10;
const COLLECTION_PRIORITY: i64 = 0;

/// The unit of work a worker executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapeTask {
    pub task_id: String,
    pub job_id: String,
    pub canonical_url: String,
    pub url_kind: UrlKind,
    /// Deliveries so far, including the current one.
    pub attempts: u32,
}

/// A task whose attempts ran out while its last lease expired.
#[derive(Debug, Clone, PartialEq)]
pub struct ExhaustedTask {
    pub task_id: String,
    pub job_id: String,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct TaskQueue {
    catalog: Catalog,
}

impl TaskQueue {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    /// Queues a job. Single videos jump ahead of collections.
    pub async fn enqueue(
        &self,
        job_id: &str,
        canonical_url: &str,
        url_kind: UrlKind,
    ) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let priority = if url_kind.is_collection() {
            COLLECTION_PRIORITY
        } else {
            VIDEO_PRIORITY
        };
        let conn = self.catalog.connect().await?;
        conn.execute(
            r#"
            INSERT INTO task_queue (id, job_id, canonical_url, url_type, priority, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                task_id.as_str(),
                job_id,
                canonical_url,
                url_kind.as_str(),
                priority,
                now_timestamp()
            ],
        )
        .await
        .with_context(|| format!("enqueueing job {job_id}"))?;
        info!("task={task_id} job={job_id} queued priority={priority}");
        Ok(task_id)
    }

    /// Leases the next task: highest priority, oldest first, including tasks
    /// whose previous lease ran out while they still have attempts left. The
    /// selection and the lease happen in one statement.
    pub async fn claim(&self, lease: Duration, max_attempts: u32) -> Result<Option<ScrapeTask>> {
        let now = Utc::now().timestamp();
        let expires = now.saturating_add(i64::try_from(lease.as_secs()).unwrap_or(i64::MAX / 2));
        let conn = self.catalog.connect().await?;
        let mut rows = conn
            .query(
                r#"
                UPDATE task_queue
                SET state = 'leased', attempts = attempts + 1, lease_expires_at = ?2
                WHERE id = (
                    SELECT id FROM task_queue
                    WHERE state = 'queued'
                        OR (state = 'leased' AND lease_expires_at <= ?1 AND attempts < ?3)
                    ORDER BY priority DESC, created_at, id
                    LIMIT 1
                )
                RETURNING id, job_id, canonical_url, url_type, attempts
                "#,
                params![now, expires, i64::from(max_attempts.max(1))],
            )
            .await
            .context("claiming task")?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let url_type: String = row.get(3)?;
        let attempts: i64 = row.get(4)?;
        let task = ScrapeTask {
            task_id: row.get(0)?,
            job_id: row.get(1)?,
            canonical_url: row.get(2)?,
            url_kind: UrlKind::parse(&url_type)
                .with_context(|| format!("unknown url_type {url_type:?} in task queue"))?,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        };
        debug!(
            "task={} job={} claimed attempt={}",
            task.task_id, task.job_id, task.attempts
        );
        Ok(Some(task))
    }

    /// Removes a finished task. Acking twice is harmless.
    pub async fn ack(&self, task_id: &str) -> Result<bool> {
        let conn = self.catalog.connect().await?;
        let removed = conn
            .execute("DELETE FROM task_queue WHERE id = ?1", params![task_id])
            .await?;
        Ok(removed > 0)
    }

    /// Tasks waiting for a worker.
    pub async fn depth(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM task_queue WHERE state = 'queued'")
            .await
    }

    pub async fn leased_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM task_queue WHERE state = 'leased'")
            .await
    }

    /// Leased tasks past their lease that already used `max_attempts`
    /// deliveries. Such a task will never be claimed successfully.
    pub async fn exhausted(&self, max_attempts: u32) -> Result<Vec<ExhaustedTask>> {
        let conn = self.catalog.connect().await?;
        let mut rows = conn
            .query(
                r#"
                SELECT id, job_id, attempts FROM task_queue
                WHERE state = 'leased' AND lease_expires_at <= ?1 AND attempts >= ?2
                ORDER BY created_at
                "#,
                params![Utc::now().timestamp(), i64::from(max_attempts)],
            )
            .await?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await? {
            let attempts: i64 = row.get(2)?;
            tasks.push(ExhaustedTask {
                task_id: row.get(0)?,
                job_id: row.get(1)?,
                attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            });
        }
        Ok(tasks)
    }

    /// Fails the jobs behind exhausted tasks and drops those tasks. Returns
    /// how many jobs moved to failed.
    pub async fn retire_exhausted(&self, max_attempts: u32) -> Result<usize> {
        let mut failed = 0;
        for task in self.exhausted(max_attempts).await? {
            let message = format!(
                "Scraping job {} abandoned after {} attempts",
                task.job_id, task.attempts
            );
            if self.catalog.fail_job(&task.job_id, &message).await? {
                failed += 1;
            }
            self.ack(&task.task_id).await?;
            warn!("task={} job={} {message}", task.task_id, task.job_id);
        }
        Ok(failed)
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        let conn = self.catalog.connect().await?;
        let mut rows = conn.query(sql, params![]).await?;
        let row = rows.next().await?.context("count returned no row")?;
        let count: i64 = row.get(0)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
