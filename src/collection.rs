#![forbid(unsafe_code)]

//! Playlist, channel and user fan-out. Members are listed shallowly and then
//! fed one at a time through the single-video pipeline with a human-like
//! pause in between. The loop is sequential on purpose and must stay so.

use log::{info, warn};
use serde::Serialize;

use crate::pipeline::VideoPipeline;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionReport {
    /// True once enumeration worked, whatever happened to single items.
    pub success: bool,
    pub message: String,
    pub found: i64,
    pub processed: i64,
    pub failed: i64,
}

impl CollectionReport {
    fn listing_failed(message: String) -> Self {
        Self {
            success: false,
            message,
            found: 0,
            processed: 0,
            failed: 0,
        }
    }
}

/// Processes every member of the collection at `url`. When `job_id` is given
/// the job row's counters are kept current after each item.
pub async fn process_collection(
    pipeline: &VideoPipeline,
    url: &str,
    submission_id: &str,
    max_items: Option<u32>,
    job_id: Option<&str>,
) -> CollectionReport {
    let entries = match pipeline.chain().downloader().list_entries(url, max_items).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!("submission={submission_id} listing {url} failed: {err}");
            return CollectionReport::listing_failed(format!("Failed to list videos: {err}"));
        }
    };

    let found = i64::try_from(entries.len()).unwrap_or(i64::MAX);
    info!("submission={submission_id} found={found} entries in {url}");
    record_progress(pipeline, job_id, found, 0).await;

    let mut processed = 0i64;
    let mut failed = 0i64;
    for (index, entry) in entries.iter().enumerate() {
        let position = i64::try_from(index).ok();
        let report = pipeline.process(entry, submission_id, position).await;
        if report.success {
            processed += 1;
        } else {
            failed += 1;
            warn!(
                "submission={submission_id} item {}/{found} {entry} failed: {}",
                index + 1,
                report.message
            );
        }
        record_progress(pipeline, job_id, found, processed).await;

        if index + 1 < entries.len() {
            let delay = pipeline.pacing().sample_delay();
            tokio::time::sleep(delay).await;
        }
    }

    let mut message = format!("Processed {processed} videos successfully");
    if failed > 0 {
        message.push_str(&format!(", {failed} failed"));
    }
    info!("submission={submission_id} {message}");
    CollectionReport {
        success: true,
        message,
        found,
        processed,
        failed,
    }
}

async fn record_progress(
    pipeline: &VideoPipeline,
    job_id: Option<&str>,
    found: i64,
    processed: i64,
) {
    let Some(job_id) = job_id else {
        return;
    };
    if let Err(err) = pipeline
        .catalog()
        .record_job_progress(job_id, found, processed)
        .await
    {
        warn!("job={job_id} could not record progress: {err:#}");
    }
}
