#![forbid(unsafe_code)]

//! Single-video pipeline: metadata, dedup, paced download, upload, persist.
//!
//! Media only ever lives in a per-invocation scratch directory owned by a
//! [`tempfile::TempDir`]. The directory is removed when the guard drops,
//! which covers early returns, errors and unwinding panics alike.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{info, warn};
use serde::Serialize;
use tempfile::TempDir;

use crate::{
    catalog::{Catalog, StoredMedia, VideoRow},
    classifier::{self, UrlKind},
    config::Settings,
    error::IngestError,
    extractor::{DownloadRequest, ExtractorChain, MetadataRecord},
    pacing::PacingController,
    security::ensure_private_dir,
    storage::{ObjectStore, content_type_for, storage_key},
};

/// Name prefix of the per-invocation scratch directories.
pub const SCRATCH_PREFIX: &str = "ingest-";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub success: bool,
    pub message: String,
    pub video_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl PipelineReport {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            video_id: None,
            title: None,
            description: None,
        }
    }

    fn success(message: impl Into<String>, record: &MetadataRecord) -> Self {
        Self {
            success: true,
            message: message.into(),
            video_id: Some(record.video_id.clone()),
            title: Some(record.title.clone()),
            description: record.description.clone(),
        }
    }
}

#[derive(Clone)]
pub struct VideoPipeline {
    catalog: Catalog,
    chain: ExtractorChain,
    store: Arc<dyn ObjectStore>,
    pacing: PacingController,
    scratch_root: PathBuf,
}

impl VideoPipeline {
    pub fn new(
        catalog: Catalog,
        chain: ExtractorChain,
        store: Arc<dyn ObjectStore>,
        pacing: PacingController,
        scratch_root: PathBuf,
    ) -> Self {
        Self {
            catalog,
            chain,
            store,
            pacing,
            scratch_root,
        }
    }

    /// Production wiring: yt-dlp (plus the page API when enabled) and the
    /// configured scratch root.
    pub fn from_settings(
        settings: &Settings,
        catalog: Catalog,
        store: Arc<dyn ObjectStore>,
    ) -> anyhow::Result<Self> {
        let chain = ExtractorChain::from_settings(&settings.extractor, &settings.pacing)?;
        Ok(Self::new(
            catalog,
            chain,
            store,
            PacingController::new(settings.pacing.clone()),
            settings.download_path.clone(),
        ))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn chain(&self) -> &ExtractorChain {
        &self.chain
    }

    pub fn pacing(&self) -> &PacingController {
        &self.pacing
    }

    /// Runs one video end to end for `submission_id`. Never returns an error:
    /// every failure is folded into an unsuccessful report.
    pub async fn process(
        &self,
        url: &str,
        submission_id: &str,
        position: Option<i64>,
    ) -> PipelineReport {
        match self.run(url, submission_id, position).await {
            Ok(report) => report,
            Err(err) => {
                warn!("submission={submission_id} url={url} failed kind={} {err}", err.kind());
                PipelineReport::failure(failure_message(&err))
            }
        }
    }

    async fn run(
        &self,
        url: &str,
        submission_id: &str,
        position: Option<i64>,
    ) -> Result<PipelineReport, IngestError> {
        let record = self.chain.metadata(url).await?;

        let existing = self
            .catalog
            .find_video_by_source_id(&record.video_id)
            .await
            .map_err(IngestError::persistence)?;
        if let Some(existing) = existing {
            self.catalog
                .link_video(submission_id, &existing.id, position)
                .await
                .map_err(IngestError::persistence)?;
            info!("video={} already stored, linked to submission={submission_id}", record.video_id);
            return Ok(PipelineReport::success(
                format!("Video {} already exists, linked to URL", record.video_id),
                &record,
            ));
        }

        let record = self.chain.ensure_downloadable(url, record).await?;
        let canonical = classifier::canonical_url(UrlKind::Video, &record.video_id);
        let media = self.fetch_and_store(&canonical, &record).await?;

        let (row, inserted) = match self.insert_video(&record, &canonical, &media).await {
            Ok(saved) => saved,
            Err(err) => {
                self.discard_object(&record.video_id, &media.storage_key).await;
                return Err(err);
            }
        };
        if !inserted && row.storage_key.as_deref() != Some(media.storage_key.as_str()) {
            // Another worker stored this video first; our copy is surplus.
            self.discard_object(&record.video_id, &media.storage_key).await;
        }
        self.catalog
            .link_video(submission_id, &row.id, position)
            .await
            .map_err(IngestError::persistence)?;

        info!(
            "video={} stored key={} bytes={} submission={submission_id}",
            record.video_id, media.storage_key, media.file_size_bytes
        );
        Ok(PipelineReport::success(
            format!("Successfully processed video {}", record.video_id),
            &record,
        ))
    }

    /// Claims a placeholder row and fills it in. Returns `None` when another
    /// worker won the claim.
    pub async fn process_placeholder(
        &self,
        row: &VideoRow,
    ) -> Result<Option<PipelineReport>, IngestError> {
        let claimed = self
            .catalog
            .claim_pending_video(&row.id)
            .await
            .map_err(IngestError::persistence)?;
        if !claimed {
            info!("video={} claimed elsewhere, skipping", row.source_video_id);
            return Ok(None);
        }

        let outcome = async {
            let record = self.chain.metadata(&row.canonical_url).await?;
            let record = self.chain.ensure_downloadable(&row.canonical_url, record).await?;
            let media = self.fetch_and_store(&row.canonical_url, &record).await?;
            if let Err(err) = self.catalog.finish_video(&row.id, &record, &media).await {
                self.discard_object(&record.video_id, &media.storage_key).await;
                return Err(IngestError::persistence(err));
            }
            Ok::<_, IngestError>(record)
        }
        .await;

        match outcome {
            Ok(record) => Ok(Some(PipelineReport::success(
                format!("Successfully processed video {}", record.video_id),
                &record,
            ))),
            Err(err) => {
                warn!("video={} placeholder failed: {err}", row.source_video_id);
                self.catalog
                    .fail_video(&row.id)
                    .await
                    .map_err(IngestError::persistence)?;
                Ok(Some(PipelineReport::failure(failure_message(&err))))
            }
        }
    }

    /// Download into a fresh scratch dir, then upload. The scratch dir is
    /// gone by the time this returns, whatever the outcome.
    async fn fetch_and_store(
        &self,
        url: &str,
        record: &MetadataRecord,
    ) -> Result<StoredMedia, IngestError> {
        let scratch = self.scratch_dir()?;
        let rate_limit_bps = self.pacing.compute_target_bitrate(record);
        info!(
            "video={} downloading rate_limit_bps={}",
            record.video_id,
            rate_limit_bps.map_or_else(|| "none".to_string(), |rate| rate.to_string())
        );
        let local = self
            .chain
            .downloader()
            .download(DownloadRequest {
                url,
                video_id: &record.video_id,
                dest_dir: scratch.path(),
                rate_limit_bps,
                max_filesize_bytes: self.pacing.max_file_size_bytes(),
            })
            .await?;

        let file_size = tokio::fs::metadata(&local)
            .await
            .map_err(|err| IngestError::Download(format!("reading downloaded file: {err}")))?
            .len();
        let extension = local
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("mp4");
        let key = storage_key(record, extension);
        let storage_url = self
            .store
            .upload(&local, &key, &content_type_for(&local))
            .await
            .map_err(|err| IngestError::StorageUpload(upload_detail(err)))?;

        Ok(StoredMedia {
            storage_key: key,
            storage_url,
            file_size_bytes: i64::try_from(file_size).unwrap_or(i64::MAX),
        })
    }

    fn scratch_dir(&self) -> Result<TempDir, IngestError> {
        ensure_private_dir(&self.scratch_root)
            .map_err(|err| IngestError::Download(format!("preparing scratch root: {err:#}")))?;
        tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.scratch_root)
            .map_err(|err| IngestError::Download(format!("creating scratch dir: {err}")))
    }

    /// Insert with a single retry; a second failure is reported.
    async fn insert_video(
        &self,
        record: &MetadataRecord,
        canonical: &str,
        media: &StoredMedia,
    ) -> Result<(VideoRow, bool), IngestError> {
        match self
            .catalog
            .insert_video_if_absent(record, canonical, media)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!("video={} insert failed, retrying once: {err:#}", record.video_id);
                self.catalog
                    .insert_video_if_absent(record, canonical, media)
                    .await
                    .map_err(IngestError::persistence)
            }
        }
    }

    /// Removes an uploaded object that no row points at.
    async fn discard_object(&self, video_id: &str, key: &str) {
        if let Err(err) = self.store.delete(key).await {
            warn!("video={video_id} could not remove unreferenced object {key}: {err}");
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }
}

fn upload_detail(err: IngestError) -> String {
    match err {
        IngestError::StorageUpload(detail) => detail,
        other => other.to_string(),
    }
}

fn failure_message(err: &IngestError) -> String {
    match err {
        IngestError::Extraction(detail) => format!("Failed to extract metadata: {detail}"),
        IngestError::Download(detail) => format!("Download failed: {detail}"),
        IngestError::StorageUpload(detail) => format!("Upload to storage failed: {detail}"),
        IngestError::Persistence(detail) => format!("Database error: {detail}"),
        other => other.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::{
        BoxFuture,
        catalog::{
            VideoStatus,
            testing::{link_count, submit, video_count},
        },
        extractor::testing::FakeDownloader,
    };
    use anyhow::Result;
    use libsql::params;
    use std::time::Duration;

    const URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    #[tokio::test]
    async fn happy_path_stores_links_and_cleans_up() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let (submission, _) = submit(&h.catalog, URL).await?;

        let report = h.pipeline.process(URL, &submission.id, None).await;
        assert!(report.success, "{}", report.message);
        assert_eq!(report.video_id.as_deref(), Some("dQw4w9WgXcQ"));

        let row = h
            .catalog
            .find_video_by_source_id("dQw4w9WgXcQ")
            .await?
            .expect("video row");
        assert_eq!(row.status, VideoStatus::Done);
        assert_eq!(row.file_size_bytes, Some(16));
        let key = row.storage_key.clone().expect("storage key");
        assert!(key.starts_with("videos/2009/10/dQw4w9WgXcQ_Title_dQw4w9WgXcQ"));
        assert!(h.store.objects.lock().contains_key(&key));
        assert_eq!(link_count(&h.catalog).await?, 1);

        let downloaded = h.downloader.downloaded.lock().clone();
        assert_eq!(downloaded.len(), 1);
        assert!(!downloaded[0].exists());
        assert_eq!(h.scratch_entries(), 0);
        assert!(h.downloader.rate_limits.lock()[0].is_some());
        Ok(())
    }

    #[tokio::test]
    async fn second_run_links_without_new_row() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let (first, _) = submit(&h.catalog, URL).await?;
        let (second, _) = submit(&h.catalog, "https://youtu.be/dQw4w9WgXcQ").await?;

        assert!(h.pipeline.process(URL, &first.id, None).await.success);
        let report = h.pipeline.process(URL, &second.id, None).await;
        assert!(report.success);
        assert!(report.message.contains("already exists"), "{}", report.message);

        let again = h.pipeline.process(URL, &second.id, None).await;
        assert!(again.success);

        assert_eq!(video_count(&h.catalog).await?, 1);
        assert_eq!(link_count(&h.catalog).await?, 2);
        assert_eq!(h.downloader.downloaded.lock().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn extraction_failure_has_no_side_effects() -> Result<()> {
        let downloader = FakeDownloader::default();
        downloader.broken_urls.lock().insert(URL.to_string());
        let h = harness(downloader).await?;
        let (submission, _) = submit(&h.catalog, URL).await?;

        let report = h.pipeline.process(URL, &submission.id, None).await;
        assert!(!report.success);
        assert!(report.message.starts_with("Failed to extract metadata"));
        assert_eq!(video_count(&h.catalog).await?, 0);
        assert!(h.downloader.downloaded.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn download_failure_cleans_partial_file() -> Result<()> {
        let downloader = FakeDownloader::default();
        downloader
            .failing_downloads
            .lock()
            .insert("dQw4w9WgXcQ".to_string());
        let h = harness(downloader).await?;
        let (submission, _) = submit(&h.catalog, URL).await?;

        let report = h.pipeline.process(URL, &submission.id, None).await;
        assert!(!report.success);
        assert!(report.message.starts_with("Download failed"));
        let partial = h.downloader.downloaded.lock()[0].clone();
        assert!(!partial.exists());
        assert_eq!(h.scratch_entries(), 0);
        assert_eq!(video_count(&h.catalog).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn upload_failure_still_cleans_up() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        h.store
            .fail_keys_containing
            .lock()
            .insert("dQw4w9WgXcQ".to_string());
        let (submission, _) = submit(&h.catalog, URL).await?;

        let report = h.pipeline.process(URL, &submission.id, None).await;
        assert!(!report.success);
        assert!(report.message.starts_with("Upload to storage failed"), "{}", report.message);
        let uploaded_from = h.store.uploaded_from.lock()[0].clone();
        assert!(!uploaded_from.exists());
        assert_eq!(h.scratch_entries(), 0);
        assert_eq!(video_count(&h.catalog).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn persistence_failure_still_cleans_up() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let (submission, _) = submit(&h.catalog, URL).await?;
        let conn = h.catalog.connect().await?;
        conn.execute("DROP TABLE submission_videos", params![]).await?;

        let report = h.pipeline.process(URL, &submission.id, None).await;
        assert!(!report.success);
        assert!(report.message.starts_with("Database error"), "{}", report.message);
        assert_eq!(h.scratch_entries(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_insert_removes_the_uploaded_object() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let (submission, _) = submit(&h.catalog, URL).await?;
        let conn = h.catalog.connect().await?;
        conn.execute(
            r#"
            CREATE TRIGGER refuse_videos BEFORE INSERT ON videos
            BEGIN SELECT RAISE(ABORT, 'videos are read-only'); END
            "#,
            params![],
        )
        .await?;

        let report = h.pipeline.process(URL, &submission.id, None).await;
        assert!(!report.success);
        assert!(report.message.starts_with("Database error"), "{}", report.message);
        assert_eq!(h.store.uploaded_from.lock().len(), 1);
        assert!(h.store.objects.lock().is_empty());
        assert_eq!(h.scratch_entries(), 0);
        Ok(())
    }

    struct PanickingStore;

    impl ObjectStore for PanickingStore {
        fn upload<'a>(
            &'a self,
            _local: &'a Path,
            _key: &'a str,
            _content_type: &'a str,
        ) -> BoxFuture<'a, Result<String, IngestError>> {
            Box::pin(async { panic!("store exploded") })
        }

        fn delete<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<(), IngestError>> {
            Box::pin(async { Ok(()) })
        }

        fn exists<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<bool, IngestError>> {
            Box::pin(async { Ok(false) })
        }

        fn presign(&self, key: &str, _ttl: Duration) -> Result<String, IngestError> {
            Ok(key.to_string())
        }
    }

    #[tokio::test]
    async fn panic_after_download_still_cleans_up() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        let (submission, _) = submit(&h.catalog, URL).await?;
        let pipeline = VideoPipeline::new(
            h.catalog.clone(),
            ExtractorChain::new(None, h.downloader.clone()),
            Arc::new(PanickingStore),
            quiet_pacing(),
            h.pipeline.scratch_root().to_path_buf(),
        );

        let joined =
            tokio::spawn(async move { pipeline.process(URL, &submission.id, None).await }).await;
        assert!(joined.unwrap_err().is_panic());
        let downloaded = h.downloader.downloaded.lock()[0].clone();
        assert!(!downloaded.exists());
        assert_eq!(h.scratch_entries(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn placeholder_rows_are_claimed_once_and_filled() -> Result<()> {
        let h = harness(FakeDownloader::default()).await?;
        h.catalog.insert_placeholder_video("dQw4w9WgXcQ", URL).await?;
        let row = h.catalog.list_pending_videos(1).await?.remove(0);

        let report = h.pipeline.process_placeholder(&row).await?.expect("claimed");
        assert!(report.success, "{}", report.message);
        let stored = h.catalog.get_video(&row.id).await?.expect("row");
        assert_eq!(stored.status, VideoStatus::Done);
        assert!(stored.storage_url.is_some());
        assert_eq!(h.scratch_entries(), 0);

        assert!(h.pipeline.process_placeholder(&row).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn failing_placeholder_is_marked_failed() -> Result<()> {
        let downloader = FakeDownloader::default();
        downloader.broken_urls.lock().insert(URL.to_string());
        let h = harness(downloader).await?;
        h.catalog.insert_placeholder_video("dQw4w9WgXcQ", URL).await?;
        let row = h.catalog.list_pending_videos(1).await?.remove(0);

        let report = h.pipeline.process_placeholder(&row).await?.expect("claimed");
        assert!(!report.success);
        let stored = h.catalog.get_video(&row.id).await?.expect("row");
        assert_eq!(stored.status, VideoStatus::Failed);
        Ok(())
    }
}
