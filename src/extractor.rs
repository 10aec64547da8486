#![forbid(unsafe_code)]

//! Capability interface over the metadata backends.
//!
//! Two kinds of backend exist. A download-capable one (yt-dlp) can both
//! describe and fetch a video. A metadata-only one (the page API) can only
//! describe it and marks its records with `downloadable == false`. The
//! pipeline checks that flag and re-extracts through the download-capable
//! backend before it downloads anything.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{info, warn};

use crate::{
    BoxFuture,
    config::ExtractorSettings,
    error::IngestError,
    pacing::PacingPolicy,
    page_api::PageApiExtractor,
    ytdlp::YtDlp,
};

/// One entry of the format list a backend reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatDetails {
    pub format_id: String,
    pub ext: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub vcodec: Option<String>,
    pub filesize: Option<i64>,
}

impl FormatDetails {
    fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some("none")
    }
}

/// Normalized metadata independent of the backend that produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataRecord {
    pub video_id: String,
    pub title: String,
    pub description: Option<String>,
    pub duration_sec: Option<i64>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    /// `YYYY-MM-DD`.
    pub upload_date: Option<String>,
    pub uploader: Option<String>,
    pub uploader_id: Option<String>,
    pub thumbnail_url: Option<String>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
    pub webpage_url: Option<String>,
    pub formats: Vec<FormatDetails>,
    pub filesize: Option<i64>,
    /// Capability flag: false when the record cannot drive a download.
    pub downloadable: bool,
}

impl MetadataRecord {
    pub fn new(video_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            title: title.into(),
            downloadable: true,
            ..Self::default()
        }
    }

    /// Highest video format by (height, width).
    pub fn best_video_format(&self) -> Option<&FormatDetails> {
        self.formats
            .iter()
            .filter(|format| format.has_video())
            .filter(|format| format.height.is_some() || format.width.is_some())
            .max_by_key(|format| (format.height.unwrap_or(0), format.width.unwrap_or(0)))
    }

    /// `WIDTHxHEIGHT` of the best video format.
    pub fn resolution(&self) -> Option<String> {
        let best = self.best_video_format()?;
        match (best.width, best.height) {
            (Some(width), Some(height)) => Some(format!("{width}x{height}")),
            _ => None,
        }
    }
}

/// Inputs for a single media download.
#[derive(Debug, Clone)]
pub struct DownloadRequest<'a> {
    pub url: &'a str,
    pub video_id: &'a str,
    /// Private scratch directory owned by the caller.
    pub dest_dir: &'a Path,
    pub rate_limit_bps: Option<u64>,
    pub max_filesize_bytes: u64,
}

pub trait MetadataExtractor: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    fn can_download(&self) -> bool;

    fn extract<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<MetadataRecord, IngestError>>;
}

pub trait MediaDownloader: MetadataExtractor {
    /// Shallow listing of a playlist/channel: member watch URLs only, no
    /// per-video metadata.
    fn list_entries<'a>(
        &'a self,
        url: &'a str,
        max_items: Option<u32>,
    ) -> BoxFuture<'a, Result<Vec<String>, IngestError>>;

    /// Fetches the media into `request.dest_dir` and returns the file path.
    fn download<'a>(
        &'a self,
        request: DownloadRequest<'a>,
    ) -> BoxFuture<'a, Result<PathBuf, IngestError>>;
}

/// Primary metadata backend plus the download-capable fallback.
#[derive(Clone)]
pub struct ExtractorChain {
    primary: Option<Arc<dyn MetadataExtractor>>,
    downloader: Arc<dyn MediaDownloader>,
}

impl ExtractorChain {
    /// `primary` is only needed when it differs from the downloader; `None`
    /// means the downloader answers metadata lookups too.
    pub fn new(
        primary: Option<Arc<dyn MetadataExtractor>>,
        downloader: Arc<dyn MediaDownloader>,
    ) -> Self {
        Self {
            primary,
            downloader,
        }
    }

    /// yt-dlp as the download-capable backend, fronted by the page API when
    /// one is configured.
    pub fn from_settings(
        settings: &ExtractorSettings,
        pacing: &PacingPolicy,
    ) -> anyhow::Result<Self> {
        let downloader: Arc<dyn MediaDownloader> = Arc::new(YtDlp::new(settings, pacing));
        let primary = match &settings.page_api {
            Some(page_api) => {
                let extractor: Arc<dyn MetadataExtractor> =
                    Arc::new(PageApiExtractor::new(page_api.clone())?);
                Some(extractor)
            }
            None => None,
        };
        Ok(Self::new(primary, downloader))
    }

    pub fn downloader(&self) -> &dyn MediaDownloader {
        self.downloader.as_ref()
    }

    /// Metadata lookup. A failing metadata-only primary falls back to the
    /// download-capable backend.
    pub async fn metadata(&self, url: &str) -> Result<MetadataRecord, IngestError> {
        let Some(primary) = &self.primary else {
            return self.downloader.extract(url).await;
        };
        match primary.extract(url).await {
            Ok(record) => Ok(record),
            Err(err) if !primary.can_download() => {
                warn!(
                    "backend={} url={url} metadata lookup failed, falling back to {}: {err}",
                    primary.backend(),
                    self.downloader.backend()
                );
                self.downloader.extract(url).await
            }
            Err(err) => Err(err),
        }
    }

    /// Returns `record` unchanged when it can drive a download, otherwise
    /// re-extracts through the download-capable backend.
    pub async fn ensure_downloadable(
        &self,
        url: &str,
        record: MetadataRecord,
    ) -> Result<MetadataRecord, IngestError> {
        if record.downloadable {
            return Ok(record);
        }
        info!(
            "video={} re-extracting through {} for download",
            record.video_id,
            self.downloader.backend()
        );
        let upgraded = self.downloader.extract(url).await?;
        if !upgraded.downloadable {
            return Err(IngestError::Extraction(format!(
                "{} returned a record without download formats",
                self.downloader.backend()
            )));
        }
        Ok(upgraded)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory backends shared by the pipeline, collection and job tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    pub(crate) fn sample_record(video_id: &str) -> MetadataRecord {
        MetadataRecord {
            description: Some("desc".into()),
            duration_sec: Some(212),
            view_count: Some(1_000),
            like_count: Some(10),
            upload_date: Some("2009-10-25".into()),
            uploader: Some("Uploader".into()),
            uploader_id: Some("@uploader".into()),
            thumbnail_url: Some(format!("https://i.ytimg.com/vi/{video_id}/hq.jpg")),
            tags: vec!["music".into()],
            categories: vec!["Music".into()],
            formats: vec![FormatDetails {
                format_id: "137".into(),
                ext: Some("mp4".into()),
                width: Some(1920),
                height: Some(1080),
                fps: Some(25.0),
                vcodec: Some("avc1".into()),
                filesize: Some(40_000_000),
            }],
            ..MetadataRecord::new(video_id, format!("Title {video_id}"))
        }
    }

    /// Scriptable download-capable backend.
    #[derive(Default)]
    pub(crate) struct FakeDownloader {
        pub entries: Mutex<HashMap<String, Vec<String>>>,
        pub broken_urls: Mutex<HashSet<String>>,
        pub failing_downloads: Mutex<HashSet<String>>,
        pub extract_calls: Mutex<Vec<String>>,
        pub downloaded: Mutex<Vec<PathBuf>>,
        pub rate_limits: Mutex<Vec<Option<u64>>>,
    }

    impl FakeDownloader {
        pub(crate) fn with_entries(url: &str, entries: Vec<String>) -> Self {
            let fake = Self::default();
            fake.entries.lock().insert(url.to_string(), entries);
            fake
        }
    }

    impl MetadataExtractor for FakeDownloader {
        fn backend(&self) -> &'static str {
            "fake-downloader"
        }

        fn can_download(&self) -> bool {
            true
        }

        fn extract<'a>(
            &'a self,
            url: &'a str,
        ) -> BoxFuture<'a, Result<MetadataRecord, IngestError>> {
            Box::pin(async move {
                self.extract_calls.lock().push(url.to_string());
                if self.broken_urls.lock().contains(url) {
                    return Err(IngestError::Extraction(format!("video unavailable: {url}")));
                }
                let id = crate::classifier::video_id_from_url(url)
                    .ok_or_else(|| IngestError::Extraction(format!("no id in {url}")))?;
                Ok(sample_record(&id))
            })
        }
    }

    impl MediaDownloader for FakeDownloader {
        fn list_entries<'a>(
            &'a self,
            url: &'a str,
            max_items: Option<u32>,
        ) -> BoxFuture<'a, Result<Vec<String>, IngestError>> {
            Box::pin(async move {
                let mut entries = self
                    .entries
                    .lock()
                    .get(url)
                    .cloned()
                    .ok_or_else(|| IngestError::Extraction(format!("cannot list {url}")))?;
                if let Some(max) = max_items {
                    entries.truncate(max as usize);
                }
                Ok(entries)
            })
        }

        fn download<'a>(
            &'a self,
            request: DownloadRequest<'a>,
        ) -> BoxFuture<'a, Result<PathBuf, IngestError>> {
            Box::pin(async move {
                self.rate_limits.lock().push(request.rate_limit_bps);
                let path = request.dest_dir.join(format!("{}.mp4", request.video_id));
                tokio::fs::write(&path, b"fake-media-bytes")
                    .await
                    .map_err(|err| IngestError::Download(err.to_string()))?;
                self.downloaded.lock().push(path.clone());
                if self.failing_downloads.lock().contains(request.video_id) {
                    return Err(IngestError::Download("connection reset".into()));
                }
                Ok(path)
            })
        }
    }

    /// Metadata-only backend that always answers with a non-downloadable
    /// record, or fails when `fail` is set.
    pub(crate) struct FakeMetadataOnly {
        pub fail: bool,
        pub calls: Mutex<usize>,
    }

    impl MetadataExtractor for FakeMetadataOnly {
        fn backend(&self) -> &'static str {
            "fake-metadata-only"
        }

        fn can_download(&self) -> bool {
            false
        }

        fn extract<'a>(
            &'a self,
            url: &'a str,
        ) -> BoxFuture<'a, Result<MetadataRecord, IngestError>> {
            Box::pin(async move {
                *self.calls.lock() += 1;
                if self.fail {
                    return Err(IngestError::Extraction("blocked by anti-bot page".into()));
                }
                let id = crate::classifier::video_id_from_url(url)
                    .ok_or_else(|| IngestError::Extraction(format!("no id in {url}")))?;
                Ok(MetadataRecord {
                    downloadable: false,
                    formats: Vec::new(),
                    ..sample_record(&id)
                })
            })
        }
    }
}
