#![forbid(unsafe_code)]

//! Download-capable backend driving the `yt-dlp` executable.

use std::{
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::process::Command;

use crate::{
    BoxFuture,
    classifier::{self, UrlKind},
    config::ExtractorSettings,
    error::IngestError,
    extractor::{DownloadRequest, FormatDetails, MediaDownloader, MetadataExtractor, MetadataRecord},
    pacing::PacingPolicy,
};

const FORMAT_PREFERENCE: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";
const MEDIA_EXTENSIONS: [&str; 4] = ["mp4", "mkv", "webm", "m4a"];
const REFERER: &str = "https://www.youtube.com/";

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn first(&self) -> Option<&T> {
        match self {
            OneOrMany::One(value) => Some(value),
            OneOrMany::Many(values) => values.first(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum CreatorInfo {
    Name(String),
    Object {
        name: Option<String>,
        title: Option<String>,
        id: Option<String>,
        channel_id: Option<String>,
    },
}

impl CreatorInfo {
    fn name(&self) -> Option<&str> {
        match self {
            CreatorInfo::Name(value) => Some(value.as_str()),
            CreatorInfo::Object { name, title, .. } => name.as_deref().or(title.as_deref()),
        }
    }

    fn id(&self) -> Option<&str> {
        match self {
            CreatorInfo::Name(_) => None,
            CreatorInfo::Object { id, channel_id, .. } => id.as_deref().or(channel_id.as_deref()),
        }
    }
}

/// Subset of the `yt-dlp --dump-single-json` payload. Everything is optional
/// because older or restricted videos omit fields freely.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    description: Option<String>,
    like_count: Option<i64>,
    view_count: Option<i64>,
    upload_date: Option<String>,
    uploader: Option<OneOrMany<CreatorInfo>>,
    uploader_id: Option<String>,
    channel: Option<OneOrMany<CreatorInfo>>,
    channel_id: Option<OneOrMany<String>>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    categories: Option<Vec<String>>,
    webpage_url: Option<String>,
    filesize: Option<i64>,
    filesize_approx: Option<i64>,
    #[serde(default)]
    formats: Option<Vec<FormatInfo>>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    format_id: Option<String>,
    ext: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    fps: Option<f64>,
    vcodec: Option<String>,
    filesize: Option<i64>,
    filesize_approx: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    user_agent: String,
    accept_language: String,
    cookies_file: Option<PathBuf>,
    request_sleep: (f64, f64),
    metadata_timeout: Duration,
    download_timeout: Duration,
}

impl YtDlp {
    pub fn new(settings: &ExtractorSettings, pacing: &PacingPolicy) -> Self {
        Self {
            binary: settings.ytdlp_binary.clone(),
            user_agent: settings.user_agent.clone(),
            accept_language: settings.accept_language.clone(),
            cookies_file: settings.cookies_file.clone(),
            request_sleep: (pacing.delay_min_secs, pacing.delay_max_secs),
            metadata_timeout: settings.metadata_timeout,
            download_timeout: settings.download_timeout,
        }
    }

    /// Fails when the configured binary cannot be started.
    pub async fn ensure_available(&self) -> anyhow::Result<()> {
        let status = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => anyhow::bail!(
                "{} is installed but `--version` exited with {status}",
                self.binary.display()
            ),
            Err(err) => anyhow::bail!(
                "{} is not installed or not in PATH: {err}",
                self.binary.display()
            ),
        }
    }

    /// Headers, cookies and request pacing shared by every invocation.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--add-header")
            .arg(format!("User-Agent:{}", self.user_agent))
            .arg("--add-header")
            .arg(format!("Accept-Language:{}", self.accept_language))
            .arg("--referer")
            .arg(REFERER);

        if let Some(cookies) = &self.cookies_file {
            if cookies.exists() {
                command.arg("--cookies").arg(cookies);
            } else {
                warn!("cookies file {} not found, continuing without it", cookies.display());
            }
        }

        let (min_sleep, max_sleep) = self.request_sleep;
        if min_sleep > 0.0 {
            command
                .arg("--sleep-requests")
                .arg(format!("{min_sleep}"))
                .arg("--min-sleep-interval")
                .arg(format!("{min_sleep}"))
                .arg("--max-sleep-interval")
                .arg(format!("{}", max_sleep.max(min_sleep)));
        }
        command
    }

    async fn run(
        &self,
        mut command: Command,
        timeout: Duration,
        what: &str,
    ) -> Result<Output, String> {
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| format!("{what} timed out after {}s", timeout.as_secs()))?
            .map_err(|err| format!("{what}: could not run {}: {err}", self.binary.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "{what} failed ({}): {}",
                output.status,
                stderr.trim().lines().last().unwrap_or("no error output")
            ));
        }
        Ok(output)
    }

    async fn fetch_info(&self, url: &str) -> Result<MetadataRecord, IngestError> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg(url);
        let output = self
            .run(command, self.metadata_timeout, "metadata lookup")
            .await
            .map_err(IngestError::Extraction)?;
        let info: VideoInfo = serde_json::from_slice(&output.stdout)
            .map_err(|err| IngestError::Extraction(format!("parsing yt-dlp JSON: {err}")))?;
        build_record(info)
    }

    async fn list_ids(
        &self,
        url: &str,
        max_items: Option<u32>,
    ) -> Result<Vec<String>, IngestError> {
        let list_url = listing_url(url);
        let mut command = self.command();
        command
            .arg("--flat-playlist")
            .arg("--get-id")
            .arg("--ignore-errors");
        if let Some(max) = max_items {
            command.arg("--playlist-end").arg(max.to_string());
        }
        command.arg(&list_url);

        let output = self
            .run(command, self.metadata_timeout, "playlist listing")
            .await
            .map_err(IngestError::Extraction)?;
        let content = String::from_utf8_lossy(&output.stdout);
        let mut urls = Vec::new();
        for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let candidate = classifier::canonical_url(UrlKind::Video, line);
            if classifier::video_id_from_url(&candidate).is_some() {
                urls.push(candidate);
            } else {
                debug!("skipping non-video listing entry {line:?} from {list_url}");
            }
        }
        if let Some(max) = max_items {
            urls.truncate(max as usize);
        }
        info!("listed {} entries from {list_url}", urls.len());
        Ok(urls)
    }

    async fn fetch_media(&self, request: DownloadRequest<'_>) -> Result<PathBuf, IngestError> {
        let template = request.dest_dir.join(format!("{}.%(ext)s", request.video_id));
        let mut command = self.command();
        command
            .arg("--format")
            .arg(FORMAT_PREFERENCE)
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--max-filesize")
            .arg(request.max_filesize_bytes.to_string())
            .arg("--no-playlist")
            .arg("--output")
            .arg(&template);
        if let Some(rate) = request.rate_limit_bps {
            command.arg("--limit-rate").arg(rate.to_string());
        }
        command.arg(request.url);

        self.run(command, self.download_timeout, "download")
            .await
            .map_err(IngestError::Download)?;

        let path = find_media_file(request.dest_dir, request.video_id)
            .await
            .map_err(|err| IngestError::Download(format!("inspecting scratch dir: {err}")))?
            .ok_or_else(|| {
                IngestError::Download(
                    "yt-dlp finished without producing a media file (size cap or unavailable format)"
                        .into(),
                )
            })?;
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|err| IngestError::Download(err.to_string()))?
            .len();
        if size > request.max_filesize_bytes {
            return Err(IngestError::Download(format!(
                "downloaded file is {size} bytes, above the {} byte cap",
                request.max_filesize_bytes
            )));
        }
        Ok(path)
    }
}

impl MetadataExtractor for YtDlp {
    fn backend(&self) -> &'static str {
        "yt-dlp"
    }

    fn can_download(&self) -> bool {
        true
    }

    fn extract<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<MetadataRecord, IngestError>> {
        Box::pin(self.fetch_info(url))
    }
}

impl MediaDownloader for YtDlp {
    fn list_entries<'a>(
        &'a self,
        url: &'a str,
        max_items: Option<u32>,
    ) -> BoxFuture<'a, Result<Vec<String>, IngestError>> {
        Box::pin(self.list_ids(url, max_items))
    }

    fn download<'a>(
        &'a self,
        request: DownloadRequest<'a>,
    ) -> BoxFuture<'a, Result<PathBuf, IngestError>> {
        Box::pin(self.fetch_media(request))
    }
}

fn build_record(info: VideoInfo) -> Result<MetadataRecord, IngestError> {
    let video_id = info
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| IngestError::Extraction("Could not extract video ID".into()))?;
    let title = info
        .title
        .or(info.fulltitle)
        .unwrap_or_else(|| video_id.clone());

    let uploader = info
        .uploader
        .as_ref()
        .and_then(|value| value.first())
        .and_then(CreatorInfo::name)
        .or_else(|| {
            info.channel
                .as_ref()
                .and_then(|value| value.first())
                .and_then(CreatorInfo::name)
        })
        .map(str::to_string);
    let uploader_id = info
        .uploader_id
        .or_else(|| {
            info.channel_id
                .as_ref()
                .and_then(|ids| ids.first().cloned())
        })
        .or_else(|| {
            info.channel
                .as_ref()
                .and_then(|value| value.first())
                .and_then(CreatorInfo::id)
                .map(str::to_string)
        });

    let formats = info
        .formats
        .unwrap_or_default()
        .into_iter()
        .filter_map(|format| {
            Some(FormatDetails {
                format_id: format.format_id?,
                ext: format.ext,
                width: format.width,
                height: format.height,
                fps: format.fps,
                vcodec: format.vcodec,
                filesize: format.filesize.or(format.filesize_approx),
            })
        })
        .collect();

    Ok(MetadataRecord {
        video_id,
        title,
        description: info.description,
        duration_sec: info.duration.map(|secs| secs.round() as i64),
        view_count: info.view_count,
        like_count: info.like_count,
        upload_date: info.upload_date.as_deref().and_then(upload_date_to_iso),
        uploader,
        uploader_id,
        thumbnail_url: info.thumbnail,
        tags: info.tags.unwrap_or_default(),
        categories: info.categories.unwrap_or_default(),
        webpage_url: info.webpage_url,
        formats,
        filesize: info.filesize.or(info.filesize_approx),
        downloadable: true,
    })
}

/// Converts yt-dlp's `YYYYMMDD` into `YYYY-MM-DD`.
fn upload_date_to_iso(value: &str) -> Option<String> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Channel and user pages are listed through their uploads tab so the flat
/// listing returns videos instead of tab placeholders.
fn listing_url(url: &str) -> String {
    match classifier::classify(url) {
        Ok((UrlKind::Channel | UrlKind::User, _)) => with_videos_tab(url),
        _ => url.to_string(),
    }
}

fn with_videos_tab(channel_url: &str) -> String {
    let (without_fragment, fragment) = match channel_url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (channel_url, None),
    };
    let (base, query) = match without_fragment.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (without_fragment, None),
    };

    let base = base.trim_end_matches('/');
    let has_tab = ["/videos", "/shorts", "/streams", "/playlists"]
        .iter()
        .any(|tab| base.ends_with(tab));
    let mut result = if has_tab {
        base.to_string()
    } else {
        format!("{base}/videos")
    };

    if let Some(query) = query {
        result.push('?');
        result.push_str(query);
    }
    if let Some(fragment) = fragment {
        result.push('#');
        result.push_str(fragment);
    }
    result
}

/// Largest finished media file for `video_id` inside `dir`.
async fn find_media_file(dir: &Path, video_id: &str) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut best: Option<(u64, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.starts_with(video_id) {
            continue;
        }
        let ext = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        if !MEDIA_EXTENSIONS.contains(&ext) {
            continue;
        }
        let size = entry.metadata().await?.len();
        if best.as_ref().is_none_or(|(best_size, _)| size > *best_size) {
            best = Some((size, path));
        }
    }
    Ok(best.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    const STUB: &str = r#"#!/usr/bin/env bash
set -eu
log_dir="$(dirname "$0")"
echo "$@" >> "$log_dir/args.log"
output=""
mode="info"
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
    --flat-playlist)
      mode="list"
      ;;
    --dump-single-json)
      mode="info"
      ;;
  esac
  shift
done

if [[ -n "$output" ]]; then
  target="${output//%(ext)s/mp4}"
  printf 'media-bytes' > "$target"
  exit 0
fi

if [[ "$mode" == "list" ]]; then
  printf 'dQw4w9WgXcQ\nnot-an-id\n9bZkp7q19f0\n'
  exit 0
fi

cat <<'JSON'
{
  "id": "dQw4w9WgXcQ",
  "title": "Never Gonna Give You Up",
  "description": "Official video",
  "like_count": 18000000,
  "view_count": 1500000000,
  "upload_date": "20091025",
  "uploader": "Rick Astley",
  "channel_id": "UCuAXFkgsw1L7xaCfnd5JJOw",
  "duration": 212.0,
  "thumbnail": "https://i.ytimg.com/vi/dQw4w9WgXcQ/maxresdefault.jpg",
  "tags": ["rick astley", "music"],
  "categories": ["Music"],
  "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
  "formats": [
    {"format_id": "140", "ext": "m4a", "vcodec": "none", "filesize": 3400000},
    {"format_id": "137", "ext": "mp4", "width": 1920, "height": 1080, "fps": 25, "vcodec": "avc1", "filesize": 78000000},
    {"ext": "mp4", "width": 3840, "height": 2160}
  ]
}
JSON
"#;

    fn install_stub(dir: &Path, script: &str) -> Result<PathBuf> {
        let path = dir.join("yt-dlp");
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    fn backend(binary: PathBuf) -> YtDlp {
        YtDlp {
            binary,
            user_agent: "test-agent".into(),
            accept_language: "en-US".into(),
            cookies_file: None,
            request_sleep: (0.0, 0.0),
            metadata_timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn extract_parses_dump_json() -> Result<()> {
        let dir = tempdir()?;
        let ytdlp = backend(install_stub(dir.path(), STUB)?);
        let record = ytdlp
            .extract("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .await?;
        assert_eq!(record.video_id, "dQw4w9WgXcQ");
        assert_eq!(record.title, "Never Gonna Give You Up");
        assert_eq!(record.upload_date.as_deref(), Some("2009-10-25"));
        assert_eq!(record.uploader.as_deref(), Some("Rick Astley"));
        assert_eq!(record.uploader_id.as_deref(), Some("UCuAXFkgsw1L7xaCfnd5JJOw"));
        assert_eq!(record.duration_sec, Some(212));
        assert_eq!(record.formats.len(), 2, "formats without an id are dropped");
        assert_eq!(record.resolution().as_deref(), Some("1920x1080"));
        assert!(record.downloadable);

        let args = fs::read_to_string(dir.path().join("args.log"))?;
        assert!(args.contains("--dump-single-json"));
        assert!(args.contains("User-Agent:test-agent"));
        Ok(())
    }

    #[tokio::test]
    async fn list_entries_builds_watch_urls() -> Result<()> {
        let dir = tempdir()?;
        let ytdlp = backend(install_stub(dir.path(), STUB)?);
        let urls = ytdlp
            .list_entries("https://www.youtube.com/@creator", Some(5))
            .await?;
        assert_eq!(
            urls,
            vec![
                "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
                "https://www.youtube.com/watch?v=9bZkp7q19f0".to_string(),
            ]
        );
        let args = fs::read_to_string(dir.path().join("args.log"))?;
        assert!(args.contains("--playlist-end 5"));
        assert!(args.contains("https://www.youtube.com/@creator/videos"));
        Ok(())
    }

    #[tokio::test]
    async fn download_returns_media_in_scratch_dir() -> Result<()> {
        let dir = tempdir()?;
        let scratch = tempdir()?;
        let ytdlp = backend(install_stub(dir.path(), STUB)?);
        let path = ytdlp
            .download(DownloadRequest {
                url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                video_id: "dQw4w9WgXcQ",
                dest_dir: scratch.path(),
                rate_limit_bps: Some(250_000),
                max_filesize_bytes: 1024,
            })
            .await?;
        assert_eq!(path, scratch.path().join("dQw4w9WgXcQ.mp4"));
        let args = fs::read_to_string(dir.path().join("args.log"))?;
        assert!(args.contains("--limit-rate 250000"));
        assert!(args.contains("--max-filesize 1024"));
        assert!(args.contains(FORMAT_PREFERENCE));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_download_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let scratch = tempdir()?;
        let ytdlp = backend(install_stub(dir.path(), STUB)?);
        let err = ytdlp
            .download(DownloadRequest {
                url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                video_id: "dQw4w9WgXcQ",
                dest_dir: scratch.path(),
                rate_limit_bps: None,
                max_filesize_bytes: 4,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Download(_)), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn failing_binary_maps_to_extraction_error() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(
            dir.path(),
            "#!/usr/bin/env bash\necho 'ERROR: Private video' >&2\nexit 1\n",
        )?;
        let err = backend(stub)
            .extract("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .await
            .unwrap_err();
        match err {
            IngestError::Extraction(message) => assert!(message.contains("Private video")),
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn slow_binary_times_out() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_stub(dir.path(), "#!/usr/bin/env bash\nsleep 5\n")?;
        let mut ytdlp = backend(stub);
        ytdlp.metadata_timeout = Duration::from_millis(200);
        let err = ytdlp
            .extract("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn availability_check_runs_the_binary() -> Result<()> {
        let dir = tempdir()?;
        let ok = install_stub(dir.path(), "#!/usr/bin/env bash\necho 2024.01.01\n")?;
        backend(ok).ensure_available().await?;

        assert!(
            backend(dir.path().join("missing"))
                .ensure_available()
                .await
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn missing_id_is_an_extraction_error() {
        let info: VideoInfo = serde_json::from_str(r#"{"title": "x"}"#).unwrap();
        let err = build_record(info).unwrap_err();
        assert_eq!(err, IngestError::Extraction("Could not extract video ID".into()));
    }

    #[test]
    fn listing_url_appends_videos_tab_once() {
        assert_eq!(
            listing_url("https://www.youtube.com/@creator"),
            "https://www.youtube.com/@creator/videos"
        );
        assert_eq!(
            listing_url("https://www.youtube.com/@creator/videos/"),
            "https://www.youtube.com/@creator/videos"
        );
        assert_eq!(
            listing_url("https://www.youtube.com/user/legacy?view=0"),
            "https://www.youtube.com/user/legacy/videos?view=0"
        );
        let playlist = "https://www.youtube.com/playlist?list=PL123";
        assert_eq!(listing_url(playlist), playlist);
    }

    #[test]
    fn upload_date_conversion() {
        assert_eq!(upload_date_to_iso("20240102").as_deref(), Some("2024-01-02"));
        assert!(upload_date_to_iso("2024").is_none());
        assert!(upload_date_to_iso("20241340").is_none());
    }
}
