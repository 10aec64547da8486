#![forbid(unsafe_code)]

//! HTTP front door: URL submission, job and video queries, validation,
//! dashboard numbers and media serving out of the filesystem bucket.
//!
//! Submissions are only recorded and queued here. The `worker` binary does
//! the scraping.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path as AxumPath, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;
use tubeharvest::{
    admission::{Admission, AdmissionPolicy, EndpointClass, RateLimiter, check_capacity},
    catalog::{Catalog, DashboardStats, Job, JobStatus, Submission, VideoRow},
    classifier::{self, UrlKind},
    config::{SettingsOverrides, init_logger, resolve_settings},
    error::IngestError,
    extractor::ExtractorChain,
    queue::TaskQueue,
    security::ensure_not_root,
    storage::{LocalBucket, ObjectStore},
};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;
const DASHBOARD_RECENT: i64 = 10;

#[derive(Debug, Parser)]
#[command(name = "server", about = "Accepts YouTube URLs and exposes ingest state")]
struct ServerArgs {
    /// Alternative `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    data_root: Option<PathBuf>,
}

/// Shared handler state. Everything in here is cheap to clone.
#[derive(Clone)]
struct AppState {
    catalog: Catalog,
    queue: TaskQueue,
    limiter: Arc<RateLimiter>,
    chain: ExtractorChain,
    bucket: Arc<LocalBucket>,
    submit_lookup_timeout: Duration,
    presign_ttl: Duration,
}

impl AppState {
    fn admission(&self) -> &AdmissionPolicy {
        self.limiter.policy()
    }

    fn admit(&self, client: &str, class: EndpointClass) -> ApiResult<()> {
        match self.limiter.admit(client, class) {
            Admission::Allow => Ok(()),
            Admission::Reject {
                reason,
                retry_after,
            } => {
                info!("client={client} rejected on {}", class.as_str());
                Err(ApiError::rate_limited(reason, retry_after))
            }
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
            retry_after: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    /// Malformed JSON bodies, answered in the same shape as every other error.
    fn invalid_request(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    fn rate_limited(message: String, retry_after: u64) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded", message)
        }
    }

    /// Catalog failures are logged in full and reported as a 500.
    fn database(err: anyhow::Error) -> Self {
        error!("database error: {err:#}");
        Self::internal(format!("Database error: {err:#}"))
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        let status = match &err {
            IngestError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            IngestError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            IngestError::Extraction(_) | IngestError::Download(_) => StatusCode::BAD_GATEWAY,
            IngestError::StorageUpload(_) | IngestError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let (message, retry_after) = match err.clone() {
            IngestError::CapacityExceeded {
                reason,
                retry_after,
            } => (reason, Some(retry_after)),
            other => (other.to_string(), None),
        };
        Self {
            status,
            error: err.kind(),
            message,
            retry_after,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.error,
            "message": self.message,
        });
        if let Some(retry_after) = self.retry_after {
            body["retry_after"] = retry_after.into();
        }
        let mut response = (self.status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let args = ServerArgs::parse();
    ensure_not_root("server")?;

    let settings = resolve_settings(SettingsOverrides {
        env_path: args.env_file,
        host: args.host,
        port: args.port,
        data_root: args.data_root,
        ..SettingsOverrides::default()
    })?;

    let catalog = Catalog::open(&settings.database_path())
        .await
        .context("opening catalog")?;
    let bucket = Arc::new(LocalBucket::new(&settings.storage));
    let state = AppState {
        queue: TaskQueue::new(catalog.clone()),
        catalog,
        limiter: Arc::new(RateLimiter::new(settings.admission.clone())),
        chain: ExtractorChain::from_settings(&settings.extractor, &settings.pacing)?,
        bucket,
        submit_lookup_timeout: settings.extractor.submit_metadata_timeout,
        presign_ttl: settings.storage.presign_ttl,
    };

    let host: IpAddr = settings
        .host
        .parse()
        .with_context(|| format!("INGEST_HOST {:?} is not an IP address", settings.host))?;
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running API server")?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/urls", post(submit_url).get(list_urls))
        .route("/api/urls/{id}", get(get_url))
        .route("/api/urls/{id}/videos", get(get_url_videos))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/validate-url", post(validate_url))
        .route("/api/dashboard-data", get(dashboard_data))
        .route("/api/queue-status", get(queue_status))
        .route("/api/videos/{id}/link", get(video_link))
        .route("/media/{*key}", get(serve_media))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}

/// First `X-Forwarded-For` hop when a proxy sits in front, otherwise the
/// peer address.
fn client_identity(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

#[derive(Debug, Deserialize)]
struct UrlRequest {
    url: String,
}

type UrlBody = Result<Json<UrlRequest>, JsonRejection>;

fn url_request(body: UrlBody) -> ApiResult<UrlRequest> {
    body.map(|Json(request)| request).map_err(ApiError::invalid_request)
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    success: bool,
    message: String,
    url_id: String,
    job_id: String,
    task_id: Option<String>,
    url_type: UrlKind,
    title: Option<String>,
    background_processing: bool,
}

async fn submit_url(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: UrlBody,
) -> ApiResult<Json<SubmitResponse>> {
    let client = client_identity(&headers, peer);
    state.admit(&client, EndpointClass::Submit)?;
    let request = url_request(body)?;
    let classified = classifier::inspect(&request.url)?;
    check_capacity(state.admission(), &state.queue, &state.catalog).await?;

    let (title, description) =
        lookup_title(&state, classified.kind, &classified.canonical_url).await;

    let (submission, job) = state
        .catalog
        .create_submission_with_job(
            &request.url,
            &classified,
            title.as_deref(),
            description.as_deref(),
        )
        .await
        .map_err(ApiError::database)?;

    let task_id = match state
        .queue
        .enqueue(&job.id, &submission.canonical_url, submission.url_type)
        .await
    {
        Ok(task_id) => Some(task_id),
        Err(err) => {
            warn!("job={} could not be queued: {err:#}", job.id);
            None
        }
    };
    info!(
        "client={client} submission={} job={} url_type={}",
        submission.id,
        job.id,
        submission.url_type.as_str()
    );

    Ok(Json(SubmitResponse {
        success: true,
        message: "URL submitted successfully".to_string(),
        url_id: submission.id,
        job_id: job.id,
        background_processing: task_id.is_some(),
        task_id,
        url_type: submission.url_type,
        title: submission.title,
    }))
}

/// Best-effort title for single videos. Failures and time-outs only cost
/// the title; the submission goes ahead regardless.
async fn lookup_title(
    state: &AppState,
    kind: UrlKind,
    canonical_url: &str,
) -> (Option<String>, Option<String>) {
    if kind != UrlKind::Video || state.submit_lookup_timeout.is_zero() {
        return (None, None);
    }
    match tokio::time::timeout(state.submit_lookup_timeout, state.chain.metadata(canonical_url))
        .await
    {
        Ok(Ok(record)) => (Some(record.title), record.description),
        Ok(Err(err)) => {
            warn!("could not extract metadata for {canonical_url}: {err}");
            (None, None)
        }
        Err(_) => {
            warn!("metadata lookup for {canonical_url} timed out");
            (None, None)
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

fn page_size(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

async fn list_urls(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Submission>>> {
    let submissions = state
        .catalog
        .list_submissions(page_size(page.limit), page.offset.unwrap_or(0).max(0))
        .await
        .map_err(ApiError::database)?;
    Ok(Json(submissions))
}

async fn get_url(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Submission>> {
    state
        .catalog
        .get_submission(&id)
        .await
        .map_err(ApiError::database)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("URL not found"))
}

async fn get_url_videos(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Vec<VideoRow>>> {
    if state
        .catalog
        .get_submission(&id)
        .await
        .map_err(ApiError::database)?
        .is_none()
    {
        return Err(ApiError::not_found("URL not found"));
    }
    let videos = state
        .catalog
        .videos_for_submission(&id)
        .await
        .map_err(ApiError::database)?;
    Ok(Json(videos))
}

#[derive(Debug, Deserialize)]
struct JobQuery {
    status: Option<String>,
    limit: Option<i64>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            JobStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown job status {raw:?}")))?,
        ),
        None => None,
    };
    let jobs = state
        .catalog
        .list_jobs(status, page_size(query.limit))
        .await
        .map_err(ApiError::database)?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Job>> {
    state
        .catalog
        .get_job(&id)
        .await
        .map_err(ApiError::database)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Job not found"))
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ValidationResponse {
    Valid {
        valid: bool,
        url_type: UrlKind,
        normalized_url: String,
        identifier: String,
    },
    Invalid {
        valid: bool,
        error: String,
    },
}

async fn validate_url(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: UrlBody,
) -> ApiResult<Json<ValidationResponse>> {
    state.admit(&client_identity(&headers, peer), EndpointClass::Validate)?;
    let request = url_request(body)?;
    let response = match classifier::inspect(&request.url) {
        Ok(classified) => ValidationResponse::Valid {
            valid: true,
            url_type: classified.kind,
            normalized_url: classified.canonical_url,
            identifier: classified.identifier,
        },
        Err(err) => ValidationResponse::Invalid {
            valid: false,
            error: err.to_string(),
        },
    };
    Ok(Json(response))
}

async fn dashboard_data(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Json<DashboardStats>> {
    state.admit(&client_identity(&headers, peer), EndpointClass::Dashboard)?;
    let stats = state
        .catalog
        .dashboard(DASHBOARD_RECENT)
        .await
        .map_err(ApiError::database)?;
    Ok(Json(stats))
}

#[derive(Debug, Serialize)]
struct QueueStatus {
    queued: u64,
    leased: u64,
    max_queue_size: u64,
    status: &'static str,
    rate_limits: HashMap<&'static str, String>,
}

async fn queue_status(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Json<QueueStatus>> {
    state.admit(&client_identity(&headers, peer), EndpointClass::Dashboard)?;
    let queued = state.queue.depth().await.map_err(ApiError::database)?;
    let leased = state
        .queue
        .leased_count()
        .await
        .map_err(ApiError::database)?;
    let policy = state.admission();
    let window = policy.window_secs;
    let rate_limits = HashMap::from([
        (
            EndpointClass::Submit.as_str(),
            format!("{} per {window}s", policy.submit_limit),
        ),
        (
            EndpointClass::Validate.as_str(),
            format!("{} per {window}s", policy.validate_limit),
        ),
        (
            EndpointClass::Dashboard.as_str(),
            format!("{} per {window}s", policy.dashboard_limit),
        ),
    ]);
    Ok(Json(QueueStatus {
        queued,
        leased,
        max_queue_size: policy.max_queue_size,
        status: if queued >= policy.max_queue_size {
            "overloaded"
        } else {
            "healthy"
        },
        rate_limits,
    }))
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    database: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    match state.catalog.ping().await {
        Ok(()) => Json(HealthStatus {
            status: "healthy",
            database: "healthy".to_string(),
        }),
        Err(err) => Json(HealthStatus {
            status: "degraded",
            database: format!("error: {err:#}"),
        }),
    }
}

#[derive(Debug, Serialize)]
struct VideoLink {
    video_id: String,
    url: String,
    expires_in: Option<u64>,
}

async fn video_link(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<VideoLink>> {
    let video = state
        .catalog
        .get_video(&id)
        .await
        .map_err(ApiError::database)?
        .ok_or_else(|| ApiError::not_found("Video not found"))?;
    let key = video
        .storage_key
        .ok_or_else(|| ApiError::not_found("Video has no stored media"))?;

    match state.bucket.presign(&key, state.presign_ttl) {
        Ok(url) => Ok(Json(VideoLink {
            video_id: video.id,
            url,
            expires_in: Some(state.presign_ttl.as_secs()),
        })),
        Err(_) if state.bucket.public_read() => Ok(Json(VideoLink {
            video_id: video.id,
            url: state.bucket.public_url(&key),
            expires_in: None,
        })),
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Deserialize)]
struct PresignQuery {
    expires: Option<i64>,
    signature: Option<String>,
}

async fn serve_media(
    State(state): State<AppState>,
    AxumPath(key): AxumPath<String>,
    Query(query): Query<PresignQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !state.bucket.public_read() {
        let (Some(expires), Some(signature)) = (query.expires, query.signature.as_deref()) else {
            return Err(ApiError::forbidden("a presigned link is required"));
        };
        if !state
            .bucket
            .verify(&key, expires, signature, Utc::now().timestamp())
        {
            return Err(ApiError::forbidden("invalid or expired signature"));
        }
    }
    let path = state
        .bucket
        .resolve(&key)
        .map_err(|_| ApiError::not_found("file not found"))?;
    stream_file(path, &headers).await
}

async fn stream_file(path: PathBuf, headers: &HeaderMap) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(format!("seeking media: {err}")))?;
            let mut response =
                Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value).map_err(|err| ApiError::internal(err.to_string()))
}

/// Single `bytes=` range, including the `-N` suffix form.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let range = value.strip_prefix("bytes=")?.trim();
    let (start, end) = range.split_once('-')?;

    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix), size.saturating_sub(1)));
    }

    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        size.saturating_sub(1)
    } else {
        end.parse().ok()?
    };
    (end >= start).then_some((start, end))
}
