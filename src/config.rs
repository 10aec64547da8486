#![forbid(unsafe_code)]

use anyhow::{Context, Result, ensure};
use env_logger::Env;
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{admission::AdmissionPolicy, pacing::PacingPolicy};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_INGEST_PORT: u16 = 8080;
pub const DEFAULT_INGEST_HOST: &str = "127.0.0.1";
pub const DEFAULT_DATA_ROOT: &str = "./data";
pub const DEFAULT_DOWNLOAD_PATH: &str = "/tmp/youtube_downloads";
pub const DATABASE_FILE: &str = "ingest.db";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
pub const DEFAULT_SCRAPERAPI_ENDPOINT: &str = "https://api.scraperapi.com";

/// Installs the process-wide logger. `RUST_LOG` overrides the `info` default.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub data_root: PathBuf,
    pub download_path: PathBuf,
    pub storage: StorageSettings,
    pub extractor: ExtractorSettings,
    pub pacing: PacingPolicy,
    pub admission: AdmissionPolicy,
    pub worker: WorkerSettings,
}

impl Settings {
    pub fn database_path(&self) -> PathBuf {
        self.data_root.join(DATABASE_FILE)
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub root: PathBuf,
    pub public_base_url: String,
    pub signing_secret: Option<String>,
    pub public_read: bool,
    pub presign_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub ytdlp_binary: PathBuf,
    pub user_agent: String,
    pub accept_language: String,
    pub cookies_file: Option<PathBuf>,
    pub metadata_timeout: Duration,
    pub download_timeout: Duration,
    /// Budget for the title lookup done while accepting a video submission.
    /// Zero skips the lookup.
    pub submit_metadata_timeout: Duration,
    /// Present when the metadata-only page API is enabled.
    pub page_api: Option<PageApiSettings>,
}

#[derive(Debug, Clone)]
pub struct PageApiSettings {
    pub api_key: String,
    pub endpoint: String,
    pub render: bool,
    pub premium: bool,
    pub retry_failed: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub job_time_limit: Duration,
    pub max_attempts: u32,
    pub housekeeping_interval: Duration,
    pub stale_job_age: Duration,
    pub max_collection_items: Option<u32>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            lease: Duration::from_secs(7800),
            poll_interval: Duration::from_secs(5),
            job_time_limit: Duration::from_secs(7200),
            max_attempts: 3,
            housekeeping_interval: Duration::from_secs(24 * 3600),
            stale_job_age: Duration::from_secs(24 * 3600),
            max_collection_items: None,
        }
    }
}

/// Values coming from CLI flags. They beat both the env file and the process
/// environment.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub env_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_root: Option<PathBuf>,
    pub concurrency: Option<usize>,
}

/// Optional TOML file named by `POLICY_FILE`. Every field is optional so the
/// file only needs to carry what it changes.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PolicyFile {
    pacing: PacingOverrides,
    admission: AdmissionOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PacingOverrides {
    hard_cap_bps: Option<u64>,
    simulate_watch_time: Option<bool>,
    watch_speed: Option<f64>,
    min_rate_bps: Option<u64>,
    delay_min_secs: Option<f64>,
    delay_max_secs: Option<f64>,
    max_file_size_bytes: Option<u64>,
    bitrate_1080_mbps: Option<f64>,
    bitrate_720_mbps: Option<f64>,
    bitrate_480_mbps: Option<f64>,
    bitrate_low_mbps: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AdmissionOverrides {
    submit_limit: Option<usize>,
    validate_limit: Option<usize>,
    dashboard_limit: Option<usize>,
    window_secs: Option<u64>,
    max_queue_size: Option<u64>,
    capacity_retry_after_secs: Option<u64>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    let mut settings = build_settings(&file_vars, env_var_string, overrides)?;
    if let Some(policy_path) = lookup_value("POLICY_FILE", &file_vars, &env_var_string) {
        apply_policy_file(&mut settings, Path::new(&policy_path))?;
    }
    Ok(settings)
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<Settings> {
    let vars = Lookup {
        file_vars,
        env_lookup,
    };

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| vars.get("INGEST_HOST"))
        .unwrap_or_else(|| DEFAULT_INGEST_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| vars.parsed("INGEST_PORT"))
        .unwrap_or(DEFAULT_INGEST_PORT);
    let data_root = overrides
        .data_root
        .or_else(|| vars.get("DATA_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
    let download_path = vars
        .get("DOWNLOAD_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_PATH));

    let storage = StorageSettings {
        root: vars
            .get("STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join("bucket")),
        public_base_url: vars
            .get("STORAGE_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://{host}:{port}/media"))
            .trim_end_matches('/')
            .to_string(),
        signing_secret: vars.get("STORAGE_SIGNING_SECRET"),
        public_read: vars.flag("STORAGE_PUBLIC_READ", true),
        presign_ttl: vars.secs("PRESIGN_TTL_SECS", 3600),
    };

    let page_api = if vars.flag("USE_SCRAPERAPI", false) {
        let api_key = vars
            .get("SCRAPERAPI_KEY")
            .context("USE_SCRAPERAPI is enabled but SCRAPERAPI_KEY is not set")?;
        Some(PageApiSettings {
            api_key,
            endpoint: vars
                .get("SCRAPERAPI_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_SCRAPERAPI_ENDPOINT.to_string()),
            render: vars.flag("SCRAPERAPI_RENDER", true),
            premium: vars.flag("SCRAPERAPI_PREMIUM", false),
            retry_failed: vars.flag("SCRAPERAPI_RETRY_FAILED", true),
            timeout: vars.secs("SCRAPERAPI_TIMEOUT", 60),
        })
    } else {
        None
    };

    let extractor = ExtractorSettings {
        ytdlp_binary: vars
            .get("YT_DLP_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("yt-dlp")),
        user_agent: vars
            .get("SCRAPER_USER_AGENT")
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        accept_language: vars
            .get("SCRAPER_ACCEPT_LANGUAGE")
            .unwrap_or_else(|| DEFAULT_ACCEPT_LANGUAGE.to_string()),
        cookies_file: vars.get("YT_COOKIES_FILE").map(PathBuf::from),
        metadata_timeout: vars.secs("METADATA_TIMEOUT_SECS", 120),
        download_timeout: vars.secs("DOWNLOAD_TIMEOUT_SECS", 3600),
        submit_metadata_timeout: vars.secs("SUBMIT_METADATA_TIMEOUT_SECS", 10),
        page_api,
    };

    let pacing_defaults = PacingPolicy::default();
    let pacing = PacingPolicy {
        hard_cap_bps: vars
            .parsed("DOWNLOAD_RATELIMIT_BPS")
            .filter(|value: &u64| *value > 0),
        simulate_watch_time: vars.flag("SIMULATE_WATCH_TIME", pacing_defaults.simulate_watch_time),
        watch_speed: vars
            .parsed("WATCH_SPEED")
            .unwrap_or(pacing_defaults.watch_speed),
        min_rate_bps: vars
            .parsed("MIN_RATE_BPS")
            .unwrap_or(pacing_defaults.min_rate_bps),
        delay_min_secs: vars
            .parsed("HUMAN_DELAY_MIN_SEC")
            .unwrap_or(pacing_defaults.delay_min_secs),
        delay_max_secs: vars
            .parsed("HUMAN_DELAY_MAX_SEC")
            .unwrap_or(pacing_defaults.delay_max_secs),
        max_file_size_bytes: match vars.parsed::<f64>("MAX_FILE_SIZE_GB") {
            Some(gb) => {
                ensure!(
                    gb.is_finite() && gb > 0.0,
                    "MAX_FILE_SIZE_GB must be a positive number, got {gb}"
                );
                (gb * 1024.0 * 1024.0 * 1024.0) as u64
            }
            None => pacing_defaults.max_file_size_bytes,
        },
        ..pacing_defaults
    };
    check_pacing(&pacing)?;

    let admission_defaults = AdmissionPolicy::default();
    let admission = AdmissionPolicy {
        submit_limit: vars
            .parsed("RATE_LIMIT_SUBMIT")
            .unwrap_or(admission_defaults.submit_limit),
        validate_limit: vars
            .parsed("RATE_LIMIT_VALIDATE")
            .unwrap_or(admission_defaults.validate_limit),
        dashboard_limit: vars
            .parsed("RATE_LIMIT_DASHBOARD")
            .unwrap_or(admission_defaults.dashboard_limit),
        window_secs: vars
            .parsed("RATE_LIMIT_WINDOW_SECS")
            .unwrap_or(admission_defaults.window_secs),
        max_queue_size: vars
            .parsed("MAX_QUEUE_SIZE")
            .unwrap_or(admission_defaults.max_queue_size),
        capacity_retry_after_secs: vars
            .parsed("CAPACITY_RETRY_AFTER_SECS")
            .unwrap_or(admission_defaults.capacity_retry_after_secs),
    };

    let worker_defaults = WorkerSettings::default();
    let worker = WorkerSettings {
        concurrency: overrides
            .concurrency
            .or_else(|| vars.parsed("WORKER_CONCURRENCY"))
            .filter(|value| *value > 0)
            .unwrap_or(worker_defaults.concurrency),
        lease: vars.secs("TASK_LEASE_SECS", worker_defaults.lease.as_secs()),
        poll_interval: vars.secs("WORKER_POLL_SECS", worker_defaults.poll_interval.as_secs()),
        job_time_limit: vars.secs("JOB_TIME_LIMIT_SECS", worker_defaults.job_time_limit.as_secs()),
        max_attempts: vars
            .parsed("TASK_MAX_ATTEMPTS")
            .unwrap_or(worker_defaults.max_attempts),
        housekeeping_interval: vars.secs(
            "HOUSEKEEPING_INTERVAL_SECS",
            worker_defaults.housekeeping_interval.as_secs(),
        ),
        stale_job_age: Duration::from_secs(
            vars
                .parsed::<u64>("STALE_JOB_HOURS")
                .unwrap_or(24)
                .saturating_mul(3600),
        ),
        max_collection_items: vars
            .parsed("MAX_COLLECTION_ITEMS")
            .filter(|value: &u32| *value > 0),
    };

    Ok(Settings {
        host,
        port,
        data_root,
        download_path,
        storage,
        extractor,
        pacing,
        admission,
        worker,
    })
}

fn apply_policy_file(settings: &mut Settings, path: &Path) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading policy file {}", path.display()))?;
    let policy: PolicyFile =
        toml::from_str(&raw).with_context(|| format!("parsing policy file {}", path.display()))?;

    let pacing = &mut settings.pacing;
    let PacingOverrides {
        hard_cap_bps,
        simulate_watch_time,
        watch_speed,
        min_rate_bps,
        delay_min_secs,
        delay_max_secs,
        max_file_size_bytes,
        bitrate_1080_mbps,
        bitrate_720_mbps,
        bitrate_480_mbps,
        bitrate_low_mbps,
    } = policy.pacing;
    if let Some(value) = hard_cap_bps {
        pacing.hard_cap_bps = (value > 0).then_some(value);
    }
    set_if_some(&mut pacing.simulate_watch_time, simulate_watch_time);
    set_if_some(&mut pacing.watch_speed, watch_speed);
    set_if_some(&mut pacing.min_rate_bps, min_rate_bps);
    set_if_some(&mut pacing.delay_min_secs, delay_min_secs);
    set_if_some(&mut pacing.delay_max_secs, delay_max_secs);
    set_if_some(&mut pacing.max_file_size_bytes, max_file_size_bytes);
    set_if_some(&mut pacing.bitrate_1080_mbps, bitrate_1080_mbps);
    set_if_some(&mut pacing.bitrate_720_mbps, bitrate_720_mbps);
    set_if_some(&mut pacing.bitrate_480_mbps, bitrate_480_mbps);
    set_if_some(&mut pacing.bitrate_low_mbps, bitrate_low_mbps);
    check_pacing(pacing).with_context(|| format!("policy file {}", path.display()))?;

    let admission = &mut settings.admission;
    let AdmissionOverrides {
        submit_limit,
        validate_limit,
        dashboard_limit,
        window_secs,
        max_queue_size,
        capacity_retry_after_secs,
    } = policy.admission;
    set_if_some(&mut admission.submit_limit, submit_limit);
    set_if_some(&mut admission.validate_limit, validate_limit);
    set_if_some(&mut admission.dashboard_limit, dashboard_limit);
    set_if_some(&mut admission.window_secs, window_secs);
    set_if_some(&mut admission.max_queue_size, max_queue_size);
    set_if_some(
        &mut admission.capacity_retry_after_secs,
        capacity_retry_after_secs,
    );
    Ok(())
}

/// Rejects pacing numbers that would make delays or rates meaningless.
fn check_pacing(pacing: &PacingPolicy) -> Result<()> {
    for (name, value) in [
        ("HUMAN_DELAY_MIN_SEC", pacing.delay_min_secs),
        ("HUMAN_DELAY_MAX_SEC", pacing.delay_max_secs),
        ("bitrate_1080_mbps", pacing.bitrate_1080_mbps),
        ("bitrate_720_mbps", pacing.bitrate_720_mbps),
        ("bitrate_480_mbps", pacing.bitrate_480_mbps),
        ("bitrate_low_mbps", pacing.bitrate_low_mbps),
    ] {
        ensure!(
            value.is_finite() && value >= 0.0,
            "{name} must be a finite, non-negative number, got {value}"
        );
    }
    ensure!(
        pacing.watch_speed.is_finite() && pacing.watch_speed > 0.0,
        "WATCH_SPEED must be a positive number, got {}",
        pacing.watch_speed
    );
    Ok(())
}

/// Layered key lookup: process environment first, then the env file.
struct Lookup<'a, F> {
    file_vars: &'a HashMap<String, String>,
    env_lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        lookup_value(key, self.file_vars, &self.env_lookup)
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|value| parse_value(&value))
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .and_then(|value| parse_bool(&value))
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.parsed(key).unwrap_or(default))
    }
}

fn set_if_some<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parse_value<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Reads `KEY=value` pairs from an env file. A missing file yields no values.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
