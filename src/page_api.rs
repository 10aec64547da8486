#![forbid(unsafe_code)]

//! Metadata-only backend that fetches the rendered watch page through a
//! scraping proxy and reads JSON-LD and meta tags out of it. Records coming
//! from here never carry download formats.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{debug, warn};
use regex::Regex;
use serde_json::Value;

use crate::{
    BoxFuture,
    classifier::{self, UrlKind},
    config::PageApiSettings,
    error::IngestError,
    extractor::{MetadataExtractor, MetadataRecord},
};

#[derive(Clone)]
pub struct PageApiExtractor {
    agent: ureq::Agent,
    settings: PageApiSettings,
    parser: PageParser,
}

impl PageApiExtractor {
    pub fn new(settings: PageApiSettings) -> Result<Self> {
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Ok(Self {
            agent,
            settings,
            parser: PageParser::new()?,
        })
    }

    async fn lookup(&self, url: &str) -> Result<MetadataRecord, IngestError> {
        let agent = self.agent.clone();
        let settings = self.settings.clone();
        let target = url.to_string();
        let html = tokio::task::spawn_blocking(move || fetch_page(&agent, &settings, &target))
            .await
            .map_err(|err| IngestError::Extraction(format!("page fetch task failed: {err}")))??;
        self.parser.parse(url, &html)
    }
}

impl MetadataExtractor for PageApiExtractor {
    fn backend(&self) -> &'static str {
        "page-api"
    }

    fn can_download(&self) -> bool {
        false
    }

    fn extract<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<MetadataRecord, IngestError>> {
        Box::pin(self.lookup(url))
    }
}

fn fetch_page(
    agent: &ureq::Agent,
    settings: &PageApiSettings,
    url: &str,
) -> Result<String, IngestError> {
    debug!("page-api fetching {url}");
    let response = agent
        .get(&settings.endpoint)
        .query("api_key", &settings.api_key)
        .query("url", url)
        .query("render", bool_param(settings.render))
        .query("premium", bool_param(settings.premium))
        .query("retry_failed", bool_param(settings.retry_failed))
        .call()
        .map_err(|err| match err {
            ureq::Error::Status(code, _) => {
                IngestError::Extraction(format!("page API answered HTTP {code} for {url}"))
            }
            other => IngestError::Extraction(format!("page API request failed: {other}")),
        })?;
    response
        .into_string()
        .map_err(|err| IngestError::Extraction(format!("reading page API body: {err}")))
}

fn bool_param(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[derive(Clone)]
struct PageParser {
    json_ld: Regex,
    meta_tag: Regex,
    attribute: Regex,
    title_tag: Regex,
    views: Regex,
    likes: Regex,
}

impl PageParser {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).with_context(|| format!("compiling pattern {pattern}"))
        };
        Ok(Self {
            json_ld: compile(
                r#"(?is)<script[^>]*type\s*=\s*["']application/ld\+json["'][^>]*>(.*?)</script>"#,
            )?,
            meta_tag: compile(r"(?is)<meta\s[^>]*>")?,
            attribute: compile(r#"(?is)([a-z:_-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)?,
            title_tag: compile(r"(?is)<title[^>]*>(.*?)</title>")?,
            views: compile(r"(?i)([\d,]+)\s+views?\b")?,
            likes: compile(r"(?i)([\d,]+)\s+likes?\b")?,
        })
    }

    fn parse(&self, url: &str, html: &str) -> Result<MetadataRecord, IngestError> {
        let video_id = classifier::video_id_from_url(url)
            .ok_or_else(|| IngestError::Extraction(format!("no video id in {url}")))?;
        let ld = self.video_object(html);
        let meta = self.meta_values(html);
        let meta_get = |key: &str| meta.get(key).map(String::as_str);

        let title = ld_str(&ld, "name")
            .or_else(|| meta_get("og:title").map(str::to_string))
            .or_else(|| self.title_from_tag(html))
            .ok_or_else(|| {
                IngestError::Extraction(format!(
                    "page for {video_id} carried no video metadata (blocked or consent page)"
                ))
            })?;

        let description = ld_str(&ld, "description")
            .or_else(|| meta_get("og:description").map(str::to_string))
            .or_else(|| meta_get("description").map(str::to_string));
        let duration_sec = ld_str(&ld, "duration")
            .or_else(|| meta_get("duration").map(str::to_string))
            .and_then(|value| parse_iso_duration(&value));
        let view_count = ld_view_count(&ld)
            .or_else(|| meta_get("interactionCount").and_then(parse_count))
            .or_else(|| first_count(&self.views, html));
        let like_count = first_count(&self.likes, html);
        let upload_date = ld_str(&ld, "uploadDate")
            .or_else(|| ld_str(&ld, "datePublished"))
            .or_else(|| meta_get("datePublished").map(str::to_string))
            .or_else(|| meta_get("article:published_time").map(str::to_string))
            .and_then(|value| normalize_date(&value));
        let uploader = ld_author(&ld).or_else(|| meta_get("channelName").map(str::to_string));
        let thumbnail_url = ld_thumbnail(&ld).or_else(|| meta_get("og:image").map(str::to_string));
        let tags = meta_get("keywords")
            .map(|keywords| {
                keywords
                    .split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let categories = ld_str(&ld, "genre")
            .or_else(|| meta_get("genre").map(str::to_string))
            .into_iter()
            .collect();

        Ok(MetadataRecord {
            webpage_url: Some(classifier::canonical_url(UrlKind::Video, &video_id)),
            video_id,
            title,
            description,
            duration_sec,
            view_count,
            like_count,
            upload_date,
            uploader,
            uploader_id: None,
            thumbnail_url,
            tags,
            categories,
            formats: Vec::new(),
            filesize: None,
            downloadable: false,
        })
    }

    /// The `VideoObject` JSON-LD block, or the first object block found.
    fn video_object(&self, html: &str) -> Option<Value> {
        let mut fallback = None;
        for capture in self.json_ld.captures_iter(html) {
            let body = capture.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let parsed: Value = match serde_json::from_str(body) {
                Ok(value) => value,
                Err(err) => {
                    warn!("skipping malformed JSON-LD block: {err}");
                    continue;
                }
            };
            let candidates = match parsed {
                Value::Array(items) => items,
                other => vec![other],
            };
            for candidate in candidates.into_iter().filter(Value::is_object) {
                if candidate.get("@type").and_then(Value::as_str) == Some("VideoObject") {
                    return Some(candidate);
                }
                fallback.get_or_insert(candidate);
            }
        }
        fallback
    }

    /// `property`, `name` or `itemprop` → `content`; the first occurrence wins.
    fn meta_values(&self, html: &str) -> HashMap<String, String> {
        let mut values = HashMap::new();
        for tag in self.meta_tag.find_iter(html) {
            let mut key = None;
            let mut content = None;
            for attr in self.attribute.captures_iter(tag.as_str()) {
                let name = attr.get(1).map(|m| m.as_str().to_ascii_lowercase());
                let value = attr.get(2).or_else(|| attr.get(3)).map(|m| m.as_str());
                match (name.as_deref(), value) {
                    (Some("property" | "name" | "itemprop"), Some(value)) if key.is_none() => {
                        key = Some(value.to_string());
                    }
                    (Some("content"), Some(value)) => content = Some(decode_entities(value)),
                    _ => {}
                }
            }
            if let (Some(key), Some(content)) = (key, content) {
                if !content.trim().is_empty() {
                    values.entry(key).or_insert(content);
                }
            }
        }
        values
    }

    fn title_from_tag(&self, html: &str) -> Option<String> {
        let raw = self.title_tag.captures(html)?.get(1)?.as_str();
        let title = decode_entities(raw.trim());
        let title = title.strip_suffix(" - YouTube").unwrap_or(&title).trim();
        (!title.is_empty() && title != "YouTube").then(|| title.to_string())
    }
}

fn ld_str(ld: &Option<Value>, key: &str) -> Option<String> {
    ld.as_ref()?
        .get(key)?
        .as_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn ld_author(ld: &Option<Value>) -> Option<String> {
    match ld.as_ref()?.get("author")? {
        Value::String(name) => Some(name.clone()),
        Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
        Value::Array(items) => items
            .iter()
            .find_map(|item| item.get("name").and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

fn ld_thumbnail(ld: &Option<Value>) -> Option<String> {
    match ld.as_ref()?.get("thumbnailUrl")? {
        Value::String(url) => Some(url.clone()),
        Value::Array(items) => items.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn ld_view_count(ld: &Option<Value>) -> Option<i64> {
    let ld = ld.as_ref()?;
    if let Some(count) = ld.get("interactionCount").and_then(value_count) {
        return Some(count);
    }
    let stats = match ld.get("interactionStatistic")? {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    stats.iter().find_map(|stat| {
        let kind = stat
            .get("interactionType")
            .and_then(|kind| kind.get("@type").or(Some(kind)))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if kind.contains("WatchAction") {
            stat.get("userInteractionCount").and_then(value_count)
        } else {
            None
        }
    })
}

fn value_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => parse_count(text),
        _ => None,
    }
}

fn parse_count(text: &str) -> Option<i64> {
    text.trim().replace(',', "").parse().ok()
}

fn first_count(pattern: &Regex, html: &str) -> Option<i64> {
    pattern
        .captures_iter(html)
        .find_map(|capture| capture.get(1).and_then(|m| parse_count(m.as_str())))
}

/// `PT#H#M#S` into seconds. Days and fractional parts are not used by the
/// platform and are rejected.
fn parse_iso_duration(value: &str) -> Option<i64> {
    let rest = value.trim().strip_prefix("PT")?;
    if rest.is_empty() {
        return None;
    }
    let mut total = 0i64;
    let mut digits = String::new();
    for ch in rest.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let amount: i64 = digits.parse().ok()?;
        digits.clear();
        total += match ch {
            'H' => amount * 3600,
            'M' => amount * 60,
            'S' => amount,
            _ => return None,
        };
    }
    digits.is_empty().then_some(total)
}

/// Leading `YYYY-MM-DD` of an ISO date or timestamp.
fn normalize_date(value: &str) -> Option<String> {
    let prefix = value.trim().get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
