#![forbid(unsafe_code)]

//! Pure classification of submitted YouTube links.
//!
//! Nothing in here performs I/O. A link either maps onto exactly one
//! [`UrlKind`] plus identifier, or it is rejected with
//! [`IngestError::InvalidUrl`]; ambiguous input is never guessed at.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::IngestError;

const ALLOWED_HOSTS: [&str; 4] = ["youtube.com", "www.youtube.com", "m.youtube.com", "youtu.be"];
const CANONICAL_ORIGIN: &str = "https://www.youtube.com";
const VIDEO_ID_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlKind {
    Video,
    Channel,
    Playlist,
    User,
}

impl UrlKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Channel => "channel",
            Self::Playlist => "playlist",
            Self::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "video" => Some(Self::Video),
            "channel" => Some(Self::Channel),
            "playlist" => Some(Self::Playlist),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    /// Collections fan out into many single-video runs.
    pub fn is_collection(self) -> bool {
        !matches!(self, Self::Video)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedUrl {
    pub kind: UrlKind,
    pub identifier: String,
    pub canonical_url: String,
}

/// Returns the kind and platform identifier for `raw_url`.
pub fn classify(raw_url: &str) -> Result<(UrlKind, String), IngestError> {
    let parsed = parse_platform_url(raw_url)?;
    match_kind(&parsed).ok_or_else(|| {
        IngestError::InvalidUrl(format!("unrecognized YouTube URL pattern: {}", raw_url.trim()))
    })
}

/// Re-derives the canonical form of `raw_url`.
pub fn normalize(raw_url: &str) -> Result<String, IngestError> {
    let (kind, identifier) = classify(raw_url)?;
    Ok(canonical_url(kind, &identifier))
}

/// Convenience wrapper bundling [`classify`] and [`normalize`].
pub fn inspect(raw_url: &str) -> Result<ClassifiedUrl, IngestError> {
    let (kind, identifier) = classify(raw_url)?;
    let canonical_url = canonical_url(kind, &identifier);
    Ok(ClassifiedUrl {
        kind,
        identifier,
        canonical_url,
    })
}

pub fn canonical_url(kind: UrlKind, identifier: &str) -> String {
    match kind {
        UrlKind::Video => format!("{CANONICAL_ORIGIN}/watch?v={identifier}"),
        UrlKind::Channel if is_channel_id(identifier) => {
            format!("{CANONICAL_ORIGIN}/channel/{identifier}")
        }
        UrlKind::Channel => format!("{CANONICAL_ORIGIN}/@{identifier}"),
        UrlKind::Playlist => format!("{CANONICAL_ORIGIN}/playlist?list={identifier}"),
        UrlKind::User => format!("{CANONICAL_ORIGIN}/user/{identifier}"),
    }
}

/// Extracts the 11 character video id from a link, if it is a video link.
pub fn video_id_from_url(raw_url: &str) -> Option<String> {
    match classify(raw_url) {
        Ok((UrlKind::Video, id)) => Some(id),
        _ => None,
    }
}

fn parse_platform_url(raw_url: &str) -> Result<Url, IngestError> {
    let trimmed = raw_url.trim();
    if trimmed.is_empty() {
        return Err(IngestError::InvalidUrl("URL is empty".into()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = Url::parse(&candidate)
        .map_err(|err| IngestError::InvalidUrl(format!("{trimmed}: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(IngestError::InvalidUrl(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    if !ALLOWED_HOSTS.contains(&host.as_str()) {
        return Err(IngestError::InvalidUrl(format!(
            "{host} is not a YouTube domain"
        )));
    }
    Ok(parsed)
}

fn match_kind(url: &Url) -> Option<(UrlKind, String)> {
    let host = url.host_str()?.to_ascii_lowercase();
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).collect())
        .unwrap_or_default();

    if host == "youtu.be" {
        let id = segments.first()?;
        return is_video_id(id).then(|| (UrlKind::Video, id.to_string()));
    }

    let query = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    };

    match segments.as_slice() {
        ["watch"] => {
            if let Some(id) = query("v") {
                return is_video_id(&id).then_some((UrlKind::Video, id));
            }
            let list = query("list")?;
            is_slug(&list).then_some((UrlKind::Playlist, list))
        }
        ["embed" | "v" | "shorts" | "live", id, ..] => {
            is_video_id(id).then(|| (UrlKind::Video, id.to_string()))
        }
        ["playlist"] => {
            let list = query("list")?;
            is_slug(&list).then_some((UrlKind::Playlist, list))
        }
        ["channel" | "c", id, ..] => is_slug(id).then(|| (UrlKind::Channel, id.to_string())),
        ["user", name, ..] => is_slug(name).then(|| (UrlKind::User, name.to_string())),
        [first, ..] if first.starts_with('@') => {
            let handle = &first[1..];
            is_handle(handle).then(|| (UrlKind::Channel, handle.to_string()))
        }
        _ => None,
    }
}

fn is_slug_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

fn is_video_id(value: &str) -> bool {
    value.len() == VIDEO_ID_LEN && value.chars().all(is_slug_char)
}

fn is_slug(value: &str) -> bool {
    !value.is_empty() && value.chars().all(is_slug_char)
}

fn is_handle(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| is_slug_char(ch) || ch == '.')
}

/// Internal channel ids look like `UC` followed by 22 url-safe characters.
fn is_channel_id(value: &str) -> bool {
    value.len() == 24 && value.starts_with("UC") && value.chars().all(is_slug_char)
}
