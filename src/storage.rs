#![forbid(unsafe_code)]

//! Storage gateway: the object-store capability and a filesystem bucket that
//! the media endpoint serves from.

use std::{
    path::{Component, Path, PathBuf},
    time::Duration,
};

use chrono::{Datelike, NaiveDate, Utc};
use log::info;

use crate::{BoxFuture, config::StorageSettings, error::IngestError, extractor::MetadataRecord};

const SIGNING_CONTEXT: &str = "tubeharvest 2024 media url signing";
const MAX_TITLE_CHARS: usize = 50;

pub trait ObjectStore: Send + Sync {
    /// Stores `local` under `key` and returns the URL clients fetch it from.
    fn upload<'a>(
        &'a self,
        local: &'a Path,
        key: &'a str,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<String, IngestError>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), IngestError>>;

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, IngestError>>;

    /// Time-limited URL for `key`.
    fn presign(&self, key: &str, ttl: Duration) -> Result<String, IngestError>;
}

/// Objects laid out as plain files below `root`, addressed by their key.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    root: PathBuf,
    public_base_url: String,
    signing_key: Option<[u8; 32]>,
    public_read: bool,
}

impl LocalBucket {
    pub fn new(settings: &StorageSettings) -> Self {
        Self {
            root: settings.root.clone(),
            public_base_url: settings.public_base_url.trim_end_matches('/').to_string(),
            signing_key: settings
                .signing_secret
                .as_deref()
                .map(|secret| blake3::derive_key(SIGNING_CONTEXT, secret.as_bytes())),
            public_read: settings.public_read,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public_read(&self) -> bool {
        self.public_read
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key.trim_start_matches('/'))
    }

    /// Maps a key onto a path inside the bucket. Keys that would escape the
    /// root are rejected.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, IngestError> {
        let trimmed = key.trim();
        if trimmed.is_empty() || trimmed.contains('\\') {
            return Err(IngestError::StorageUpload(format!("invalid object key {key:?}")));
        }
        let relative = Path::new(trimmed);
        let mut path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                _ => {
                    return Err(IngestError::StorageUpload(format!(
                        "invalid object key {key:?}"
                    )));
                }
            }
        }
        Ok(path)
    }

    /// Checks a presigned `expires`/`signature` pair against `now` (unix secs).
    pub fn verify(&self, key: &str, expires: i64, signature: &str, now: i64) -> bool {
        let Some(signing_key) = &self.signing_key else {
            return false;
        };
        if expires < now {
            return false;
        }
        let Ok(provided) = blake3::Hash::from_hex(signature) else {
            return false;
        };
        // Hash equality is constant time.
        provided == sign(signing_key, key, expires)
    }

    fn presign_at(&self, key: &str, expires: i64) -> Result<String, IngestError> {
        let signing_key = self.signing_key.as_ref().ok_or_else(|| {
            IngestError::StorageUpload("presigning requires STORAGE_SIGNING_SECRET".into())
        })?;
        let signature = sign(signing_key, key, expires);
        Ok(format!(
            "{}?expires={expires}&signature={}",
            self.public_url(key),
            signature.to_hex()
        ))
    }

    async fn store(&self, local: &Path, key: &str) -> Result<String, IngestError> {
        let target = self.resolve(key)?;
        let upload_err = |err: std::io::Error| IngestError::StorageUpload(format!("{key}: {err}"));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(upload_err)?;
        }
        let mut partial = target.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let bytes = match tokio::fs::copy(local, &partial).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(upload_err(err));
            }
        };
        if let Err(err) = tokio::fs::rename(&partial, &target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(upload_err(err));
        }
        info!("stored key={key} bytes={bytes}");
        Ok(self.public_url(key))
    }

    async fn remove(&self, key: &str) -> Result<(), IngestError> {
        let target = self.resolve(key)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(IngestError::StorageUpload(format!("deleting {key}: {err}"))),
        }
    }

    async fn contains(&self, key: &str) -> Result<bool, IngestError> {
        let target = self.resolve(key)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|err| IngestError::StorageUpload(format!("{key}: {err}")))
    }
}

impl ObjectStore for LocalBucket {
    fn upload<'a>(
        &'a self,
        local: &'a Path,
        key: &'a str,
        _content_type: &'a str,
    ) -> BoxFuture<'a, Result<String, IngestError>> {
        Box::pin(self.store(local, key))
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), IngestError>> {
        Box::pin(self.remove(key))
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, IngestError>> {
        Box::pin(self.contains(key))
    }

    fn presign(&self, key: &str, ttl: Duration) -> Result<String, IngestError> {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);
        self.presign_at(key, Utc::now().timestamp().saturating_add(ttl))
    }
}

fn sign(signing_key: &[u8; 32], key: &str, expires: i64) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new_keyed(signing_key);
    hasher.update(key.as_bytes());
    hasher.update(b"\n");
    hasher.update(expires.to_string().as_bytes());
    hasher.finalize()
}

/// `videos/YYYY/MM/{id}_{title}.{ext}`, partitioned by upload date and
/// falling back to the current month when the date is unknown.
pub fn storage_key(record: &MetadataRecord, extension: &str) -> String {
    let date = record
        .upload_date
        .as_deref()
        .and_then(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok())
        .unwrap_or_else(|| Utc::now().date_naive());
    format!(
        "videos/{:04}/{:02}/{}_{}.{}",
        date.year(),
        date.month(),
        record.video_id,
        safe_title(&record.title),
        extension.trim_start_matches('.')
    )
}

fn safe_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, ' ' | '-' | '_'))
        .collect();
    let cleaned: String = kept
        .trim()
        .replace(' ', "_")
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    if cleaned.is_empty() {
        "video".to_string()
    } else {
        cleaned
    }
}

pub fn content_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory store for pipeline tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub objects: Mutex<HashMap<String, Vec<u8>>>,
        pub fail_keys_containing: Mutex<HashSet<String>>,
        /// Local files seen by `upload`, to check cleanup afterwards.
        pub uploaded_from: Mutex<Vec<PathBuf>>,
    }

    impl ObjectStore for MemoryStore {
        fn upload<'a>(
            &'a self,
            local: &'a Path,
            key: &'a str,
            _content_type: &'a str,
        ) -> BoxFuture<'a, Result<String, IngestError>> {
            Box::pin(async move {
                self.uploaded_from.lock().push(local.to_path_buf());
                if self
                    .fail_keys_containing
                    .lock()
                    .iter()
                    .any(|needle| key.contains(needle.as_str()))
                {
                    return Err(IngestError::StorageUpload("bucket unavailable".into()));
                }
                let bytes = tokio::fs::read(local)
                    .await
                    .map_err(|err| IngestError::StorageUpload(err.to_string()))?;
                self.objects.lock().insert(key.to_string(), bytes);
                Ok(format!("https://bucket.test/{key}"))
            })
        }

        fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), IngestError>> {
            Box::pin(async move {
                self.objects.lock().remove(key);
                Ok(())
            })
        }

        fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, IngestError>> {
            Box::pin(async move { Ok(self.objects.lock().contains_key(key)) })
        }

        fn presign(&self, key: &str, ttl: Duration) -> Result<String, IngestError> {
            Ok(format!("https://bucket.test/{key}?ttl={}", ttl.as_secs()))
        }
    }
}
