#![forbid(unsafe_code)]

//! Error taxonomy shared by the pipeline, the job runner and the HTTP layer.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    /// User input that does not point at a supported YouTube resource.
    #[error("invalid YouTube URL: {0}")]
    InvalidUrl(String),
    #[error("metadata extraction failed: {0}")]
    Extraction(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("upload to storage failed: {0}")]
    StorageUpload(String),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("capacity exceeded: {reason}")]
    CapacityExceeded { reason: String, retry_after: u64 },
}

impl IngestError {
    /// Machine-readable label used in API bodies and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) => "invalid_url",
            Self::Extraction(_) => "extraction_error",
            Self::Download(_) => "download_error",
            Self::StorageUpload(_) => "storage_upload_error",
            Self::Persistence(_) => "persistence_error",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
        }
    }

    /// Whether requeueing the owning job can reasonably succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidUrl(_) => false,
            Self::Extraction(_) | Self::Download(_) | Self::StorageUpload(_) => true,
            Self::Persistence(_) => true,
            Self::CapacityExceeded { .. } => false,
        }
    }

    /// Wraps an `anyhow` error coming out of the catalog, keeping the full
    /// context chain in the message.
    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }
}
