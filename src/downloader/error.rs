use std::time::Duration;

use thiserror::Error;

/// Terminal outcome of a failed [`fetch`](super::Downloader::fetch).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("video is private, removed or otherwise unavailable")]
    VideoUnavailable,

    #[error("file size {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("download timed out after {}s", .after.as_secs())]
    DownloadTimeout { after: Duration },

    /// `detail` is already sanitized and safe to show to a requester.
    #[error("download failed: {detail}")]
    DownloadError { detail: String },
}

impl FetchError {
    pub(crate) fn download(detail: impl Into<String>) -> Self {
        Self::DownloadError {
            detail: detail.into(),
        }
    }
}

/// Failure reported by an [`ExtractionEngine`](super::ExtractionEngine).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("resource unavailable: {0}")]
    Unavailable(String),

    #[error("extraction cancelled")]
    Cancelled,

    #[error("extraction engine is not installed")]
    NotInstalled,

    #[error("{0}")]
    Failed(String),
}
