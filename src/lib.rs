//! Video link downloader core: URL validation, per-user rate limiting and a
//! bounded download orchestrator around `yt-dlp`, exposed over a small HTTP API.

pub mod config;
pub mod downloader;
pub mod rate_limiter;
pub mod server;
pub mod validator;

pub use config::{Config, ConfigError};
pub use downloader::{DownloadedVideo, Downloader, FetchError};
pub use rate_limiter::{RateLimitExceeded, RateLimiter};
pub use validator::{CanonicalUrl, Platform, Rejection, validate};
