use std::{path::PathBuf, time::Duration};

use thiserror::Error;

const DEFAULT_MAX_FILE_SIZE_MB: u64 = 50;
const MAX_FILE_SIZE_LIMIT_MB: u64 = 50;
const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 300;
const MAX_DOWNLOAD_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_RATE_LIMIT_REQUESTS: usize = 5;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 60;
const MAX_RATE_LIMIT_WINDOW_SECONDS: u64 = 24 * 60 * 60;
const DEFAULT_TEMP_DIR: &str = "/tmp/yt-downloader-bot";
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_DOWNLOAD_QUEUE_CAPACITY: usize = 32;
const DEFAULT_YT_DLP_PATH: &str = "yt-dlp";
const DEFAULT_STALE_JOB_SECONDS: u64 = 2 * 60 * 60;
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a whole number, got {value:?}")]
    NotANumber { name: &'static str, value: String },

    #[error("{name} must be a boolean (true/false), got {value:?}")]
    NotABool { name: &'static str, value: String },

    #[error("{name} must be positive")]
    NotPositive { name: &'static str },

    #[error("{name} cannot exceed {max}")]
    TooLarge { name: &'static str, max: u64 },
}

/// Runtime configuration, loaded once at startup and handed to each component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub max_file_size_mb: u64,
    pub download_timeout: Duration,
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
    pub temp_dir: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub max_concurrent_downloads: usize,
    pub download_queue_capacity: usize,
    pub yt_dlp_path: PathBuf,
    pub stale_job_age: Duration,
    pub trust_proxy_headers: bool,
    pub bind_addr: String,
}

/// The slice of [`Config`] the rate limiter needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    pub max_requests: usize,
    pub window: Duration,
}

/// The slice of [`Config`] the download orchestrator needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    pub temp_dir: PathBuf,
    pub max_file_size: u64,
    pub timeout: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub stale_job_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size_mb: DEFAULT_MAX_FILE_SIZE_MB,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECONDS),
            rate_limit_requests: DEFAULT_RATE_LIMIT_REQUESTS,
            rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECONDS),
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            cookies_file: None,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            download_queue_capacity: DEFAULT_DOWNLOAD_QUEUE_CAPACITY,
            yt_dlp_path: PathBuf::from(DEFAULT_YT_DLP_PATH),
            stale_job_age: Duration::from_secs(DEFAULT_STALE_JOB_SECONDS),
            trust_proxy_headers: false,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source. Unset and blank
    /// variables fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string));
        let defaults = Self::default();

        let max_file_size_mb = read_u64(&read, "MAX_FILE_SIZE_MB")?
            .unwrap_or(defaults.max_file_size_mb);
        ensure_range("MAX_FILE_SIZE_MB", max_file_size_mb, MAX_FILE_SIZE_LIMIT_MB)?;

        let download_timeout = read_u64(&read, "DOWNLOAD_TIMEOUT")?
            .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECONDS);
        ensure_range("DOWNLOAD_TIMEOUT", download_timeout, MAX_DOWNLOAD_TIMEOUT_SECONDS)?;

        let rate_limit_requests = read_u64(&read, "RATE_LIMIT_REQUESTS")?
            .map(|value| value as usize)
            .unwrap_or(defaults.rate_limit_requests);
        ensure_positive("RATE_LIMIT_REQUESTS", rate_limit_requests as u64)?;

        let rate_limit_window = read_u64(&read, "RATE_LIMIT_WINDOW")?
            .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECONDS);
        ensure_range("RATE_LIMIT_WINDOW", rate_limit_window, MAX_RATE_LIMIT_WINDOW_SECONDS)?;

        let max_concurrent_downloads = read_u64(&read, "MAX_CONCURRENT_DOWNLOADS")?
            .map(|value| value as usize)
            .unwrap_or(defaults.max_concurrent_downloads);
        ensure_positive("MAX_CONCURRENT_DOWNLOADS", max_concurrent_downloads as u64)?;

        let download_queue_capacity = read_u64(&read, "DOWNLOAD_QUEUE_CAPACITY")?
            .map(|value| value as usize)
            .unwrap_or(defaults.download_queue_capacity);
        ensure_positive("DOWNLOAD_QUEUE_CAPACITY", download_queue_capacity as u64)?;

        let stale_job_age = read_u64(&read, "STALE_JOB_SECONDS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.stale_job_age);

        let trust_proxy_headers = match read("TRUST_PROXY_HEADERS") {
            Some(value) => parse_bool(&value).ok_or(ConfigError::NotABool {
                name: "TRUST_PROXY_HEADERS",
                value,
            })?,
            None => defaults.trust_proxy_headers,
        };

        let bind_addr = resolve_bind_addr(&read)?.unwrap_or(defaults.bind_addr);

        Ok(Self {
            max_file_size_mb,
            download_timeout: Duration::from_secs(download_timeout),
            rate_limit_requests,
            rate_limit_window: Duration::from_secs(rate_limit_window),
            temp_dir: read("TEMP_DIR").map(PathBuf::from).unwrap_or(defaults.temp_dir),
            cookies_file: read("COOKIES_FILE").map(PathBuf::from),
            max_concurrent_downloads,
            download_queue_capacity,
            yt_dlp_path: read("YT_DLP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.yt_dlp_path),
            stale_job_age,
            trust_proxy_headers,
            bind_addr,
        })
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn limiter(&self) -> LimiterConfig {
        LimiterConfig {
            max_requests: self.rate_limit_requests,
            window: self.rate_limit_window,
        }
    }

    pub fn download(&self) -> DownloadConfig {
        DownloadConfig {
            temp_dir: self.temp_dir.clone(),
            max_file_size: self.max_file_size_bytes(),
            timeout: self.download_timeout,
            workers: self.max_concurrent_downloads,
            queue_capacity: self.download_queue_capacity,
            stale_job_age: self.stale_job_age,
        }
    }
}

fn read_u64<R>(read: &R, name: &'static str) -> Result<Option<u64>, ConfigError>
where
    R: Fn(&str) -> Option<String>,
{
    read(name)
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| ConfigError::NotANumber { name, value })
        })
        .transpose()
}

fn ensure_positive(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive { name });
    }
    Ok(())
}

fn ensure_range(name: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    ensure_positive(name, value)?;
    if value > max {
        return Err(ConfigError::TooLarge { name, max });
    }
    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn resolve_bind_addr<R>(read: &R) -> Result<Option<String>, ConfigError>
where
    R: Fn(&str) -> Option<String>,
{
    if let Some(configured) = read("APP_ADDR") {
        return Ok(Some(configured));
    }

    match read("PORT") {
        Some(value) => {
            let port = value
                .parse::<u16>()
                .map_err(|_| ConfigError::NotANumber { name: "PORT", value })?;
            Ok(Some(format!("0.0.0.0:{port}")))
        }
        None => Ok(None),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
