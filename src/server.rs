//! HTTP boundary for the chat transport.
//!
//! The transport forwards each inbound link together with an opaque user id;
//! this layer runs it through the validator, the rate limiter and the
//! downloader, and maps every typed failure to a status code and message.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    downloader::{Downloader, FetchError, YtDlpEngine},
    rate_limiter::{RateLimitExceeded, RateLimiter},
    validator::{self, Platform, Rejection},
};

const VIDEO_TITLE_HEADER: &str = "x-video-title";
const VIDEO_DURATION_HEADER: &str = "x-video-duration";

#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub downloader: Arc<Downloader>,
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: String,
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PlatformInfo {
    name: Platform,
    domains: &'static [&'static str],
    url_shapes: &'static [&'static str],
}

#[derive(Debug, Serialize)]
struct RateLimitInfo {
    requests: usize,
    window_seconds: u64,
}

#[derive(Debug, Serialize)]
struct PlatformsResponse {
    platforms: Vec<PlatformInfo>,
    max_file_size_mb: u64,
    rate_limit: RateLimitInfo,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: &'static str,
    retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            retry_after_seconds: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::MalformedUrl => {
                Self::new(StatusCode::BAD_REQUEST, "MALFORMED_URL", "Invalid URL format.")
            }
            Rejection::DomainNotAllowed { .. } => Self::new(
                StatusCode::BAD_REQUEST,
                "DOMAIN_NOT_ALLOWED",
                "Unsupported platform. Use YouTube, Instagram or TikTok URLs.",
            ),
            Rejection::UnsupportedContent => Self::new(
                StatusCode::BAD_REQUEST,
                "UNSUPPORTED_CONTENT",
                "The link does not point to a single video.",
            ),
        }
    }
}

impl From<RateLimitExceeded> for ApiError {
    fn from(exceeded: RateLimitExceeded) -> Self {
        let seconds = exceeded.retry_after_secs();
        Self {
            retry_after_seconds: Some(seconds),
            ..Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMIT_EXCEEDED",
                format!("Too many requests. Please wait {seconds} seconds before trying again."),
            )
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::VideoUnavailable => Self::new(
                StatusCode::NOT_FOUND,
                "VIDEO_UNAVAILABLE",
                "Video is private or unavailable.",
            ),
            FetchError::FileTooLarge { size, limit } => Self::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "FILE_TOO_LARGE",
                format!(
                    "Video is too large ({}MB). Maximum allowed size is {}MB.",
                    size / 1_048_576,
                    limit / 1_048_576
                ),
            ),
            FetchError::DownloadTimeout { after } => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                "DOWNLOAD_TIMEOUT",
                format!("Download took longer than {} seconds.", after.as_secs()),
            ),
            FetchError::DownloadError { .. } => Self::new(
                StatusCode::BAD_GATEWAY,
                "DOWNLOAD_ERROR",
                "Failed to download video. Please check the URL and try again.",
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

/// Builds the yt-dlp backed downloader from `config` and serves the API
/// until the process receives Ctrl-C.
pub async fn run(config: Config) -> Result<(), ApiError> {
    let engine = Arc::new(YtDlpEngine::new(
        config.yt_dlp_path.clone(),
        config.cookies_file.clone(),
    ));
    let downloader = Downloader::new(config.download(), engine)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not prepare scratch directory {}: {error}",
                config.temp_dir.display()
            ))
        })?;

    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: the socket address identifies requests without a user id.");
    }
    if config.cookies_file.is_some() {
        info!("passing a cookies file to yt-dlp");
    }

    let downloader = Arc::new(downloader);
    let state = AppState {
        limiter: Arc::new(RateLimiter::new(config.limiter())),
        downloader: Arc::clone(&downloader),
        trust_proxy_headers: config.trust_proxy_headers,
    };

    let addr = &config.bind_addr;
    let listener = TcpListener::bind(addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {addr}: {error}"))
    })?;

    info!(
        "listening on http://{addr} (max {}MB, timeout {}s, {} workers)",
        config.max_file_size_mb,
        config.download_timeout.as_secs(),
        config.max_concurrent_downloads
    );

    let served = axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")));

    stop_downloader(downloader).await;
    served
}

/// Joins the download workers once nothing else holds the downloader.
/// Returns `false` if it is still shared and was left running.
async fn stop_downloader(downloader: Arc<Downloader>) -> bool {
    match Arc::try_unwrap(downloader) {
        Ok(downloader) => {
            if tokio::task::spawn_blocking(move || downloader.shutdown())
                .await
                .is_err()
            {
                warn!("download workers did not stop cleanly");
            }
            true
        }
        Err(_) => {
            warn!("downloader still in use at shutdown; leaving workers to finish");
            false
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/platforms", get(platforms))
        .route("/api/download", post(download))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn platforms(State(state): State<AppState>) -> Json<PlatformsResponse> {
    Json(PlatformsResponse {
        platforms: Platform::ALL
            .into_iter()
            .map(|platform| PlatformInfo {
                name: platform,
                domains: platform.domains(),
                url_shapes: platform.url_shapes(),
            })
            .collect(),
        max_file_size_mb: state.downloader.max_file_size() / 1_048_576,
        rate_limit: RateLimitInfo {
            requests: state.limiter.max_requests(),
            window_seconds: state.limiter.window().as_secs(),
        },
    })
}

async fn download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<DownloadRequest>,
) -> Result<Response, ApiError> {
    let url = validator::validate(&payload.url)?;

    let identity = requester_identity(&state, payload.user_id.as_deref(), &headers, addr);
    if let Err(exceeded) = state.limiter.admit(&identity) {
        info!(user = %identity, "rate limit exceeded, retry after {:?}", exceeded.retry_after);
        return Err(exceeded.into());
    }

    let video = match state.downloader.fetch(&url).await {
        Ok(video) => video,
        Err(error) => {
            match &error {
                FetchError::DownloadError { detail } => {
                    error!(user = %identity, url = %url, "download error: {detail}")
                }
                other => warn!(user = %identity, url = %url, "download failed: {other}"),
            }
            return Err(error.into());
        }
    };

    let filename = video.filename();
    let mut response_headers = HeaderMap::new();
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static(video.content_type()));
    response_headers.insert(CONTENT_LENGTH, HeaderValue::from(video.size()));
    response_headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build download headers."))?,
    );
    if let Some(title) = video.title()
        && let Ok(value) = HeaderValue::from_str(&sanitize_ascii(title))
    {
        response_headers.insert(HeaderName::from_static(VIDEO_TITLE_HEADER), value);
    }
    if let Some(duration) = video.duration() {
        response_headers.insert(
            HeaderName::from_static(VIDEO_DURATION_HEADER),
            HeaderValue::from(duration.as_secs()),
        );
    }

    let file = video.open().await.map_err(|error| {
        warn!("could not open downloaded file: {error}");
        ApiError::internal("Could not read the downloaded video.")
    })?;

    info!(
        user = %identity,
        platform = %url.platform(),
        size = video.size(),
        "video sent"
    );

    // The guard rides along with the body and deletes the file once the
    // transfer finishes or the client goes away.
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _guard = &video;
        chunk
    });

    Ok((response_headers, Body::from_stream(stream)).into_response())
}

fn requester_identity(
    state: &AppState,
    user_id: Option<&str>,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> String {
    if let Some(user_id) = user_id.map(str::trim).filter(|value| !value.is_empty()) {
        return format!("user:{user_id}");
    }

    let ip = if state.trust_proxy_headers {
        extract_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    };
    format!("ip:{ip}")
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for")
        && let Some(first_ip) = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    {
        return Some(first_ip.to_string());
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitize_ascii(filename),
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii(value: &str) -> String {
    let sanitized = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect::<String>();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "video".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::downloader::{EngineError, ExtractOutput, ExtractRequest, ExtractionEngine};

    struct NoopEngine;

    impl ExtractionEngine for NoopEngine {
        fn extract(
            &self,
            _request: &ExtractRequest,
            _cancel: &CancellationToken,
        ) -> Result<ExtractOutput, EngineError> {
            Err(EngineError::Cancelled)
        }
    }

    async fn noop_downloader(scratch: &std::path::Path) -> Arc<Downloader> {
        let config = Config {
            temp_dir: scratch.to_path_buf(),
            ..Config::default()
        };
        Arc::new(
            Downloader::new(config.download(), Arc::new(NoopEngine))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn stops_workers_only_when_downloader_is_unshared() {
        let scratch = tempfile::TempDir::new().unwrap();

        let downloader = noop_downloader(scratch.path()).await;
        assert!(stop_downloader(downloader).await);

        let downloader = noop_downloader(scratch.path()).await;
        let still_shared = Arc::clone(&downloader);
        assert!(!stop_downloader(downloader).await);
        drop(still_shared);
    }

    #[test]
    fn rate_limit_errors_carry_retry_after_header() {
        let response = ApiError::from(RateLimitExceeded {
            retry_after: Duration::from_millis(49_200),
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "50");
    }

    #[test]
    fn fetch_errors_map_to_distinct_statuses() {
        let cases = [
            (FetchError::VideoUnavailable, StatusCode::NOT_FOUND),
            (
                FetchError::FileTooLarge {
                    size: 60 * 1_048_576,
                    limit: 50 * 1_048_576,
                },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                FetchError::DownloadTimeout {
                    after: Duration::from_secs(300),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                FetchError::DownloadError {
                    detail: "HTTP Error 500".to_string(),
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn download_error_message_hides_engine_detail() {
        let error = ApiError::from(FetchError::DownloadError {
            detail: "something internal".to_string(),
        });
        assert!(!error.message.contains("internal"));
    }

    #[test]
    fn content_disposition_has_ascii_fallback() {
        assert_eq!(
            build_content_disposition("Café clip.mp4"),
            "attachment; filename=\"Caf_ clip.mp4\"; filename*=UTF-8''Caf%C3%A9%20clip.mp4"
        );
    }

    #[test]
    fn client_ip_prefers_first_forwarded_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("203.0.113.7"));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("10.0.0.2"));
    }
}
