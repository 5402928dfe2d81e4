//! Download orchestration around a blocking extraction engine.
//!
//! [`Downloader::fetch`] gives every job its own scratch directory, runs the
//! engine on the worker pool under a deadline, verifies the produced file
//! against the size ceiling and hands it back inside a [`DownloadedVideo`]
//! guard. Every failure path removes the job directory before returning.

mod engine;
mod error;
mod job;
mod worker_pool;

use std::{io, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use engine::{
    ExtractOutput, ExtractRequest, ExtractionEngine, OUTPUT_STEM, YtDlpEngine, classify_failure,
    sanitize_diagnostic,
};
pub use error::{EngineError, FetchError};
pub use job::{DownloadedVideo, content_type_for_extension, sanitize_title, sweep_stale_jobs};
pub use worker_pool::{PoolClosed, WorkerPool};

use crate::{config::DownloadConfig, validator::CanonicalUrl};
use job::{DownloadJob, JobDir, LiveJobs, remove_job_dir_blocking, resolve_output, sweep_jobs};

/// Leftovers younger than the timeout plus this margin are never swept.
const SWEEP_MARGIN: Duration = Duration::from_secs(60);

pub struct Downloader {
    config: DownloadConfig,
    engine: Arc<dyn ExtractionEngine>,
    pool: WorkerPool,
    live: LiveJobs,
}

impl Downloader {
    /// Prepares the scratch directory, clears leftovers from earlier runs and
    /// starts the worker pool.
    pub async fn new(config: DownloadConfig, engine: Arc<dyn ExtractionEngine>) -> io::Result<Self> {
        tokio::fs::create_dir_all(&config.temp_dir).await?;
        let pool = WorkerPool::new(config.workers, config.queue_capacity)?;

        let downloader = Self {
            config,
            engine,
            pool,
            live: LiveJobs::default(),
        };
        downloader.sweep().await;
        Ok(downloader)
    }

    pub fn max_file_size(&self) -> u64 {
        self.config.max_file_size
    }

    /// Downloads `url` under the configured timeout.
    pub async fn fetch(&self, url: &CanonicalUrl) -> Result<DownloadedVideo, FetchError> {
        self.fetch_within(url, self.config.timeout).await
    }

    /// Downloads `url`, giving up once `deadline` has elapsed. The deadline
    /// covers time spent waiting for a free worker; one too far out to
    /// represent means no deadline at all.
    ///
    /// Dropping the returned future cancels the extraction and removes the
    /// job directory.
    pub async fn fetch_within(
        &self,
        url: &CanonicalUrl,
        deadline: Duration,
    ) -> Result<DownloadedVideo, FetchError> {
        self.sweep().await;

        let job = DownloadJob::start(&self.config.temp_dir, url, deadline, &self.live)
            .await
            .map_err(|error| {
                warn!("could not create job directory: {error}");
                FetchError::download("could not prepare scratch space")
            })?;

        debug!(job = %job.id, url = %job.url, "download job started");

        let cancel = CancellationToken::new();
        let cancel_on_drop = cancel.clone().drop_guard();
        let request = ExtractRequest {
            url: job.url.as_str().to_string(),
            output_dir: job.dir.path().to_path_buf(),
            max_filesize: self.config.max_file_size,
        };

        let extraction = self.extract(request, cancel.clone());
        let outcome = match job.expires_at() {
            Some(expires_at) => tokio::time::timeout_at(expires_at, extraction).await,
            None => Ok(extraction.await),
        };

        let result = match outcome {
            Err(_) => {
                cancel.cancel();
                warn!(job = %job.id, url = %job.url, "download timed out after {:?}", job.deadline);
                job.dir.remove().await;
                Err(FetchError::DownloadTimeout { after: job.deadline })
            }
            Ok(Err(error)) => {
                job.dir.remove().await;
                Err(error)
            }
            Ok(Ok(output)) => self.finish(job.dir, output).await,
        };

        match &result {
            Ok(video) => info!(
                job = %job.id,
                platform = %job.url.platform(),
                size = video.size(),
                "download finished in {:?}",
                job.started_at.elapsed()
            ),
            Err(error) => debug!(job = %job.id, "download failed: {error}"),
        }

        let _ = cancel_on_drop.disarm();
        result
    }

    /// Stops the worker pool once queued jobs have drained. Blocks.
    pub fn shutdown(self) {
        self.pool.shutdown();
    }

    async fn extract(
        &self,
        request: ExtractRequest,
        cancel: CancellationToken,
    ) -> Result<ExtractOutput, FetchError> {
        let engine = Arc::clone(&self.engine);

        let receiver = self
            .pool
            .submit(move || {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                let result = engine.extract(&request, &cancel);
                // The caller has given up on this job and may already have
                // removed the directory; anything the engine wrote since then
                // is ours to delete.
                if cancel.is_cancelled() {
                    remove_job_dir_blocking(&request.output_dir);
                }
                result
            })
            .await
            .map_err(|_| FetchError::download("download service is shutting down"))?;

        let result = receiver.await.map_err(|_| {
            warn!("extraction job ended without a result");
            FetchError::download("extraction failed unexpectedly")
        })?;

        result.map_err(|error| self.map_engine_error(error))
    }

    async fn finish(&self, dir: JobDir, output: ExtractOutput) -> Result<DownloadedVideo, FetchError> {
        let path = match resolve_output(dir.path(), output.file_path.as_deref()).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                dir.remove().await;
                return Err(FetchError::download("extraction produced no file"));
            }
            Err(error) => {
                warn!("could not inspect job output: {error}");
                dir.remove().await;
                return Err(FetchError::download("could not read downloaded file"));
            }
        };

        let size = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(error) => {
                warn!("could not stat downloaded file: {error}");
                dir.remove().await;
                return Err(FetchError::download("could not read downloaded file"));
            }
        };

        if size > self.config.max_file_size {
            dir.remove().await;
            return Err(FetchError::FileTooLarge {
                size,
                limit: self.config.max_file_size,
            });
        }
        if size == 0 {
            dir.remove().await;
            return Err(FetchError::download("extraction produced an empty file"));
        }

        Ok(DownloadedVideo::new(dir, path, size, output.title, output.duration))
    }

    fn map_engine_error(&self, error: EngineError) -> FetchError {
        match error {
            EngineError::Unavailable(detail) => {
                debug!("engine reported unavailable content: {detail}");
                FetchError::VideoUnavailable
            }
            EngineError::Cancelled => FetchError::download("download was cancelled"),
            EngineError::NotInstalled => {
                warn!("extraction engine is not installed");
                FetchError::download("download service is not available")
            }
            EngineError::Failed(detail) => {
                warn!("extraction failed: {detail}");
                FetchError::download(sanitize_diagnostic(&detail, &self.config.temp_dir))
            }
        }
    }

    /// Removes leftovers of jobs that no longer run. Directories of live
    /// jobs are skipped whatever their age.
    async fn sweep(&self) {
        if self.config.stale_job_age.is_zero() {
            return;
        }
        let min_age = self.config.timeout.saturating_add(SWEEP_MARGIN);
        self.sweep_older_than(self.config.stale_job_age.max(min_age))
            .await;
    }

    async fn sweep_older_than(&self, age: Duration) {
        sweep_jobs(&self.config.temp_dir, age, Some(&self.live)).await;
    }
}
