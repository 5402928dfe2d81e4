use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use dashmap::DashSet;
use tokio::{fs::File, runtime::Handle, time::Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::validator::CanonicalUrl;

const JOB_DIR_PREFIX: &str = "job-";
const TEMP_EXTENSIONS: [&str; 3] = ["part", "ytdl", "temp"];
const MAX_TITLE_CHARS: usize = 50;
const FALLBACK_TITLE: &str = "video";

/// Names of the job directories that a running job or a handed-out video
/// still owns. The stale sweep never touches them.
pub(crate) type LiveJobs = Arc<DashSet<String>>;

/// Scratch directory exclusively owned by one download job.
///
/// Removed when dropped unless [`JobDir::remove`] already did it, so no exit
/// path can leak it.
#[derive(Debug)]
pub(crate) struct JobDir {
    path: PathBuf,
    name: String,
    live: LiveJobs,
    removed: bool,
}

impl JobDir {
    async fn create(scratch_dir: &Path, id: Uuid, live: &LiveJobs) -> io::Result<Self> {
        let name = format!("{JOB_DIR_PREFIX}{}", id.simple());
        let path = scratch_dir.join(&name);
        live.insert(name.clone());
        if let Err(error) = tokio::fs::create_dir(&path).await {
            live.remove(&name);
            return Err(error);
        }
        Ok(Self {
            path,
            name,
            live: Arc::clone(live),
            removed: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn remove(mut self) {
        self.removed = true;
        if let Err(error) = tokio::fs::remove_dir_all(&self.path).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("could not remove job directory {:?}: {error}", self.path);
        }
        self.live.remove(&self.name);
    }
}

impl Drop for JobDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }

        let path = std::mem::take(&mut self.path);
        let name = std::mem::take(&mut self.name);
        let live = Arc::clone(&self.live);
        let release = move || {
            remove_job_dir_blocking(&path);
            live.remove(&name);
        };

        // Drops often happen on a runtime thread, e.g. when a response body
        // finishes; the removal itself must not run there.
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}

pub(crate) fn remove_job_dir_blocking(path: &Path) {
    if let Err(error) = std::fs::remove_dir_all(path)
        && error.kind() != ErrorKind::NotFound
    {
        warn!("could not remove job directory {:?}: {error}", path);
    }
}

/// One orchestration attempt: the URL, its scratch space and its deadline.
#[derive(Debug)]
pub(crate) struct DownloadJob {
    pub(crate) id: Uuid,
    pub(crate) url: CanonicalUrl,
    pub(crate) dir: JobDir,
    pub(crate) started_at: Instant,
    pub(crate) deadline: Duration,
}

impl DownloadJob {
    pub(crate) async fn start(
        scratch_dir: &Path,
        url: &CanonicalUrl,
        deadline: Duration,
        live: &LiveJobs,
    ) -> io::Result<Self> {
        let id = Uuid::new_v4();
        let dir = JobDir::create(scratch_dir, id, live).await?;
        Ok(Self {
            id,
            url: url.clone(),
            dir,
            started_at: Instant::now(),
            deadline,
        })
    }

    /// `None` when the deadline lies beyond what the clock can represent.
    pub(crate) fn expires_at(&self) -> Option<Instant> {
        self.started_at.checked_add(self.deadline)
    }
}

/// A finished download, handed out inside a cleanup guard.
///
/// The file lives as long as this value: dropping it (or calling
/// [`DownloadedVideo::cleanup`]) deletes the file and its job directory.
#[derive(Debug)]
pub struct DownloadedVideo {
    dir: JobDir,
    path: PathBuf,
    size: u64,
    title: Option<String>,
    duration: Option<Duration>,
}

impl DownloadedVideo {
    pub(crate) fn new(
        dir: JobDir,
        path: PathBuf,
        size: u64,
        title: Option<String>,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            dir,
            path,
            size,
            title,
            duration,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn extension(&self) -> &str {
        self.path
            .extension()
            .and_then(|extension| extension.to_str())
            .unwrap_or("mp4")
    }

    /// Filename to present to the requester, built from the title.
    pub fn filename(&self) -> String {
        format!(
            "{}.{}",
            sanitize_title(self.title.as_deref().unwrap_or_default()),
            self.extension().to_ascii_lowercase()
        )
    }

    pub fn content_type(&self) -> &'static str {
        content_type_for_extension(self.extension())
    }

    pub async fn open(&self) -> io::Result<File> {
        File::open(&self.path).await
    }

    pub async fn cleanup(self) {
        self.dir.remove().await;
    }
}

/// Finds the finished file inside `job_dir`. `reported` is only trusted when
/// it resolves inside the directory; otherwise the directory is scanned.
/// Partial transfer artifacts are never returned.
pub(crate) async fn resolve_output(
    job_dir: &Path,
    reported: Option<&Path>,
) -> io::Result<Option<PathBuf>> {
    let canonical_job_dir = tokio::fs::canonicalize(job_dir).await?;

    if let Some(path) = reported {
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            job_dir.join(path)
        };
        if let Some(valid) = resolve_candidate(&canonical_job_dir, &candidate).await? {
            return Ok(Some(valid));
        }
    }

    let mut entries = tokio::fs::read_dir(job_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(valid) = resolve_candidate(&canonical_job_dir, &entry.path()).await? {
            return Ok(Some(valid));
        }
    }

    Ok(None)
}

async fn resolve_candidate(
    canonical_job_dir: &Path,
    candidate: &Path,
) -> io::Result<Option<PathBuf>> {
    if is_partial_artifact(candidate) {
        return Ok(None);
    }

    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error),
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await?;
    if !canonical.starts_with(canonical_job_dir) {
        warn!("ignoring engine output outside its job directory: {:?}", canonical);
        return Ok(None);
    }

    Ok(Some(canonical))
}

fn is_partial_artifact(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            TEMP_EXTENSIONS
                .iter()
                .any(|temp| extension.eq_ignore_ascii_case(temp))
        })
}

/// Removes job directories left behind by a crash or a killed process.
pub async fn sweep_stale_jobs(scratch_dir: &Path, older_than: Duration) {
    sweep_jobs(scratch_dir, older_than, None).await;
}

/// Like [`sweep_stale_jobs`], but skips directories listed in `live`.
pub(crate) async fn sweep_jobs(scratch_dir: &Path, older_than: Duration, live: Option<&LiveJobs>) {
    if older_than.is_zero() {
        return;
    }

    let mut entries = match tokio::fs::read_dir(scratch_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open scratch directory for sweeping: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0usize;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("could not iterate scratch directory: {error}");
                break;
            }
        };

        let file_name = entry.file_name();
        let Some(name) = file_name
            .to_str()
            .filter(|name| name.starts_with(JOB_DIR_PREFIX))
        else {
            continue;
        };
        if live.is_some_and(|live| live.contains(name)) {
            continue;
        }

        let path = entry.path();
        let modified_at = match entry.metadata().await.and_then(|metadata| metadata.modified()) {
            Ok(modified_at) => modified_at,
            Err(error) => {
                debug!("could not read age of {:?}: {error}", path);
                continue;
            }
        };

        let age = now.duration_since(modified_at).unwrap_or_default();
        if age < older_than {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("could not remove stale job {:?}: {error}", path),
        }
    }

    if removed > 0 {
        info!("removed {removed} stale job directories");
    }
}

pub fn sanitize_title(title: &str) -> String {
    let stripped = title
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') && !c.is_control())
        .map(|c| if c == '_' { ' ' } else { c })
        .collect::<String>();
    let compact = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    let shortened = if compact.chars().count() > MAX_TITLE_CHARS {
        let cut = compact.chars().take(MAX_TITLE_CHARS).collect::<String>();
        match cut.rsplit_once(' ') {
            Some((head, _)) if !head.is_empty() => head.to_string(),
            _ => cut,
        }
    } else {
        compact
    };

    if shortened.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        shortened
    }
}

pub fn content_type_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "3gp" => "video/3gpp",
        "flv" => "video/x-flv",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::validator::validate;

    #[test]
    fn sanitizes_titles_for_filenames() {
        assert_eq!(sanitize_title("My: \"Great\" video?"), "My Great video");
        assert_eq!(sanitize_title("a/b\\c|d*e"), "abcde");
        assert_eq!(sanitize_title("snake_case__title"), "snake case title");
        assert_eq!(sanitize_title("  \t\n "), "video");
        assert_eq!(sanitize_title(""), "video");
    }

    #[test]
    fn long_titles_are_cut_on_a_word_boundary() {
        let title = "word ".repeat(20);
        let sanitized = sanitize_title(&title);
        assert!(sanitized.chars().count() <= MAX_TITLE_CHARS);
        assert!(sanitized.ends_with("word"));

        let unbroken = "x".repeat(80);
        assert_eq!(sanitize_title(&unbroken).chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for_extension("MP4"), "video/mp4");
        assert_eq!(content_type_for_extension("webm"), "video/webm");
        assert_eq!(content_type_for_extension("bin"), "application/octet-stream");
    }

    async fn wait_for_removal(path: &Path, live: &LiveJobs) {
        for _ in 0..100 {
            if !path.exists() && live.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{path:?} was not released");
    }

    #[tokio::test]
    async fn job_directories_are_unique_and_removed_on_drop() {
        let scratch = TempDir::new().unwrap();
        let url = validate("https://youtu.be/abc").unwrap();
        let live = LiveJobs::default();

        let first = DownloadJob::start(scratch.path(), &url, Duration::from_secs(5), &live)
            .await
            .unwrap();
        let second = DownloadJob::start(scratch.path(), &url, Duration::from_secs(5), &live)
            .await
            .unwrap();
        assert_ne!(first.dir.path(), second.dir.path());
        assert!(first.dir.path().starts_with(scratch.path()));
        assert_eq!(live.len(), 2);

        let second_path = second.dir.path().to_path_buf();
        second.dir.remove().await;
        assert!(!second_path.exists());
        assert_eq!(live.len(), 1);

        let first_path = first.dir.path().to_path_buf();
        drop(first);
        wait_for_removal(&first_path, &live).await;
    }

    #[test]
    fn dropping_outside_a_runtime_removes_immediately() {
        let scratch = TempDir::new().unwrap();
        let live = LiveJobs::default();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = runtime
            .block_on(JobDir::create(scratch.path(), Uuid::new_v4(), &live))
            .unwrap();
        let path = dir.path().to_path_buf();

        drop(dir);
        assert!(!path.exists());
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn unrepresentable_deadline_means_no_expiry() {
        let scratch = TempDir::new().unwrap();
        let url = validate("https://youtu.be/abc").unwrap();
        let live = LiveJobs::default();

        let job = DownloadJob::start(scratch.path(), &url, Duration::MAX, &live)
            .await
            .unwrap();
        assert_eq!(job.expires_at(), None);

        let job = DownloadJob::start(scratch.path(), &url, Duration::from_secs(5), &live)
            .await
            .unwrap();
        assert_eq!(job.expires_at(), Some(job.started_at + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn sweep_skips_directories_of_live_jobs() {
        let scratch = TempDir::new().unwrap();
        let url = validate("https://youtu.be/abc").unwrap();
        let live = LiveJobs::default();

        let running = DownloadJob::start(scratch.path(), &url, Duration::from_secs(5), &live)
            .await
            .unwrap();
        let abandoned = scratch.path().join("job-abandoned");
        std::fs::create_dir(&abandoned).unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        sweep_jobs(scratch.path(), Duration::from_secs(1), Some(&live)).await;

        assert!(running.dir.path().exists());
        assert!(!abandoned.exists());
    }

    #[tokio::test]
    async fn resolves_reported_file_inside_job_dir() {
        let scratch = TempDir::new().unwrap();
        let job_dir = scratch.path().join("job-a");
        std::fs::create_dir(&job_dir).unwrap();
        std::fs::write(job_dir.join("video.mp4"), b"data").unwrap();

        let reported = job_dir.join("video.mp4");
        let resolved = resolve_output(&job_dir, Some(reported.as_path()))
            .await
            .unwrap()
            .unwrap();
        assert!(resolved.ends_with("video.mp4"));
    }

    #[tokio::test]
    async fn ignores_reported_paths_outside_job_dir() {
        let scratch = TempDir::new().unwrap();
        let job_dir = scratch.path().join("job-a");
        std::fs::create_dir(&job_dir).unwrap();
        let outside = scratch.path().join("secret.mp4");
        std::fs::write(&outside, b"secret").unwrap();

        assert_eq!(
            resolve_output(&job_dir, Some(outside.as_path())).await.unwrap(),
            None
        );

        std::fs::write(job_dir.join("video.webm"), b"data").unwrap();
        let resolved = resolve_output(&job_dir, Some(outside.as_path()))
            .await
            .unwrap()
            .unwrap();
        assert!(resolved.ends_with("video.webm"));
    }

    #[tokio::test]
    async fn partial_artifacts_are_never_returned() {
        let scratch = TempDir::new().unwrap();
        let job_dir = scratch.path().join("job-a");
        std::fs::create_dir(&job_dir).unwrap();
        std::fs::write(job_dir.join("video.mp4.part"), b"half").unwrap();
        std::fs::write(job_dir.join("video.mp4.ytdl"), b"state").unwrap();

        let reported = job_dir.join("video.mp4.part");
        assert_eq!(
            resolve_output(&job_dir, Some(reported.as_path())).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn sweeps_only_old_job_directories() {
        let scratch = TempDir::new().unwrap();
        let stale = scratch.path().join("job-stale");
        std::fs::create_dir(&stale).unwrap();
        let unrelated = scratch.path().join("keep-me");
        std::fs::create_dir(&unrelated).unwrap();

        sweep_stale_jobs(scratch.path(), Duration::from_secs(3600)).await;
        assert!(stale.exists());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        sweep_stale_jobs(scratch.path(), Duration::from_secs(1)).await;
        assert!(!stale.exists());
        assert!(unrelated.exists());

        sweep_stale_jobs(scratch.path(), Duration::ZERO).await;
        assert!(unrelated.exists());
    }
}
