use std::{
    io::{ErrorKind, Read},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::EngineError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SOCKET_TIMEOUT_SECONDS: u64 = 30;
const MAX_DIAGNOSTIC_CHARS: usize = 300;
const GENERIC_FAILURE: &str = "extraction engine could not complete the download";

/// Stem of the file every job writes into its own directory.
pub const OUTPUT_STEM: &str = "video";

const UNAVAILABLE_MARKERS: [&str; 11] = [
    "private",
    "unavailable",
    "not available",
    "has been removed",
    "does not exist",
    "no longer exists",
    "account has been terminated",
    "blocked it in your country",
    "available in your country",
    "geo restricted",
    "sign in to confirm your age",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRequest {
    pub url: String,
    /// Directory owned by this job; the engine must write nothing outside it.
    pub output_dir: PathBuf,
    /// Advisory ceiling used to pick a format before transferring.
    pub max_filesize: u64,
}

impl ExtractRequest {
    pub fn output_template(&self) -> PathBuf {
        self.output_dir.join(format!("{OUTPUT_STEM}.%(ext)s"))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractOutput {
    /// Path the engine reports it wrote. Treated as a hint only.
    pub file_path: Option<PathBuf>,
    pub title: Option<String>,
    pub duration: Option<Duration>,
}

/// Black-box media extraction: URL in, file on disk out.
///
/// Implementations block the calling thread for the whole transfer and are
/// only ever invoked from the download worker pool. They should poll
/// `cancel` and give up promptly once it fires.
pub trait ExtractionEngine: Send + Sync + 'static {
    fn extract(
        &self,
        request: &ExtractRequest,
        cancel: &CancellationToken,
    ) -> Result<ExtractOutput, EngineError>;
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    filepath: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
}

/// Runs the `yt-dlp` executable as a child process.
#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    program: PathBuf,
    cookies_file: Option<PathBuf>,
}

impl YtDlpEngine {
    pub fn new(program: impl Into<PathBuf>, cookies_file: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies_file,
        }
    }

    pub fn args(&self, request: &ExtractRequest) -> Vec<String> {
        let limit = request.max_filesize;
        let mut args = vec![
            "-f".to_string(),
            format!("best[ext=mp4][filesize<{limit}]/best[ext=mp4]/best[filesize<{limit}]/best"),
            "-o".to_string(),
            request.output_template().to_string_lossy().into_owned(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--restrict-filenames".to_string(),
            "--socket-timeout".to_string(),
            SOCKET_TIMEOUT_SECONDS.to_string(),
            "--print".to_string(),
            "after_move:%()j".to_string(),
        ];

        if let Some(cookies) = &self.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }

        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }

    fn spawn(&self, request: &ExtractRequest) -> Result<Child, EngineError> {
        let mut command = Command::new(&self.program);
        command
            .args(self.args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so cancellation also reaches helpers such as
        // ffmpeg that yt-dlp starts with inherited pipes.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command.spawn().map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                EngineError::NotInstalled
            } else {
                EngineError::Failed(format!("could not start yt-dlp: {error}"))
            }
        })
    }
}

impl ExtractionEngine for YtDlpEngine {
    fn extract(
        &self,
        request: &ExtractRequest,
        cancel: &CancellationToken,
    ) -> Result<ExtractOutput, EngineError> {
        let mut child = self.spawn(request)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if cancel.is_cancelled() {
                terminate(&mut child);
                debug!("yt-dlp process {} cancelled", child.id());
                // The readers end once the last pipe holder is gone; nobody
                // waits for them.
                return Err(EngineError::Cancelled);
            }

            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(error) => {
                    terminate(&mut child);
                    return Err(EngineError::Failed(format!("could not wait for yt-dlp: {error}")));
                }
            }
        };

        let pid = child.id();
        let (Some(stdout), Some(stderr)) = (
            collect(stdout, pid, cancel),
            collect(stderr, pid, cancel),
        ) else {
            debug!("yt-dlp process {pid} cancelled while its output was still open");
            return Err(EngineError::Cancelled);
        };

        if !status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&stderr)));
        }

        Ok(parse_printed_info(&stdout))
    }
}

/// Kills the child together with its process group and reaps it.
fn terminate(child: &mut Child) {
    if !kill_group(child.id())
        && let Err(error) = child.kill()
    {
        warn!("could not kill yt-dlp process {}: {error}", child.id());
    }
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    unsafe { libc::kill(-pgid, libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> bool {
    false
}

/// Waits for a pipe reader. A descendant that outlived the child can keep
/// the pipe open, so the wait gives up on cancellation and leaves the reader
/// detached.
fn collect(
    reader: thread::JoinHandle<Vec<u8>>,
    pid: u32,
    cancel: &CancellationToken,
) -> Option<Vec<u8>> {
    loop {
        if reader.is_finished() {
            return Some(reader.join().unwrap_or_default());
        }
        if cancel.is_cancelled() {
            kill_group(pid);
            return None;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        buffer
    })
}

fn last_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
}

fn parse_printed_info(stdout: &[u8]) -> ExtractOutput {
    let printed = String::from_utf8_lossy(stdout);
    let Some(line) = last_line(&printed) else {
        return ExtractOutput::default();
    };

    match serde_json::from_str::<YtDlpInfo>(line) {
        Ok(info) => ExtractOutput {
            file_path: info.filepath.map(PathBuf::from),
            title: info.title.filter(|title| !title.trim().is_empty()),
            duration: info
                .duration
                .filter(|seconds| seconds.is_finite() && (0.0..1e9).contains(seconds))
                .map(Duration::from_secs_f64),
        },
        Err(_) => ExtractOutput {
            file_path: Some(PathBuf::from(line)),
            ..ExtractOutput::default()
        },
    }
}

/// Maps yt-dlp's stderr to an engine error. Content that does not exist or
/// cannot be played is reported separately from every other failure.
pub fn classify_failure(stderr: &str) -> EngineError {
    let message = last_line(stderr).unwrap_or(GENERIC_FAILURE);
    let lower = stderr.to_ascii_lowercase();

    if UNAVAILABLE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        EngineError::Unavailable(message.to_string())
    } else if lower.contains("unsupported url") {
        EngineError::Failed("unsupported URL".to_string())
    } else {
        EngineError::Failed(message.to_string())
    }
}

/// Reduces an engine diagnostic to a single line that is safe to hand to a
/// requester: filesystem paths are replaced and the text is truncated.
pub fn sanitize_diagnostic(raw: &str, scratch_dir: &Path) -> String {
    let line = last_line(raw).unwrap_or(GENERIC_FAILURE);
    let line = line.strip_prefix("ERROR:").map(str::trim).unwrap_or(line);

    let scratch = scratch_dir.to_string_lossy();
    let line = if scratch.is_empty() {
        line.to_string()
    } else {
        line.replace(scratch.as_ref(), "<scratch>")
    };

    let cleaned = line
        .split_whitespace()
        .map(|word| if looks_like_path(word) { "<path>" } else { word })
        .collect::<Vec<_>>()
        .join(" ");

    if cleaned.chars().count() > MAX_DIAGNOSTIC_CHARS {
        let mut truncated = cleaned.chars().take(MAX_DIAGNOSTIC_CHARS).collect::<String>();
        truncated.push_str("...");
        truncated
    } else if cleaned.is_empty() {
        GENERIC_FAILURE.to_string()
    } else {
        cleaned
    }
}

fn looks_like_path(word: &str) -> bool {
    let word = word.trim_matches(|c: char| matches!(c, '\'' | '"' | '(' | ')' | ',' | ';' | ':'));
    if word.contains("://") {
        return false;
    }
    let bytes = word.as_bytes();
    let windows_drive =
        bytes.len() > 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'\\';
    (word.starts_with('/') && word.len() > 1) || word.starts_with("~/") || windows_drive
}
