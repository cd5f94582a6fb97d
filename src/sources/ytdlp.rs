use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::{process::Stdio, sync::LazyLock, time::Duration};
use tracing::{debug, info, warn};

use super::{SourceKind, SourceResolver, StreamHandle};
use crate::error::ResolutionError;

static NOT_FOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(video unavailable|private video|no video results|not found|http error 404|has been removed)")
        .expect("static regex")
});
static UNSUPPORTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(unsupported url|no suitable (formats|extractor))").expect("static regex"));
static RATE_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(http error 429|too many requests|rate.?limit)").expect("static regex"));

/// Resolver backed by the `yt-dlp` executable.
///
/// Handles page URLs of every site yt-dlp knows and plain text, which is
/// treated as a YouTube search taking the first hit.
pub struct YtDlpResolver {
    program: String,
    timeout: Duration,
}

/// Subset of `yt-dlp -J` output we care about.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    is_live: Option<bool>,
    #[serde(default)]
    entries: Option<Vec<VideoInfo>>,
}

impl YtDlpResolver {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn args(reference: &str) -> Vec<String> {
        [
            "-J",
            "--no-playlist",
            "--no-warnings",
            "--quiet",
            "--default-search",
            "ytsearch",
            "-f",
            "bestaudio/best",
            "--extractor-args",
            "youtube:player_client=android,web",
            "--socket-timeout",
            "15",
        ]
        .into_iter()
        .map(str::to_string)
        .chain(["--".to_string(), reference.to_string()])
        .collect()
    }

    /// Parses the JSON dump, taking the first entry of search results.
    fn parse_output(reference: &str, stdout: &[u8]) -> Result<StreamHandle, ResolutionError> {
        let mut info: VideoInfo = serde_json::from_slice(stdout)
            .map_err(|e| ResolutionError::NetworkFailure(format!("invalid yt-dlp output: {}", e)))?;

        if let Some(entries) = info.entries.take() {
            info = entries
                .into_iter()
                .next()
                .ok_or_else(|| ResolutionError::NotFound(reference.to_string()))?;
        }

        let url = info
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ResolutionError::Unsupported(format!("no audio stream for {}", reference)))?;

        let is_live = info.is_live.unwrap_or(false);
        let mut handle = StreamHandle::new(
            url,
            info.title.unwrap_or_else(|| "Unknown title".to_string()),
            SourceKind::YtDlp,
        )
        .with_live(is_live)
        .with_seekable(!is_live);

        if let Some(uploader) = info.uploader {
            handle = handle.with_uploader(uploader);
        }
        if let Some(duration) = info
            .duration
            .filter(|d| *d > 0.0)
            .and_then(|d| Duration::try_from_secs_f64(d).ok())
        {
            handle = handle.with_duration(duration);
        }
        if let Some(thumbnail) = info.thumbnail {
            handle = handle.with_thumbnail(thumbnail);
        }

        Ok(handle)
    }

    /// Maps yt-dlp's stderr onto the resolution taxonomy.
    fn classify_stderr(reference: &str, stderr: &str) -> ResolutionError {
        if RATE_LIMIT_RE.is_match(stderr) {
            ResolutionError::RateLimited { retry_after: None }
        } else if UNSUPPORTED_RE.is_match(stderr) {
            ResolutionError::Unsupported(reference.to_string())
        } else if NOT_FOUND_RE.is_match(stderr) {
            ResolutionError::NotFound(reference.to_string())
        } else {
            let line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("yt-dlp failed");
            ResolutionError::NetworkFailure(line.trim().to_string())
        }
    }
}

#[async_trait]
impl SourceResolver for YtDlpResolver {
    async fn resolve(&self, reference: &str) -> Result<StreamHandle, ResolutionError> {
        info!("🔍 Resolviendo con yt-dlp: {}", reference);

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(Self::args(reference))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("❌ No se pudo ejecutar {}: {}", self.program, e);
                return Err(ResolutionError::NetworkFailure(format!("{}: {}", self.program, e)));
            }
            Err(_) => {
                warn!("⏰ yt-dlp timeout para: {}", reference);
                return Err(ResolutionError::NetworkFailure(format!(
                    "yt-dlp timed out after {:?}",
                    self.timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("yt-dlp stderr: {}", stderr.trim());
            return Err(Self::classify_stderr(reference, &stderr));
        }

        let handle = Self::parse_output(reference, &output.stdout)?;
        info!("✅ Resuelto: {} ({:?})", handle.title(), handle.duration());
        Ok(handle)
    }
}
