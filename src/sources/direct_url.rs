use async_trait::async_trait;
use reqwest::{header, StatusCode};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

use super::{SourceKind, SourceResolver, StreamHandle};
use crate::error::ResolutionError;

const AUDIO_EXTENSIONS: [&str; 8] = [".mp3", ".wav", ".ogg", ".opus", ".flac", ".m4a", ".aac", ".webm"];

/// Resolver for local files and plain HTTP(S) audio URLs.
///
/// URLs are probed with a `HEAD` request before anything is committed, so a
/// dead link fails here instead of inside ffmpeg. Local files are only
/// served from below the media root, and not at all without one.
pub struct DirectUrlResolver {
    client: reqwest::Client,
    media_root: Option<PathBuf>,
}

impl DirectUrlResolver {
    pub fn new(timeout: Duration) -> Result<Self, ResolutionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResolutionError::NetworkFailure(e.to_string()))?;
        Ok(Self {
            client,
            media_root: None,
        })
    }

    /// Allows local files below `root`.
    pub fn with_media_root(mut self, root: impl AsRef<Path>) -> Result<Self, ResolutionError> {
        let root = root.as_ref();
        let canonical = root
            .canonicalize()
            .map_err(|e| ResolutionError::NotFound(format!("media root {}: {}", root.display(), e)))?;
        info!("📁 Archivos locales habilitados en {}", canonical.display());
        self.media_root = Some(canonical);
        Ok(self)
    }

    /// Whether `reference` names a playable file below the media root.
    pub fn is_local(&self, reference: &str) -> bool {
        self.media_root
            .as_deref()
            .and_then(|root| confine(root, reference).ok())
            .is_some_and(|path| path.is_file())
    }

    fn resolve_local(&self, reference: &str) -> Result<StreamHandle, ResolutionError> {
        let Some(root) = self.media_root.as_deref() else {
            return Err(ResolutionError::Unsupported(format!(
                "local files are disabled: {}",
                reference
            )));
        };
        Self::resolve_file(&confine(root, reference)?)
    }

    /// HTTP(S) URL whose path ends in a known audio extension.
    pub fn is_direct(reference: &str) -> bool {
        let Ok(url) = url::Url::parse(reference) else {
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }

        let path = url.path().to_lowercase();
        AUDIO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }

    fn resolve_file(path: &Path) -> Result<StreamHandle, ResolutionError> {
        if !path.is_file() {
            return Err(ResolutionError::NotFound(path.display().to_string()));
        }

        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(StreamHandle::new(path.display().to_string(), title, SourceKind::File).with_seekable(true))
    }

    async fn probe(&self, reference: &str) -> Result<StreamHandle, ResolutionError> {
        let response = self
            .client
            .head(reference)
            .send()
            .await
            .map_err(|e| ResolutionError::NetworkFailure(e.to_string()))?;

        let status = response.status();
        let headers = response.headers();
        debug!("🔗 HEAD {} -> {}", reference, status);

        if let Some(err) = classify_status(status, headers) {
            return Err(err);
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        if !content_type.is_empty() && !is_audio_content_type(&content_type) && !Self::is_direct(reference) {
            return Err(ResolutionError::Unsupported(format!(
                "{} serves {}",
                reference, content_type
            )));
        }

        let seekable = headers
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        let title = title_from_url(reference);
        info!("✅ URL directa válida: {} (seekable: {})", title, seekable);

        Ok(StreamHandle::new(reference, title, SourceKind::Direct).with_seekable(seekable))
    }
}

#[async_trait]
impl SourceResolver for DirectUrlResolver {
    async fn resolve(&self, reference: &str) -> Result<StreamHandle, ResolutionError> {
        if super::is_http_url(reference) {
            self.probe(reference).await
        } else {
            self.resolve_local(reference)
        }
    }
}

/// Canonical path of `reference` (relative to `root` unless absolute), if it
/// stays inside `root`.
fn confine(root: &Path, reference: &str) -> Result<PathBuf, ResolutionError> {
    let canonical = root
        .join(reference)
        .canonicalize()
        .map_err(|_| ResolutionError::NotFound(reference.to_string()))?;

    if !canonical.starts_with(root) {
        return Err(ResolutionError::Unsupported(format!(
            "{} is outside the media root",
            reference
        )));
    }
    Ok(canonical)
}

fn classify_status(status: StatusCode, headers: &header::HeaderMap) -> Option<ResolutionError> {
    if status.is_success() {
        return None;
    }

    let err = match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => ResolutionError::NotFound(status.to_string()),
        StatusCode::TOO_MANY_REQUESTS => ResolutionError::RateLimited {
            retry_after: headers
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        s if s.is_client_error() => ResolutionError::Unsupported(s.to_string()),
        s => ResolutionError::NetworkFailure(s.to_string()),
    };

    Some(err)
}

fn is_audio_content_type(content_type: &str) -> bool {
    content_type.starts_with("audio/")
        || content_type.starts_with("video/")
        || content_type.starts_with("application/ogg")
        || content_type.starts_with("application/octet-stream")
}

fn title_from_url(reference: &str) -> String {
    url::Url::parse(reference)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| reference.to_string())
}
