pub mod direct_url;
pub mod ytdlp;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ResolutionError;

pub use direct_url::DirectUrlResolver;
pub use ytdlp::YtDlpResolver;

/// Turns a user reference (URL, local path or search query) into something
/// the transcoder can open.
///
/// Implementations may hit the network but never touch queue state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<StreamHandle, ResolutionError>;
}

/// Where a handle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Direct,
    File,
    YtDlp,
}

/// A resolved, playable stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHandle {
    input: String,
    title: String,
    uploader: Option<String>,
    duration: Option<Duration>,
    thumbnail: Option<String>,
    seekable: bool,
    is_live: bool,
    kind: SourceKind,
}

impl StreamHandle {
    pub fn new(input: impl Into<String>, title: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            input: input.into(),
            title: title.into(),
            uploader: None,
            duration: None,
            thumbnail: None,
            seekable: false,
            is_live: false,
            kind,
        }
    }

    // Getters
    /// URL or path handed to the decoder.
    pub fn input(&self) -> &str {
        &self.input
    }
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn uploader(&self) -> Option<&str> {
        self.uploader.as_deref()
    }
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }
    pub fn is_seekable(&self) -> bool {
        self.seekable && !self.is_live
    }
    pub fn is_live(&self) -> bool {
        self.is_live
    }
    pub fn kind(&self) -> SourceKind {
        self.kind
    }
    /// Whether the decoder reads this input over HTTP.
    pub fn is_remote(&self) -> bool {
        self.input.starts_with("http://") || self.input.starts_with("https://")
    }

    // Setters
    pub fn with_uploader(mut self, uploader: String) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: String) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    pub fn with_seekable(mut self, seekable: bool) -> Self {
        self.seekable = seekable;
        self
    }

    pub fn with_live(mut self, is_live: bool) -> Self {
        self.is_live = is_live;
        self
    }
}

/// Dispatches each reference to the resolver that understands it.
///
/// - files below the media root and direct audio URLs: [`DirectUrlResolver`]
/// - page URLs and plain search queries: [`YtDlpResolver`], falling back to a
///   direct probe when yt-dlp does not know the site
pub struct SmartResolver {
    direct: DirectUrlResolver,
    ytdlp: YtDlpResolver,
}

impl SmartResolver {
    pub fn new(direct: DirectUrlResolver, ytdlp: YtDlpResolver) -> Self {
        Self { direct, ytdlp }
    }
}

#[async_trait]
impl SourceResolver for SmartResolver {
    async fn resolve(&self, reference: &str) -> Result<StreamHandle, ResolutionError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ResolutionError::Unsupported("empty reference".to_string()));
        }

        if DirectUrlResolver::is_direct(reference) || self.direct.is_local(reference) {
            debug!("🎯 Resolviendo como fuente directa: {}", reference);
            return self.direct.resolve(reference).await;
        }

        match self.ytdlp.resolve(reference).await {
            Err(ResolutionError::Unsupported(reason)) if is_http_url(reference) => {
                info!("🔄 yt-dlp no soporta {}, probando URL directa ({})", reference, reason);
                self.direct.resolve(reference).await
            }
            other => other,
        }
    }
}

pub(crate) fn is_http_url(reference: &str) -> bool {
    url::Url::parse(reference)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// How hard to try before reporting a resolution failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Exponential backoff with a little jitter; rate limits wait at least
    /// as long as the server asked.
    pub fn backoff_for(&self, attempt: u32, error: &ResolutionError) -> Duration {
        let exp = self.base_backoff * 2u32.pow(attempt.saturating_sub(1).min(3));
        let jitter_ms = (self.base_backoff.as_millis() as u64 / 4).max(1);
        let delay = exp + Duration::from_millis(fastrand::u64(0..jitter_ms));

        match error {
            ResolutionError::RateLimited { retry_after: Some(after) } => delay.max(*after),
            _ => delay,
        }
    }
}

/// Resolves `reference`, retrying network failures and rate limits.
pub async fn resolve_with_retry(
    resolver: &dyn SourceResolver,
    reference: &str,
    policy: &RetryPolicy,
) -> Result<StreamHandle, ResolutionError> {
    let mut attempt = 0;

    loop {
        let result = match tokio::time::timeout(policy.timeout, resolver.resolve(reference)).await {
            Ok(result) => result,
            Err(_) => Err(ResolutionError::NetworkFailure(format!(
                "resolution timed out after {:?}",
                policy.timeout
            ))),
        };

        match result {
            Err(e) if e.is_retryable() && attempt < policy.retries => {
                attempt += 1;
                let delay = policy.backoff_for(attempt, &e);
                warn!(
                    "🔄 Resolución falló ({}), reintento {}/{} en {:?}",
                    e, attempt, policy.retries, delay
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Broad queries used for random picks.
pub const RANDOM_QUERIES: &[&str] = &[
    "top hits mix", "pop mix", "new music mix", "chart hits playlist",
    "hip hop mix", "rap hits mix", "boom bap mix", "trap mix",
    "rock classics mix", "alternative rock mix", "metal mix", "punk rock mix",
    "edm mix", "house mix", "techno mix", "drum and bass mix", "trance mix",
    "r&b mix", "neo soul mix", "funk mix",
    "jazz mix", "smooth jazz", "blues mix",
    "classical music", "piano instrumental", "orchestral music",
    "country mix", "folk acoustic mix",
    "latin hits mix", "reggaeton mix",
    "reggae mix", "afrobeats mix",
    "k-pop mix", "j-pop mix",
    "lofi hip hop", "chill mix", "study music", "ambient music", "synthwave mix",
    "video game soundtrack mix", "anime openings mix", "movie soundtrack mix",
    "80s hits mix", "90s hits mix", "2000s hits mix",
];

/// Samples `rolls` candidate queries (clamped to 1..=10) and picks one of them.
pub fn random_query(rolls: usize) -> &'static str {
    let rolls = rolls.clamp(1, 10).min(RANDOM_QUERIES.len());
    let mut rng = rand::thread_rng();
    let candidates: Vec<&&str> = RANDOM_QUERIES.choose_multiple(&mut rng, rolls).collect();
    candidates
        .choose(&mut rng)
        .map(|q| **q)
        .unwrap_or(RANDOM_QUERIES[0])
}
