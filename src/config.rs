use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::{
    audio::AudioFormat,
    sources::RetryPolicy,
    voice::{session::SessionSettings, Credentials, RetryBudget},
};

/// Runtime configuration consumed by the relay core.
///
/// Every field has a default, so a bare environment only needs the gateway
/// token. Values are layered: defaults, then an optional TOML file, then
/// `RELAY_*` environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // Gateway
    pub gateway_endpoint: String,
    pub gateway_token: String,

    // Audio
    pub ffmpeg_path: String,
    pub ytdlp_path: String,
    /// Directory local files may be played from; none disables local files.
    pub media_root: Option<PathBuf>,
    pub sample_rate: u32,
    pub channels: u16,
    pub opus_bitrate: u32,
    pub lookahead_frames: usize,
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub stop_grace_ms: u64,

    // Voice session
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_window_secs: u64,
    pub reconnect_backoff_ms: u64,

    // Resolver
    pub resolve_timeout_secs: u64,
    pub resolve_retries: u32,
    pub resolve_backoff_ms: u64,
    pub cache_size: usize,
    pub cache_ttl_secs: u64,

    // Sessions
    pub idle_timeout_secs: u64,
    pub stop_idle_timeout_secs: u64,
    pub max_consecutive_failures: u32,

    // Rendimiento
    pub worker_threads: usize,
}

impl Config {
    /// Loads `.env`, the optional config file and the environment.
    ///
    /// The file path comes from `RELAY_CONFIG` and defaults to `relay.toml`;
    /// a missing file is not an error.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path: PathBuf = std::env::var("RELAY_CONFIG")
            .unwrap_or_else(|_| "relay.toml".to_string())
            .into();

        let config = Self::load_from(Some(path))?;
        config.validate()?;

        Ok(config)
    }

    /// Builds the layered configuration without validating it.
    pub fn load_from(file: Option<PathBuf>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(::config::File::from(path).required(false));
        }

        let config: Self = builder
            .add_source(::config::Environment::with_prefix("RELAY").try_parsing(true))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 2.0
    /// - Opus bitrate must be within 8..=510 kbps
    /// - Sample rate must be one libopus accepts, channels 1 or 2
    /// - Look-ahead buffer must hold between 1 and 64 frames
    /// - Timeouts must be non-zero and the heartbeat timeout must exceed the interval
    /// - At least one worker thread, and the media root (if set) must be a directory
    pub fn validate(&self) -> Result<()> {
        if self.default_volume < 0.0 || self.default_volume > 2.0 {
            anyhow::bail!("Default volume must be between 0.0 and 2.0, got: {}", self.default_volume);
        }

        if self.opus_bitrate > 510_000 {
            anyhow::bail!("Opus bitrate cannot exceed 510kbps, got: {}", self.opus_bitrate);
        }

        if self.opus_bitrate < 8_000 {
            anyhow::bail!("Opus bitrate too low, minimum 8kbps, got: {}", self.opus_bitrate);
        }

        if !matches!(self.sample_rate, 8_000 | 12_000 | 16_000 | 24_000 | 48_000) {
            anyhow::bail!("Sample rate {} is not supported by Opus", self.sample_rate);
        }

        if !(1..=2).contains(&self.channels) {
            anyhow::bail!("Channels must be 1 or 2, got: {}", self.channels);
        }

        if self.lookahead_frames == 0 || self.lookahead_frames > 64 {
            anyhow::bail!("Look-ahead must hold 1..=64 frames, got: {}", self.lookahead_frames);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.cache_size == 0 {
            anyhow::bail!("Cache size must be greater than 0");
        }

        if self.heartbeat_interval_ms == 0 || self.connect_timeout_ms == 0 {
            anyhow::bail!("Heartbeat interval and connect timeout must be greater than 0");
        }

        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            anyhow::bail!(
                "Heartbeat timeout ({}ms) must be longer than the interval ({}ms)",
                self.heartbeat_timeout_ms,
                self.heartbeat_interval_ms
            );
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        if let Some(root) = &self.media_root {
            if !root.is_dir() {
                anyhow::bail!("Media root {} is not a directory", root.display());
            }
        }

        if self.reconnect_max_attempts == 0 {
            anyhow::bail!("Reconnect budget must allow at least one attempt");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The gateway token is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Gateway: {} (token {})\n  \
            Audio: {}Hz x{}, {}kbps, {} frame look-ahead, {}% vol\n  \
            Voice: heartbeat {}ms/{}ms, {} reconnects in {}s\n  \
            Resolver: {} retries, cache {} entries for {}\n  \
            Limits: {} queue, idle {}",
            self.gateway_endpoint,
            if self.gateway_token.is_empty() { "missing" } else { "set" },
            self.sample_rate,
            self.channels,
            self.opus_bitrate / 1000,
            self.lookahead_frames,
            (self.default_volume * 100.0) as u32,
            self.heartbeat_interval_ms,
            self.heartbeat_timeout_ms,
            self.reconnect_max_attempts,
            self.reconnect_window_secs,
            self.resolve_retries,
            self.cache_size,
            humantime::format_duration(self.cache_ttl()),
            self.max_queue_size,
            humantime::format_duration(self.idle_timeout()),
        )
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget {
            max_attempts: self.reconnect_max_attempts,
            window: Duration::from_secs(self.reconnect_window_secs),
            base_backoff: Duration::from_millis(self.reconnect_backoff_ms),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect_timeout: self.connect_timeout(),
            heartbeat_interval: self.heartbeat_interval(),
            heartbeat_timeout: self.heartbeat_timeout(),
            budget: self.retry_budget(),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            endpoint: self.gateway_endpoint.clone(),
            token: self.gateway_token.clone(),
        }
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.resolve_retries,
            base_backoff: self.resolve_backoff(),
            timeout: self.resolve_timeout(),
        }
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn resolve_backoff(&self) -> Duration {
        Duration::from_millis(self.resolve_backoff_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn stop_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_idle_timeout_secs)
    }
}

/// Default configuration values.
///
/// Used as fallbacks when neither the file nor the environment set a key.
impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_endpoint: "127.0.0.1:7400".to_string(),
            gateway_token: String::new(),

            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_path: "yt-dlp".to_string(),
            media_root: None,
            sample_rate: 48_000,
            channels: 2,
            opus_bitrate: 96_000, // 96kbps
            lookahead_frames: 5,  // 100ms at 20ms frames
            default_volume: 1.0,
            max_queue_size: 1000,
            stop_grace_ms: 2_000,

            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            reconnect_max_attempts: 5,
            reconnect_window_secs: 60,
            reconnect_backoff_ms: 1_000,

            resolve_timeout_secs: 30,
            resolve_retries: 3,
            resolve_backoff_ms: 1_000,
            cache_size: 100,
            cache_ttl_secs: 300,

            idle_timeout_secs: 120,
            stop_idle_timeout_secs: 15,
            max_consecutive_failures: 5,

            worker_threads: num_cpus::get(),
        }
    }
}
