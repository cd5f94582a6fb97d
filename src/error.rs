//! Error types for the relay core.
//!
//! Each layer reports a typed outcome instead of terminating anything; the
//! session worker turns these into queue advances or state transitions.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while turning a reference into a playable stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("Nothing found for: {0}")]
    NotFound(String),

    #[error("Unsupported reference: {0}")]
    Unsupported(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
}

impl ResolutionError {
    /// Network and rate-limit failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure(_) | Self::RateLimited { .. })
    }
}

/// Errors from the decode/encode pipeline.
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Source does not support seeking")]
    SeekUnsupported,

    #[error("Transcoder exited with {status}: {stderr}")]
    Failure { status: String, stderr: String },

    #[error("Opus encoder error: {0}")]
    Encoder(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors on the voice control or media channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Credentials rejected: {0}")]
    Rejected(String),

    #[error("Heartbeat not acknowledged within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Remote closed the session ({code}): {reason}")]
    RemoteClosed { code: u16, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Errors returned by the caller-facing playback operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("Nothing is playing")]
    NothingPlaying,

    #[error("Nothing is paused")]
    NothingPaused,

    #[error("Queue is full (max {0} tracks)")]
    QueueFull(usize),

    #[error("Source does not support seeking")]
    SeekUnsupported,

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Invalid time format. Use SS, MM:SS, or HH:MM:SS")]
    InvalidTimestamp,

    #[error("Session is closed")]
    SessionClosed,
}

pub type PlaybackResult<T> = std::result::Result<T, PlaybackError>;
