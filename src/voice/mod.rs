//! # Voice Module
//!
//! Connection to the remote playback gateway.
//!
//! The control channel carries the handshake, heartbeats and close messages;
//! the media channel carries sequenced, timestamped and encrypted Opus
//! frames. [`session`] drives the connection lifecycle, [`gateway`] is the
//! concrete TCP/UDP transport.

pub mod gateway;
pub mod session;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use crate::{audio::OpusFrame, error::ConnectionError};

pub use gateway::TcpGateway;
pub use session::{VoiceHandle, VoiceSession};

/// A logical playback target (one voice channel) with its own queue and connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination(pub u64);

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum VoiceState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
    /// Final state; nothing follows it.
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Explicit leave or stop.
    Left,
    /// Reconnects kept failing until the budget ran out.
    RetryBudgetExhausted,
}

impl VoiceState {
    /// Legal edges of the state machine. Any state may close.
    pub fn can_transition_to(self, next: VoiceState) -> bool {
        use VoiceState::*;
        match (self, next) {
            (Closed(_), _) => false,
            (_, Closed(_)) => true,
            (Disconnected, Connecting)
            | (Connecting, Authenticating)
            | (Authenticating, Ready)
            | (Ready, Reconnecting)
            | (Reconnecting, Ready) => true,
            // a failing first connect spends the same reconnect budget
            (Connecting, Reconnecting) | (Authenticating, Reconnecting) => true,
            _ => false,
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(self, VoiceState::Ready)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, VoiceState::Closed(_))
    }
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceState::Disconnected => write!(f, "disconnected"),
            VoiceState::Connecting => write!(f, "connecting"),
            VoiceState::Authenticating => write!(f, "authenticating"),
            VoiceState::Ready => write!(f, "ready"),
            VoiceState::Reconnecting => write!(f, "reconnecting"),
            VoiceState::Closed(CloseReason::Left) => write!(f, "closed"),
            VoiceState::Closed(CloseReason::RetryBudgetExhausted) => write!(f, "closed (retry budget exhausted)"),
        }
    }
}

/// Opaque 32-byte media key agreed during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(pub [u8; 32]);

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Everything the media channel needs for one established connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    /// Bumped on every successful (re)handshake; frame counters restart per epoch.
    pub epoch: u64,
    pub destination: Destination,
    pub session_id: String,
    pub ssrc: u32,
    pub media_addr: SocketAddr,
    pub key: SessionKey,
}

/// What the pacer may do right now.
#[derive(Debug, Clone, PartialEq)]
pub enum Link {
    /// No usable connection yet, or it is being re-established; hold frames.
    Down,
    Up(Arc<ConnectionInfo>),
    /// Terminal; drop whatever is buffered.
    Closed,
}

/// Where to connect and how to authenticate.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub endpoint: String,
    pub token: String,
}

/// Bounded reconnect allowance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBudget {
    pub max_attempts: u32,
    pub window: Duration,
    pub base_backoff: Duration,
}

impl RetryBudget {
    /// `base * 2^min(attempt-1, 3)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.pow(attempt.saturating_sub(1).min(3))
    }
}

/// Messages on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "snake_case")]
pub enum ControlMessage {
    Identify { destination: u64, token: String },
    Resume { destination: u64, token: String, session_id: String },
    Ready {
        session_id: String,
        ssrc: u32,
        media_addr: SocketAddr,
        /// base64 of the 32-byte key
        secret_key: String,
    },
    Rejected { reason: String },
    Heartbeat { nonce: u64 },
    HeartbeatAck { nonce: u64 },
    Close { code: u16, reason: String },
}

/// Opens control and media channels to the remote gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn open_control(&self, credentials: &Credentials) -> Result<Box<dyn ControlChannel>, ConnectionError>;

    async fn open_media(&self, connection: &ConnectionInfo) -> Result<Box<dyn FrameSink>, ConnectionError>;
}

/// Message-oriented control session.
#[async_trait]
pub trait ControlChannel: Send {
    async fn send(&mut self, message: ControlMessage) -> Result<(), ConnectionError>;

    /// `Ok(None)` when the remote end closed the stream.
    async fn recv(&mut self) -> Result<Option<ControlMessage>, ConnectionError>;

    async fn close(&mut self);
}

/// Sends stamped frames for a single connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: &OpusFrame) -> Result<(), ConnectionError>;
}
