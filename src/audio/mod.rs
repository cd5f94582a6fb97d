//! # Audio Module
//!
//! Everything between a resolved stream and the voice link.
//!
//! ## Architecture
//!
//! ### [`transcode`] - Transcoding Pipeline
//! - Owns the `ffmpeg` child process (spawn, pipe I/O, bounded teardown)
//! - Applies the session volume and encodes 20ms Opus frames with libopus
//! - Bounded hand-off channel, so a slow consumer throttles decoding
//!
//! ### [`pacer`] - Frame Pacer
//! - Real-time cadence from a monotonic clock, one frame per 20ms
//! - Small look-ahead buffer, silence on underrun
//! - Fresh sequence/timestamp counters per voice connection
//!
//! ### [`queue`] - Queue Management
//! - Cursor-based queue with `off` / `track` / `queue` loop modes
//!
//! ### [`player`] - Playback Manager
//! - One serialized worker per destination tying the pieces together
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz by default
//! - **Bit Depth**: 16-bit signed little-endian PCM out of ffmpeg
//! - **Channels**: Stereo by default
//! - **Encoding**: Opus, 20ms frames, 96kbps (configurable)

pub mod pacer;
pub mod player;
pub mod queue;
pub mod transcode;

use bytes::Bytes;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::error::PlaybackError;

/// Canonical frame duration.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Opus frame that decodes to silence; sent on underrun.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Largest Opus packet we ever hand to the network.
pub const MAX_PACKET_SIZE: usize = 4000;

/// Shape of the PCM produced by the decoder and consumed by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }

    /// Samples per channel in one frame (960 at 48kHz).
    pub fn samples_per_frame(&self) -> u32 {
        self.sample_rate / 1000 * FRAME_DURATION.as_millis() as u32
    }

    /// Interleaved samples in one frame.
    pub fn interleaved_samples(&self) -> usize {
        self.samples_per_frame() as usize * self.channels as usize
    }

    /// Bytes of s16le PCM in one frame.
    pub fn frame_bytes(&self) -> usize {
        self.interleaved_samples() * 2
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(48_000, 2)
    }
}

/// One encoded audio unit, stamped for a specific voice connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusFrame {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl OpusFrame {
    pub fn is_silence(&self) -> bool {
        self.payload.as_ref() == SILENCE_FRAME
    }
}

/// Volume multiplier shared between a session and its running pipeline.
///
/// Stored as f32 bits so a change applies to the next encoded frame without
/// restarting the transcoder.
#[derive(Debug, Clone)]
pub struct SharedVolume(Arc<AtomicU32>);

impl SharedVolume {
    pub fn new(volume: f32) -> Self {
        Self(Arc::new(AtomicU32::new(volume.clamp(0.0, 2.0).to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Stores the clamped value and returns it.
    pub fn set(&self, volume: f32) -> f32 {
        let clamped = volume.clamp(0.0, 2.0);
        self.0.store(clamped.to_bits(), Ordering::Relaxed);
        clamped
    }
}

/// Parses `SS`, `MM:SS` or `HH:MM:SS` (seconds may carry a fraction when given alone).
pub fn parse_timestamp(value: &str) -> Result<Duration, PlaybackError> {
    let s = value.trim();
    if s.is_empty() {
        return Err(PlaybackError::InvalidTimestamp);
    }

    if let Ok(secs) = s.parse::<f64>() {
        if secs < 0.0 {
            return Err(PlaybackError::InvalidTimestamp);
        }
        return Duration::try_from_secs_f64(secs).map_err(|_| PlaybackError::InvalidTimestamp);
    }

    let parts = s
        .split(':')
        .map(|p| p.trim().parse::<u64>().map_err(|_| PlaybackError::InvalidTimestamp))
        .collect::<Result<Vec<_>, _>>()?;

    let (hh, mm, ss) = match parts.as_slice() {
        [mm, ss] => (0, *mm, *ss),
        [hh, mm, ss] => (*hh, *mm, *ss),
        _ => return Err(PlaybackError::InvalidTimestamp),
    };

    hh.checked_mul(3600)
        .and_then(|h| mm.checked_mul(60).and_then(|m| h.checked_add(m)))
        .and_then(|hm| hm.checked_add(ss))
        .map(Duration::from_secs)
        .ok_or(PlaybackError::InvalidTimestamp)
}
