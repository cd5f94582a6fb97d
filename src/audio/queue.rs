use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::{debug, info};

use crate::error::PlaybackError;

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

/// An entry in a destination's queue. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub id: u64,
    /// What the user asked for: URL, path or search text.
    pub reference: String,
    /// Display title until the track is resolved.
    pub title: String,
    pub requested_by: Option<String>,
    pub duration: Option<Duration>,
    pub enqueued_at: DateTime<Utc>,
}

impl Track {
    pub fn new(reference: impl Into<String>) -> Self {
        let reference = reference.into();
        Self {
            id: NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed),
            title: reference.clone(),
            reference,
            requested_by: None,
            duration: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_requested_by(mut self, who: impl Into<String>) -> Self {
        self.requested_by = Some(who.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl std::str::FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "track" | "song" => Ok(Self::Track),
            "queue" | "all" => Ok(Self::Queue),
            other => Err(format!("unknown loop mode: {}", other)),
        }
    }
}

/// Why the cursor is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The track played to its end.
    Completed,
    /// The user skipped it.
    Skipped,
    /// Resolution or transcoding failed.
    Failed,
}

/// Ordered queue with a playback cursor.
///
/// Played tracks stay behind the cursor so `queue` loop mode can wrap; when
/// playback runs off the end in any other mode the queue is emptied.
#[derive(Debug)]
pub struct MusicQueue {
    items: Vec<Track>,
    cursor: Option<usize>,
    loop_mode: LoopMode,
    max_size: usize,
}

impl MusicQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
            loop_mode: LoopMode::Off,
            max_size,
        }
    }

    /// Agrega un track a la cola; devuelve su posición desde el cursor.
    pub fn push(&mut self, track: Track) -> Result<usize, PlaybackError> {
        if self.items.len() >= self.max_size {
            return Err(PlaybackError::QueueFull(self.max_size));
        }

        info!("➕ Agregado a la cola: {}", track.title);
        self.items.push(track);
        Ok(self.upcoming_len())
    }

    /// Points the cursor at the first track when idle.
    pub fn start(&mut self) -> Option<&Track> {
        if self.cursor.is_none() && !self.items.is_empty() {
            self.cursor = Some(0);
        }
        self.current()
    }

    pub fn current(&self) -> Option<&Track> {
        self.cursor.and_then(|c| self.items.get(c))
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Moves the cursor according to the loop mode and returns the next track.
    pub fn advance(&mut self, why: Advance) -> Option<&Track> {
        let Some(cursor) = self.cursor else {
            return self.start();
        };

        if why == Advance::Completed && self.loop_mode == LoopMode::Track {
            debug!("🔂 Repitiendo track en posición {}", cursor);
            return self.current();
        }

        let next = cursor + 1;
        if next < self.items.len() {
            self.cursor = Some(next);
        } else if self.loop_mode == LoopMode::Queue && !self.items.is_empty() {
            info!("🔁 Fin de la cola, volviendo al inicio");
            self.cursor = Some(0);
        } else {
            info!("📭 Cola terminada");
            self.clear();
        }

        self.current()
    }

    /// Limpia la cola
    pub fn clear(&mut self) {
        self.items.clear();
        self.cursor = None;
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Repetición desactivada"),
            LoopMode::Track => info!("🔂 Repetir canción activado"),
            LoopMode::Queue => info!("🔁 Repetir cola activado"),
        }
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Tracks after the cursor (everything when idle).
    pub fn upcoming_len(&self) -> usize {
        match self.cursor {
            Some(c) => self.items.len().saturating_sub(c + 1),
            None => self.items.len(),
        }
    }

    pub fn upcoming(&self) -> &[Track] {
        match self.cursor {
            Some(c) => self.items.get(c + 1..).unwrap_or(&[]),
            None => &self.items,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Known duration of the current and upcoming tracks.
    pub fn remaining_duration(&self) -> Duration {
        let start = self.cursor.unwrap_or(0);
        self.items
            .iter()
            .skip(start)
            .filter_map(|t| t.duration)
            .sum()
    }
}
