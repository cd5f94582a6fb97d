use bytes::Bytes;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, trace, warn};

use super::{
    transcode::{FeedItem, TrackFeed},
    AudioFormat, OpusFrame, FRAME_DURATION, SILENCE_FRAME,
};
use crate::voice::{FrameSink, Gateway, Link};

/// How far behind schedule the pacer may fall before it re-anchors.
const MAX_LAG: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum PacerCommand {
    /// Replace whatever is playing; the buffer is flushed.
    Play { feed: TrackFeed, generation: u64 },
    Pause,
    Resume,
    /// Flush and go idle.
    Stop,
}

/// Reported back to the session worker.
#[derive(Debug, Clone, PartialEq)]
pub enum PacerEvent {
    TrackEnded { generation: u64 },
    TrackFailed { generation: u64, error: String },
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    silence_sent: AtomicU64,
    send_errors: AtomicU64,
}

/// Snapshot of pacer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct PacerStats {
    pub frames_sent: u64,
    /// Underruns; each one is a silence frame instead of audio.
    pub silence_sent: u64,
    pub send_errors: u64,
}

/// Worker-side controls of a [`FramePacer`] task.
#[derive(Debug)]
pub struct PacerHandle {
    commands: mpsc::UnboundedSender<PacerCommand>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl PacerHandle {
    pub fn play(&self, feed: TrackFeed, generation: u64) {
        self.send(PacerCommand::Play { feed, generation });
    }

    pub fn pause(&self) {
        self.send(PacerCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(PacerCommand::Resume);
    }

    pub fn stop(&self) {
        self.send(PacerCommand::Stop);
    }

    pub fn stats(&self) -> PacerStats {
        PacerStats {
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            silence_sent: self.counters.silence_sent.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
        }
    }

    /// Ends the task; the media sink is dropped with it.
    pub async fn shutdown(self) {
        drop(self.commands);
        let mut task = self.task;
        if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
            task.abort();
        }
    }

    fn send(&self, command: PacerCommand) {
        if self.commands.send(command).is_err() {
            debug!("Pacer ya terminado, comando descartado");
        }
    }
}

/// Absolute schedule: tick k is due at `origin + k * FRAME_DURATION`.
#[derive(Debug)]
struct Cadence {
    origin: Instant,
    ticks: u64,
}

impl Cadence {
    fn new(now: Instant) -> Self {
        Self { origin: now, ticks: 0 }
    }

    fn due(&self) -> Instant {
        self.origin + FRAME_DURATION * self.ticks as u32
    }

    fn advance(&mut self, now: Instant) {
        self.ticks += 1;
        let due = self.due();
        if now > due + MAX_LAG {
            warn!("⏱️ Pacer atrasado {:?}, re-anclando", now - due);
            *self = Cadence::new(now);
        }
    }
}

struct ActiveFeed {
    feed: TrackFeed,
    generation: u64,
    /// A terminal item is already buffered.
    exhausted: bool,
}

/// Media sink plus the counters scoped to one connection epoch.
struct MediaLink {
    epoch: u64,
    sink: Box<dyn FrameSink>,
    sequence: u16,
    timestamp: u32,
}

/// Sends frames to the voice link at real-time cadence.
pub struct FramePacer {
    commands: mpsc::UnboundedReceiver<PacerCommand>,
    events: mpsc::UnboundedSender<PacerEvent>,
    link: watch::Receiver<Link>,
    gateway: Arc<dyn Gateway>,
    format: AudioFormat,
    lookahead: usize,
    feed: Option<ActiveFeed>,
    buffer: VecDeque<FeedItem>,
    paused: bool,
    media: Option<MediaLink>,
    cadence: Option<Cadence>,
    counters: Arc<Counters>,
}

impl FramePacer {
    pub fn spawn(
        link: watch::Receiver<Link>,
        gateway: Arc<dyn Gateway>,
        format: AudioFormat,
        lookahead: usize,
        events: mpsc::UnboundedSender<PacerEvent>,
    ) -> PacerHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        let pacer = Self {
            commands: commands_rx,
            events,
            link,
            gateway,
            format,
            lookahead: lookahead.max(1),
            feed: None,
            buffer: VecDeque::with_capacity(lookahead.max(1)),
            paused: false,
            media: None,
            cadence: None,
            counters: counters.clone(),
        };

        PacerHandle {
            commands: commands_tx,
            counters,
            task: tokio::spawn(pacer.run()),
        }
    }

    async fn run(mut self) {
        self.sync_link().await;

        loop {
            let active = self.feed.is_some() && !self.paused && self.media.is_some();
            match (active, self.cadence.is_some()) {
                (true, false) => self.cadence = Some(Cadence::new(Instant::now())),
                (false, true) => self.cadence = None,
                _ => {}
            }
            let due = self.cadence.as_ref().map(Cadence::due);
            let wants_more = self
                .feed
                .as_ref()
                .is_some_and(|f| !f.exhausted && self.buffer.len() < self.lookahead);

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                changed = self.link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.sync_link().await;
                }

                item = next_item(self.feed.as_ref()), if wants_more => self.buffer_item(item),

                _ = crate::sleep_until_opt(due), if active => self.tick().await,
            }
        }

        debug!("Pacer terminado");
    }

    fn handle_command(&mut self, command: PacerCommand) {
        match command {
            PacerCommand::Play { feed, generation } => {
                trace!("▶️ Pacer: generación {}", generation);
                self.buffer.clear();
                self.feed = Some(ActiveFeed {
                    feed,
                    generation,
                    exhausted: false,
                });
                self.paused = false;
            }
            PacerCommand::Pause => self.paused = true,
            PacerCommand::Resume => self.paused = false,
            PacerCommand::Stop => self.flush(),
        }
    }

    fn buffer_item(&mut self, item: Option<FeedItem>) {
        let item = item.unwrap_or_else(|| {
            FeedItem::Failed(crate::error::TranscodeError::Encoder(
                "transcoder stopped without finishing".to_string(),
            ))
        });
        if !matches!(item, FeedItem::Frame(_)) {
            if let Some(active) = self.feed.as_mut() {
                active.exhausted = true;
            }
        }
        self.buffer.push_back(item);
    }

    async fn tick(&mut self) {
        match self.buffer.pop_front() {
            Some(FeedItem::Frame(payload)) => {
                self.send(payload).await;
                if let Some(active) = &self.feed {
                    active.feed.mark_played();
                }
            }
            Some(FeedItem::End) => {
                if let Some(active) = self.feed.take() {
                    self.report(PacerEvent::TrackEnded {
                        generation: active.generation,
                    });
                }
                self.buffer.clear();
            }
            Some(FeedItem::Failed(e)) => {
                if let Some(active) = self.feed.take() {
                    self.report(PacerEvent::TrackFailed {
                        generation: active.generation,
                        error: e.to_string(),
                    });
                }
                self.buffer.clear();
            }
            None => {
                self.counters.silence_sent.fetch_add(1, Ordering::Relaxed);
                self.send(Bytes::from_static(&SILENCE_FRAME)).await;
            }
        }

        if let Some(cadence) = self.cadence.as_mut() {
            cadence.advance(Instant::now());
        }
    }

    async fn send(&mut self, payload: Bytes) {
        let Some(media) = self.media.as_mut() else {
            return;
        };

        let frame = OpusFrame {
            sequence: media.sequence,
            timestamp: media.timestamp,
            payload,
        };
        media.sequence = media.sequence.wrapping_add(1);
        media.timestamp = media.timestamp.wrapping_add(self.format.samples_per_frame());

        match media.sink.send_frame(&frame).await {
            Ok(()) => {
                if !frame.is_silence() {
                    self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                // datagram loss is recovered by the voice session, not here
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                trace!("Error enviando frame {}: {}", frame.sequence, e);
            }
        }
    }

    async fn sync_link(&mut self) {
        let link = self.link.borrow_and_update().clone();
        match link {
            Link::Down => {
                if self.media.take().is_some() {
                    info!("⏸️ Enlace de voz caído, pacer suspendido");
                }
            }
            Link::Up(info) => {
                if self.media.as_ref().is_some_and(|m| m.epoch == info.epoch) {
                    return;
                }
                self.media = None;
                match self.gateway.open_media(&info).await {
                    Ok(sink) => {
                        info!("▶️ Pacer conectado (epoch {})", info.epoch);
                        self.media = Some(MediaLink {
                            epoch: info.epoch,
                            sink,
                            sequence: 0,
                            timestamp: 0,
                        });
                    }
                    Err(e) => error!("❌ No se pudo abrir el canal de medios: {}", e),
                }
            }
            Link::Closed => {
                self.media = None;
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        self.feed = None;
        self.buffer.clear();
        self.paused = false;
    }

    fn report(&self, event: PacerEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_item(feed: Option<&ActiveFeed>) -> Option<FeedItem> {
    match feed {
        Some(active) => active.feed.next().await,
        None => std::future::pending().await,
    }
}
