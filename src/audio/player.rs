use dashmap::DashMap;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use super::{
    pacer::{FramePacer, PacerEvent, PacerHandle, PacerStats},
    queue::{Advance, LoopMode, MusicQueue, Track},
    transcode::{Pipeline, PipelineHandle, Transcoder},
    SharedVolume,
};
use crate::{
    config::Config,
    error::{PlaybackError, PlaybackResult, ResolutionError},
    sleep_until_opt,
    sources::{random_query, resolve_with_retry, SourceResolver, StreamHandle},
    voice::{CloseReason, Destination, Gateway, Link, VoiceHandle, VoiceSession, VoiceState},
};

const EVENT_CAPACITY: usize = 256;

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<Config>,
    pub resolver: Arc<dyn SourceResolver>,
    pub transcoder: Arc<dyn Transcoder>,
    pub gateway: Arc<dyn Gateway>,
}

/// Notifications for whoever drives the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlaybackEvent {
    TrackStarted {
        destination: Destination,
        track: Track,
        title: String,
    },
    TrackFailed {
        destination: Destination,
        track: Track,
        error: String,
    },
    QueueFinished {
        destination: Destination,
    },
    VoiceState {
        destination: Destination,
        state: VoiceState,
    },
    SessionTerminated {
        destination: Destination,
        reason: TerminationReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Left,
    Idle,
    ConnectionLost,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Idle,
    Loading,
    Playing,
    Paused,
}

/// Snapshot returned by [`PlaybackManager::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub destination: Destination,
    pub current_track: Option<Track>,
    /// Resolved title of the current track, once known.
    pub title: Option<String>,
    /// Tracks after the current one.
    pub queue_length: usize,
    pub state: PlayerState,
    pub voice: Option<VoiceState>,
    pub loop_mode: LoopMode,
    pub volume: f32,
    pub position: Option<Duration>,
    pub duration: Option<Duration>,
    pub pacer: PacerStats,
}

/// Result of a successful enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub track: Track,
    /// 0 when it started right away, otherwise its place after the current track.
    pub position: usize,
}

type Reply<T> = oneshot::Sender<PlaybackResult<T>>;

enum Command {
    Join { reply: Reply<()> },
    Enqueue { track: Track, reply: Reply<usize> },
    Skip { reply: Reply<Track> },
    Pause { reply: Reply<()> },
    Resume { reply: Reply<()> },
    Stop { reply: Reply<()> },
    Seek { position: Duration, reply: Reply<()> },
    SetLoopMode { mode: LoopMode, reply: Reply<()> },
    SetVolume { volume: f32, reply: Reply<f32> },
    Status { reply: Reply<SessionStatus> },
    Leave { reason: TerminationReason, reply: Reply<()> },
}

struct SessionHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

/// Owns every playback session, at most one per destination.
///
/// Operations on one destination are applied in arrival order by that
/// destination's worker; different destinations run in parallel.
pub struct PlaybackManager {
    sessions: Arc<DashMap<Destination, SessionHandle>>,
    deps: SessionDeps,
    events: broadcast::Sender<PlaybackEvent>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl PlaybackManager {
    pub fn new(deps: SessionDeps) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: Arc::new(DashMap::new()),
            deps,
            events,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn active_sessions(&self) -> Vec<Destination> {
        let mut destinations: Vec<_> = self.sessions.iter().map(|e| *e.key()).collect();
        destinations.sort();
        destinations
    }

    pub async fn join(&self, destination: Destination) -> PlaybackResult<()> {
        self.request(destination, true, PlaybackError::SessionClosed, |reply| Command::Join { reply })
            .await
    }

    /// Leaves voice and destroys the session. A no-op for unknown destinations.
    pub async fn leave(&self, destination: Destination) -> PlaybackResult<()> {
        self.leave_with(destination, TerminationReason::Left).await
    }

    pub async fn enqueue(
        &self,
        destination: Destination,
        reference: &str,
        requested_by: Option<&str>,
    ) -> PlaybackResult<Enqueued> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(PlaybackError::InvalidReference("empty reference".to_string()));
        }

        let mut track = Track::new(reference);
        if let Some(who) = requested_by {
            track = track.with_requested_by(who);
        }

        let position = self
            .request(destination, true, PlaybackError::SessionClosed, |reply| Command::Enqueue {
                track: track.clone(),
                reply,
            })
            .await?;
        Ok(Enqueued { track, position })
    }

    /// Queues one of the built-in broad queries; returns the query picked.
    pub async fn enqueue_random(
        &self,
        destination: Destination,
        rolls: usize,
        requested_by: Option<&str>,
    ) -> PlaybackResult<(String, Enqueued)> {
        let query = random_query(rolls);
        info!("🎲 Selección aleatoria: {}", query);
        let enqueued = self.enqueue(destination, query, requested_by).await?;
        Ok((query.to_string(), enqueued))
    }

    /// Cancels the current track and moves on; returns the skipped track.
    pub async fn skip(&self, destination: Destination) -> PlaybackResult<Track> {
        self.request(destination, false, PlaybackError::NothingPlaying, |reply| Command::Skip { reply })
            .await
    }

    pub async fn pause(&self, destination: Destination) -> PlaybackResult<()> {
        self.request(destination, false, PlaybackError::NothingPlaying, |reply| Command::Pause { reply })
            .await
    }

    pub async fn resume(&self, destination: Destination) -> PlaybackResult<()> {
        self.request(destination, false, PlaybackError::NothingPaused, |reply| Command::Resume { reply })
            .await
    }

    /// Clears the queue and stops playback; voice stays until the short idle timeout.
    pub async fn stop(&self, destination: Destination) -> PlaybackResult<()> {
        self.request(destination, false, PlaybackError::NothingPlaying, |reply| Command::Stop { reply })
            .await
    }

    pub async fn seek(&self, destination: Destination, position: Duration) -> PlaybackResult<()> {
        self.request(destination, false, PlaybackError::NothingPlaying, |reply| Command::Seek {
            position,
            reply,
        })
        .await
    }

    pub async fn set_loop_mode(&self, destination: Destination, mode: LoopMode) -> PlaybackResult<()> {
        self.request(destination, false, PlaybackError::NothingPlaying, |reply| Command::SetLoopMode {
            mode,
            reply,
        })
        .await
    }

    /// Returns the volume actually applied (clamped to 0.0..=2.0).
    pub async fn set_volume(&self, destination: Destination, volume: f32) -> PlaybackResult<f32> {
        self.request(destination, false, PlaybackError::NothingPlaying, |reply| Command::SetVolume {
            volume,
            reply,
        })
        .await
    }

    pub async fn status(&self, destination: Destination) -> Option<SessionStatus> {
        self.request(destination, false, PlaybackError::SessionClosed, |reply| Command::Status { reply })
            .await
            .ok()
    }

    /// Leaves every session and refuses new ones.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let destinations = self.active_sessions();
        if destinations.is_empty() {
            return;
        }

        info!("🛑 Cerrando {} sesiones de reproducción", destinations.len());
        futures::future::join_all(
            destinations
                .into_iter()
                .map(|d| self.leave_with(d, TerminationReason::Shutdown)),
        )
        .await;
    }

    async fn leave_with(&self, destination: Destination, reason: TerminationReason) -> PlaybackResult<()> {
        match self
            .request(destination, false, PlaybackError::SessionClosed, |reply| Command::Leave {
                reason,
                reply,
            })
            .await
        {
            Err(PlaybackError::SessionClosed) => Ok(()),
            other => other,
        }
    }

    /// Sends a command to the destination's worker and waits for the reply.
    ///
    /// With `create`, a missing (or just-exited) session is started first;
    /// otherwise `absent` is returned.
    async fn request<T>(
        &self,
        destination: Destination,
        create: bool,
        absent: PlaybackError,
        make: impl Fn(Reply<T>) -> Command,
    ) -> PlaybackResult<T> {
        for _ in 0..2 {
            let (id, commands) = if create {
                self.ensure_session(destination)?
            } else {
                match self.sessions.get(&destination) {
                    Some(handle) => (handle.id, handle.commands.clone()),
                    None => return Err(absent),
                }
            };

            let (tx, rx) = oneshot::channel();
            if commands.send(make(tx)).is_ok() {
                if let Ok(result) = rx.await {
                    return result;
                }
            }

            // the worker exited between lookup and reply
            self.sessions.remove_if(&destination, |_, h| h.id == id);
            if !create {
                return Err(absent);
            }
        }

        Err(PlaybackError::SessionClosed)
    }

    fn ensure_session(&self, destination: Destination) -> PlaybackResult<(u64, mpsc::UnboundedSender<Command>)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlaybackError::SessionClosed);
        }

        let entry = self.sessions.entry(destination).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (commands, rx) = mpsc::unbounded_channel();
            SessionWorker::spawn(id, destination, self.deps.clone(), self.events.clone(), self.sessions.clone(), rx);
            info!("🆕 Sesión de reproducción creada para destino {}", destination);
            SessionHandle { id, commands }
        });
        Ok((entry.id, entry.commands.clone()))
    }
}

enum Current {
    Idle,
    Resolving {
        generation: u64,
        task: JoinHandle<Result<StreamHandle, ResolutionError>>,
    },
    Playing {
        stream: StreamHandle,
        pipeline: PipelineHandle,
    },
}

/// The serialized actor behind one destination.
struct SessionWorker {
    id: u64,
    destination: Destination,
    deps: SessionDeps,
    events: broadcast::Sender<PlaybackEvent>,
    sessions: Arc<DashMap<Destination, SessionHandle>>,
    commands: mpsc::UnboundedReceiver<Command>,
    queue: MusicQueue,
    volume: SharedVolume,
    current: Current,
    generation: u64,
    paused: bool,
    failures: u32,
    idle_deadline: Option<Instant>,
    voice: Option<VoiceHandle>,
    link: Arc<watch::Sender<Link>>,
    pacer: PacerHandle,
    pacer_events: mpsc::UnboundedReceiver<PacerEvent>,
}

impl SessionWorker {
    fn spawn(
        id: u64,
        destination: Destination,
        deps: SessionDeps,
        events: broadcast::Sender<PlaybackEvent>,
        sessions: Arc<DashMap<Destination, SessionHandle>>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let config = deps.config.clone();
        let (link, link_rx) = watch::channel(Link::Down);
        let (pacer_tx, pacer_events) = mpsc::unbounded_channel();
        let pacer = FramePacer::spawn(
            link_rx,
            deps.gateway.clone(),
            config.audio_format(),
            config.lookahead_frames,
            pacer_tx,
        );

        let worker = Self {
            id,
            destination,
            events,
            sessions,
            commands,
            queue: MusicQueue::new(config.max_queue_size),
            volume: SharedVolume::new(config.default_volume),
            current: Current::Idle,
            generation: 0,
            paused: false,
            failures: 0,
            idle_deadline: None,
            voice: None,
            link: Arc::new(link),
            pacer,
            pacer_events,
            deps,
        };

        tokio::spawn(worker.run());
    }

    async fn run(mut self) {
        let (reason, reply) = loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Leave { reason, reply }) => break (reason, Some(reply)),
                    Some(command) => self.handle(command).await,
                    None => break (TerminationReason::Shutdown, None),
                },

                event = self.pacer_events.recv() => {
                    if let Some(event) = event {
                        self.on_pacer_event(event).await;
                    }
                }

                (generation, result) = resolving(&mut self.current) => {
                    self.on_resolved(generation, result).await;
                }

                state = voice_changed(self.voice.as_mut()) => {
                    if let Some(reason) = self.on_voice_state(state) {
                        break (reason, None);
                    }
                }

                _ = sleep_until_opt(self.idle_deadline) => {
                    info!("💤 Destino {} inactivo, desconectando", self.destination);
                    break (TerminationReason::Idle, None);
                }
            }
        };

        self.finish(reason, reply).await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Join { reply } => {
                self.ensure_voice();
                if matches!(self.current, Current::Idle) && self.idle_deadline.is_none() {
                    self.arm_idle(self.deps.config.idle_timeout());
                }
                let _ = reply.send(Ok(()));
            }
            Command::Enqueue { track, reply } => {
                let result = self.enqueue(track).await;
                let _ = reply.send(result);
            }
            Command::Skip { reply } => {
                let result = self.skip().await;
                let _ = reply.send(result);
            }
            Command::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.resume());
            }
            Command::Stop { reply } => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
            Command::Seek { position, reply } => {
                let result = self.seek(position).await;
                let _ = reply.send(result);
            }
            Command::SetLoopMode { mode, reply } => {
                self.queue.set_loop_mode(mode);
                let _ = reply.send(Ok(()));
            }
            Command::SetVolume { volume, reply } => {
                let applied = self.volume.set(volume);
                info!("🔊 Volumen: {:.0}%", applied * 100.0);
                let _ = reply.send(Ok(applied));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
            Command::Leave { .. } => unreachable!("handled by the run loop"),
        }
    }

    async fn enqueue(&mut self, track: Track) -> PlaybackResult<usize> {
        let position = self.queue.push(track)?;
        self.ensure_voice();

        if matches!(self.current, Current::Idle) {
            self.queue.start();
            self.play_current().await;
            return Ok(0);
        }
        Ok(position)
    }

    async fn skip(&mut self) -> PlaybackResult<Track> {
        if matches!(self.current, Current::Idle) {
            return Err(PlaybackError::NothingPlaying);
        }
        let skipped = self.queue.current().cloned().ok_or(PlaybackError::NothingPlaying)?;
        info!("⏭️ Saltando: {}", skipped.title);

        self.release_current().await;
        self.queue.advance(Advance::Skipped);
        self.play_current().await;
        Ok(skipped)
    }

    fn pause(&mut self) -> PlaybackResult<()> {
        if matches!(self.current, Current::Idle) {
            return Err(PlaybackError::NothingPlaying);
        }
        if !self.paused {
            self.paused = true;
            if let Current::Playing { pipeline, .. } = &self.current {
                pipeline.pause();
            }
            self.pacer.pause();
            info!("⏸️ Reproducción pausada");
        }
        Ok(())
    }

    fn resume(&mut self) -> PlaybackResult<()> {
        if !self.paused {
            return Err(PlaybackError::NothingPaused);
        }
        self.paused = false;
        if let Current::Playing { pipeline, .. } = &self.current {
            pipeline.resume();
        }
        self.pacer.resume();
        info!("▶️ Reproducción reanudada");
        Ok(())
    }

    async fn stop(&mut self) -> PlaybackResult<()> {
        if matches!(self.current, Current::Idle) && self.queue.is_empty() {
            return Err(PlaybackError::NothingPlaying);
        }
        self.release_current().await;
        self.queue.clear();
        self.failures = 0;
        info!("⏹️ Reproducción detenida en destino {}", self.destination);
        self.arm_idle(self.deps.config.stop_idle_timeout());
        Ok(())
    }

    async fn seek(&mut self, position: Duration) -> PlaybackResult<()> {
        let stream = match &self.current {
            Current::Playing { stream, .. } => stream.clone(),
            _ => return Err(PlaybackError::NothingPlaying),
        };
        if !stream.is_seekable() {
            return Err(PlaybackError::SeekUnsupported);
        }

        info!("⏩ Saltando a {:?} en {}", position, stream.title());
        self.release_current().await;
        self.generation += 1;
        self.start_pipeline(stream, position).await;
        Ok(())
    }

    /// Starts resolving whatever the cursor points at.
    async fn play_current(&mut self) {
        self.release_current().await;
        self.paused = false;

        let Some(track) = self.queue.current().cloned() else {
            self.on_queue_finished();
            return;
        };

        self.idle_deadline = None;
        self.generation += 1;
        self.ensure_voice();

        debug!("🔍 Resolviendo: {}", track.reference);
        let resolver = self.deps.resolver.clone();
        let policy = self.deps.config.retry_policy();
        let task = tokio::spawn(async move { resolve_with_retry(resolver.as_ref(), &track.reference, &policy).await });
        self.current = Current::Resolving {
            generation: self.generation,
            task,
        };
    }

    async fn on_resolved(&mut self, generation: u64, result: Result<StreamHandle, ResolutionError>) {
        // the finished task must not be polled again
        self.current = Current::Idle;
        if generation != self.generation {
            return;
        }
        match result {
            Ok(stream) => self.start_pipeline(stream, Duration::ZERO).await,
            Err(e) => self.fail_current(e.to_string()).await,
        }
    }

    async fn start_pipeline(&mut self, stream: StreamHandle, offset: Duration) {
        let started = self
            .deps
            .transcoder
            .start(&stream, offset, self.volume.clone())
            .await;

        let Pipeline { feed, handle } = match started {
            Ok(pipeline) => pipeline,
            Err(e) => return self.fail_current(e.to_string()).await,
        };

        if self.paused {
            handle.pause();
        }
        self.pacer.play(feed, self.generation);
        if self.paused {
            self.pacer.pause();
        }

        if offset.is_zero() {
            if let Some(track) = self.queue.current().cloned() {
                info!("🎵 Reproduciendo: {}", stream.title());
                self.emit(PlaybackEvent::TrackStarted {
                    destination: self.destination,
                    title: stream.title().to_string(),
                    track,
                });
            }
        }

        self.current = Current::Playing {
            stream,
            pipeline: handle,
        };
    }

    async fn on_pacer_event(&mut self, event: PacerEvent) {
        match event {
            PacerEvent::TrackEnded { generation } if generation == self.generation => {
                self.failures = 0;
                self.release_current().await;
                self.queue.advance(Advance::Completed);
                self.play_current().await;
            }
            PacerEvent::TrackFailed { generation, error } if generation == self.generation => {
                self.release_current().await;
                self.fail_current(error).await;
            }
            stale => debug!("Evento del pacer descartado: {:?}", stale),
        }
    }

    /// Reports the current track as failed and moves past it.
    async fn fail_current(&mut self, error: String) {
        self.failures += 1;
        if let Some(track) = self.queue.current().cloned() {
            warn!("❌ Fallo en track {} ({}): {}", track.title, self.failures, error);
            self.emit(PlaybackEvent::TrackFailed {
                destination: self.destination,
                track,
                error,
            });
        }

        let limit = self.deps.config.max_consecutive_failures;
        if self.failures >= limit {
            error!("🚨 {} fallos consecutivos, deteniendo la reproducción", self.failures);
            self.failures = 0;
            self.queue.clear();
            self.on_queue_finished();
            return;
        }

        self.queue.advance(Advance::Failed);
        self.play_current().await;
    }

    fn on_queue_finished(&mut self) {
        self.current = Current::Idle;
        self.pacer.stop();
        info!("📭 Cola terminada en destino {}", self.destination);
        self.emit(PlaybackEvent::QueueFinished {
            destination: self.destination,
        });
        self.arm_idle(self.deps.config.idle_timeout());
    }

    fn on_voice_state(&mut self, state: Option<VoiceState>) -> Option<TerminationReason> {
        let Some(state) = state else {
            self.voice = None;
            return None;
        };

        self.emit(PlaybackEvent::VoiceState {
            destination: self.destination,
            state,
        });

        match state {
            VoiceState::Closed(CloseReason::RetryBudgetExhausted) => {
                error!("💀 Conexión de voz perdida definitivamente en destino {}", self.destination);
                self.voice = None;
                Some(TerminationReason::ConnectionLost)
            }
            VoiceState::Closed(CloseReason::Left) => {
                self.voice = None;
                None
            }
            _ => None,
        }
    }

    /// Cancels an in-flight resolve or pipeline; the pacer drops its buffer.
    async fn release_current(&mut self) {
        match std::mem::replace(&mut self.current, Current::Idle) {
            Current::Idle => {}
            Current::Resolving { task, .. } => {
                task.abort();
                self.pacer.stop();
            }
            Current::Playing { pipeline, .. } => {
                self.pacer.stop();
                pipeline.stop(self.deps.config.stop_grace()).await;
            }
        }
    }

    fn ensure_voice(&mut self) {
        if self.voice.is_some() {
            return;
        }
        let config = &self.deps.config;
        self.voice = Some(VoiceSession::spawn(
            self.destination,
            config.credentials(),
            self.deps.gateway.clone(),
            config.session_settings(),
            self.link.clone(),
        ));
    }

    fn arm_idle(&mut self, after: Duration) {
        self.idle_deadline = Some(Instant::now() + after);
    }

    fn status(&self) -> SessionStatus {
        let (state, title, position, duration) = match &self.current {
            Current::Idle => (PlayerState::Idle, None, None, None),
            Current::Resolving { .. } => (PlayerState::Loading, None, None, None),
            Current::Playing { stream, pipeline } => (
                if self.paused { PlayerState::Paused } else { PlayerState::Playing },
                Some(stream.title().to_string()),
                Some(pipeline.position()),
                stream.duration(),
            ),
        };

        SessionStatus {
            destination: self.destination,
            current_track: self.queue.current().cloned(),
            title,
            queue_length: self.queue.upcoming_len(),
            state,
            voice: self.voice.as_ref().map(VoiceHandle::state),
            loop_mode: self.queue.loop_mode(),
            volume: self.volume.get(),
            position,
            duration,
            pacer: self.pacer.stats(),
        }
    }

    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }

    async fn finish(mut self, reason: TerminationReason, reply: Option<Reply<()>>) {
        self.release_current().await;
        self.queue.clear();

        if let Some(voice) = self.voice.take() {
            voice.leave(self.deps.config.stop_grace()).await;
        }
        self.link.send_replace(Link::Closed);

        let Self {
            id,
            destination,
            sessions,
            events,
            pacer,
            ..
        } = self;
        pacer.shutdown().await;
        sessions.remove_if(&destination, |_, h| h.id == id);

        info!("👋 Sesión {} terminada ({:?})", destination, reason);
        let _ = events.send(PlaybackEvent::SessionTerminated { destination, reason });
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
    }
}

async fn resolving(current: &mut Current) -> (u64, Result<StreamHandle, ResolutionError>) {
    match current {
        Current::Resolving { generation, task } => {
            let result = task
                .await
                .unwrap_or_else(|e| Err(ResolutionError::NetworkFailure(format!("resolver task failed: {}", e))));
            (*generation, result)
        }
        _ => std::future::pending().await,
    }
}

async fn voice_changed(voice: Option<&mut VoiceHandle>) -> Option<VoiceState> {
    match voice {
        Some(voice) => voice.changed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGateway, FakeResolver, FakeTranscoder};
    use pretty_assertions::assert_eq;

    const DEST: Destination = Destination(1);

    struct Rig {
        manager: PlaybackManager,
        resolver: Arc<FakeResolver>,
        transcoder: Arc<FakeTranscoder>,
        gateway: Arc<FakeGateway>,
        events: broadcast::Receiver<PlaybackEvent>,
    }

    fn rig_with(frames: usize, config: Config) -> Rig {
        let resolver = Arc::new(FakeResolver::default());
        let transcoder = Arc::new(FakeTranscoder::new(frames));
        let gateway = FakeGateway::auto();
        let manager = PlaybackManager::new(SessionDeps {
            config: Arc::new(config),
            resolver: resolver.clone(),
            transcoder: transcoder.clone(),
            gateway: gateway.clone(),
        });
        let events = manager.subscribe();
        Rig {
            manager,
            resolver,
            transcoder,
            gateway,
            events,
        }
    }

    fn rig(frames: usize) -> Rig {
        rig_with(frames, Config::default())
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<PlaybackEvent>,
        pred: impl Fn(&PlaybackEvent) -> bool,
    ) -> PlaybackEvent {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => {}
                    Err(e) => panic!("event stream broke: {}", e),
                }
            }
        })
        .await
        .expect("event never arrived")
    }

    fn started(event: &PlaybackEvent) -> bool {
        matches!(event, PlaybackEvent::TrackStarted { .. })
    }

    fn started_ref(event: &PlaybackEvent) -> String {
        match event {
            PlaybackEvent::TrackStarted { track, .. } => track.reference.clone(),
            other => panic!("not a start: {:?}", other),
        }
    }

    fn audio_payloads(gateway: &FakeGateway) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for sent in gateway.frames() {
            if sent.frame.is_silence() {
                continue;
            }
            let payload = String::from_utf8_lossy(&sent.frame.payload).to_string();
            if out.last() != Some(&payload) {
                out.push(payload);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_order_equals_enqueue_order() {
        let mut rig = rig(3);
        for (i, r) in ["a", "b", "c"].iter().enumerate() {
            let enqueued = rig.manager.enqueue(DEST, r, Some("tester")).await.unwrap();
            assert_eq!(enqueued.position, i);
        }

        wait_for(&mut rig.events, |e| matches!(e, PlaybackEvent::QueueFinished { .. })).await;
        assert_eq!(rig.resolver.calls(), vec!["a", "b", "c"]);
        assert_eq!(audio_payloads(&rig.gateway), vec!["a", "b", "c"]);

        let status = rig.manager.status(DEST).await.unwrap();
        assert_eq!(status.state, PlayerState::Idle);
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.voice, Some(VoiceState::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_moves_to_the_next_track_without_old_frames() {
        let mut rig = rig(3);
        rig.manager.enqueue(DEST, "endless-a", None).await.unwrap();
        rig.manager.enqueue(DEST, "b", None).await.unwrap();
        wait_for(&mut rig.events, started).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let skipped = rig.manager.skip(DEST).await.unwrap();
        assert_eq!(skipped.reference, "endless-a");
        let next = wait_for(&mut rig.events, started).await;
        assert_eq!(started_ref(&next), "b");

        wait_for(&mut rig.events, |e| matches!(e, PlaybackEvent::QueueFinished { .. })).await;
        assert_eq!(audio_payloads(&rig.gateway), vec!["endless-a", "b"]);
        assert_eq!(rig.manager.skip(DEST).await, Err(PlaybackError::NothingPlaying));
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_loop_resolves_again_each_time() {
        let mut rig = rig(2);
        rig.manager.enqueue(DEST, "song", None).await.unwrap();
        rig.manager.set_loop_mode(DEST, LoopMode::Track).await.unwrap();

        for _ in 0..4 {
            let event = wait_for(&mut rig.events, started).await;
            assert_eq!(started_ref(&event), "song");
        }
        // three completions, four resolutions
        assert_eq!(rig.resolver.count("song"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_loop_wraps_around() {
        let mut rig = rig(2);
        rig.manager.enqueue(DEST, "a", None).await.unwrap();
        rig.manager.enqueue(DEST, "b", None).await.unwrap();
        rig.manager.set_loop_mode(DEST, LoopMode::Queue).await.unwrap();

        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(started_ref(&wait_for(&mut rig.events, started).await));
        }
        assert_eq!(order, vec!["a", "b", "a", "b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tracks_are_reported_and_skipped() {
        let mut rig = rig(2);
        rig.manager.enqueue(DEST, "missing-1", None).await.unwrap();
        rig.manager.enqueue(DEST, "broken-2", None).await.unwrap();
        rig.manager.enqueue(DEST, "midfail-3", None).await.unwrap();
        rig.manager.enqueue(DEST, "ok", None).await.unwrap();

        let mut failed = Vec::new();
        for _ in 0..3 {
            match wait_for(&mut rig.events, |e| matches!(e, PlaybackEvent::TrackFailed { .. })).await {
                PlaybackEvent::TrackFailed { track, .. } => failed.push(track.reference),
                _ => unreachable!(),
            }
        }
        assert_eq!(failed, vec!["missing-1", "broken-2", "midfail-3"]);

        let next = wait_for(&mut rig.events, started).await;
        assert_eq!(started_ref(&next), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_stop_playback() {
        let config = Config {
            max_consecutive_failures: 2,
            ..Config::default()
        };
        let mut rig = rig_with(2, config);
        for r in ["missing-1", "missing-2", "never"] {
            rig.manager.enqueue(DEST, r, None).await.unwrap();
        }

        wait_for(&mut rig.events, |e| matches!(e, PlaybackEvent::QueueFinished { .. })).await;
        assert_eq!(rig.resolver.count("never"), 0);
        let status = rig.manager.status(DEST).await.unwrap();
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.current_track, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loss_keeps_the_cursor() {
        let mut rig = rig(3);
        rig.manager.enqueue(DEST, "endless-x", None).await.unwrap();
        rig.manager.enqueue(DEST, "y", None).await.unwrap();
        wait_for(&mut rig.events, started).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        rig.gateway.set_ack_heartbeats(false);
        wait_for(&mut rig.events, |e| {
            matches!(e, PlaybackEvent::VoiceState { state: VoiceState::Reconnecting, .. })
        })
        .await;
        rig.gateway.set_ack_heartbeats(true);
        wait_for(&mut rig.events, |e| {
            matches!(e, PlaybackEvent::VoiceState { state: VoiceState::Ready, .. })
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = rig.manager.status(DEST).await.unwrap();
        assert_eq!(status.current_track.map(|t| t.reference), Some("endless-x".to_string()));
        assert_eq!(status.queue_length, 1);
        assert_eq!(status.state, PlayerState::Playing);

        let frames = rig.gateway.frames();
        let last_epoch = frames.last().unwrap().epoch;
        let resumed: Vec<u16> = frames
            .iter()
            .filter(|f| f.epoch == last_epoch)
            .map(|f| f.frame.sequence)
            .collect();
        assert!(frames.first().unwrap().epoch < last_epoch);
        assert_eq!(resumed[0], 0);
        assert!(resumed.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_disconnect_tears_down_the_session() {
        let config = Config {
            reconnect_max_attempts: 2,
            reconnect_backoff_ms: 10,
            ..Config::default()
        };
        let mut rig = rig_with(3, config);
        rig.gateway.fail_next_connects(100);
        rig.manager.enqueue(DEST, "a", None).await.unwrap();

        let event = wait_for(&mut rig.events, |e| matches!(e, PlaybackEvent::SessionTerminated { .. })).await;
        assert_eq!(
            event,
            PlaybackEvent::SessionTerminated {
                destination: DEST,
                reason: TerminationReason::ConnectionLost,
            }
        );
        assert!(rig.manager.status(DEST).await.is_none());
        assert!(rig.manager.active_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_leaves_after_timeout() {
        let mut rig = rig(2);
        rig.manager.enqueue(DEST, "a", None).await.unwrap();
        wait_for(&mut rig.events, |e| matches!(e, PlaybackEvent::QueueFinished { .. })).await;
        let finished_at = Instant::now();

        let event = wait_for(&mut rig.events, |e| matches!(e, PlaybackEvent::SessionTerminated { .. })).await;
        assert!(matches!(
            event,
            PlaybackEvent::SessionTerminated {
                reason: TerminationReason::Idle,
                ..
            }
        ));
        assert!(finished_at.elapsed() >= Duration::from_secs(120));
        assert!(rig.manager.status(DEST).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_uses_the_short_idle_timeout() {
        let mut rig = rig(3);
        rig.manager.enqueue(DEST, "endless", None).await.unwrap();
        wait_for(&mut rig.events, started).await;

        rig.manager.stop(DEST).await.unwrap();
        let stopped_at = Instant::now();
        let status = rig.manager.status(DEST).await.unwrap();
        assert_eq!(status.state, PlayerState::Idle);

        wait_for(&mut rig.events, |e| matches!(e, PlaybackEvent::SessionTerminated { .. })).await;
        let waited = stopped_at.elapsed();
        assert!(waited >= Duration::from_secs(15) && waited < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_nothing_playing() {
        let mut rig = rig(3);
        assert_eq!(rig.manager.stop(DEST).await, Err(PlaybackError::NothingPlaying));

        rig.manager.join(DEST).await.unwrap();
        assert_eq!(rig.manager.stop(DEST).await, Err(PlaybackError::NothingPlaying));

        rig.manager.enqueue(DEST, "endless", None).await.unwrap();
        wait_for(&mut rig.events, started).await;
        rig.manager.stop(DEST).await.unwrap();
        assert_eq!(rig.manager.stop(DEST).await, Err(PlaybackError::NothingPlaying));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_cancels_idle_timer() {
        let mut rig = rig(2);
        rig.manager.enqueue(DEST, "a", None).await.unwrap();
        wait_for(&mut rig.events, |e| matches!(e, PlaybackEvent::QueueFinished { .. })).await;

        tokio::time::sleep(Duration::from_secs(100)).await;
        rig.manager.enqueue(DEST, "endless", None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rig.manager.status(DEST).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let mut rig = rig(3);
        rig.manager.enqueue(DEST, "endless", None).await.unwrap();
        wait_for(&mut rig.events, started).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        rig.manager.pause(DEST).await.unwrap();
        let status = rig.manager.status(DEST).await.unwrap();
        assert_eq!(status.state, PlayerState::Paused);
        let held = status.position;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rig.manager.status(DEST).await.unwrap().position, held);

        rig.manager.resume(DEST).await.unwrap();
        assert_eq!(rig.manager.resume(DEST).await, Err(PlaybackError::NothingPaused));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = rig.manager.status(DEST).await.unwrap();
        assert_eq!(status.state, PlayerState::Playing);
        assert!(status.position > held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_restarts_at_offset() {
        let mut rig = rig(3);
        rig.manager.enqueue(DEST, "endless", None).await.unwrap();
        wait_for(&mut rig.events, started).await;

        rig.manager.seek(DEST, Duration::from_secs(30)).await.unwrap();
        assert_eq!(
            rig.transcoder.starts().last(),
            Some(&("endless".to_string(), Duration::from_secs(30)))
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        let position = rig.manager.status(DEST).await.unwrap().position.unwrap();
        assert!(position > Duration::from_secs(30));
        assert!(position < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_on_live_stream_is_rejected() {
        let mut rig = rig(10_000);
        rig.manager.enqueue(DEST, "live-radio", None).await.unwrap();
        wait_for(&mut rig.events, started).await;
        assert_eq!(
            rig.manager.seek(DEST, Duration::from_secs(5)).await,
            Err(PlaybackError::SeekUnsupported)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_limit_and_validation() {
        let config = Config {
            max_queue_size: 2,
            ..Config::default()
        };
        let rig = rig_with(3, config);
        rig.manager.enqueue(DEST, "endless-1", None).await.unwrap();
        rig.manager.enqueue(DEST, "endless-2", None).await.unwrap();
        assert_eq!(
            rig.manager.enqueue(DEST, "endless-3", None).await,
            Err(PlaybackError::QueueFull(2))
        );
        assert!(matches!(
            rig.manager.enqueue(DEST, "   ", None).await,
            Err(PlaybackError::InvalidReference(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_is_clamped() {
        let rig = rig(3);
        rig.manager.join(DEST).await.unwrap();
        assert_eq!(rig.manager.set_volume(DEST, 5.0).await, Ok(2.0));
        assert_eq!(rig.manager.status(DEST).await.unwrap().volume, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_without_session() {
        let rig = rig(3);
        assert_eq!(rig.manager.pause(DEST).await, Err(PlaybackError::NothingPlaying));
        assert_eq!(rig.manager.resume(DEST).await, Err(PlaybackError::NothingPaused));
        assert_eq!(rig.manager.leave(DEST).await, Ok(()));
        assert!(rig.manager.status(DEST).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destinations_are_independent() {
        let mut rig = rig(2);
        rig.manager.enqueue(Destination(1), "a", None).await.unwrap();
        rig.manager.enqueue(Destination(2), "endless", None).await.unwrap();

        let finished = wait_for(&mut rig.events, |e| matches!(e, PlaybackEvent::QueueFinished { .. })).await;
        assert_eq!(finished, PlaybackEvent::QueueFinished { destination: Destination(1) });
        let other = rig.manager.status(Destination(2)).await.unwrap();
        assert_ne!(other.state, PlayerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_and_shutdown() {
        let mut rig = rig(3);
        rig.manager.enqueue(Destination(1), "endless", None).await.unwrap();
        rig.manager.join(Destination(2)).await.unwrap();

        rig.manager.leave(Destination(1)).await.unwrap();
        let event = wait_for(&mut rig.events, |e| matches!(e, PlaybackEvent::SessionTerminated { .. })).await;
        assert!(matches!(
            event,
            PlaybackEvent::SessionTerminated {
                reason: TerminationReason::Left,
                ..
            }
        ));
        assert_eq!(rig.manager.active_sessions(), vec![Destination(2)]);

        rig.manager.shutdown().await;
        assert!(rig.manager.active_sessions().is_empty());
        assert_eq!(
            rig.manager.enqueue(Destination(3), "a", None).await,
            Err(PlaybackError::SessionClosed)
        );
    }
}
