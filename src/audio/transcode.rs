use async_trait::async_trait;
use audiopus::{coder::Encoder, Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use std::{
    future::Future,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, ChildStdout, Command},
    sync::watch,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AudioFormat, SharedVolume, FRAME_DURATION, MAX_PACKET_SIZE};
use crate::{error::TranscodeError, sources::StreamHandle};

/// Bytes of ffmpeg stderr kept for error reports.
const STDERR_TAIL: usize = 2048;

/// Turns a resolved stream into a feed of Opus frames.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn start(
        &self,
        handle: &StreamHandle,
        offset: Duration,
        volume: SharedVolume,
    ) -> Result<Pipeline, TranscodeError>;
}

/// What the pipeline hands to the pacer.
#[derive(Debug)]
pub enum FeedItem {
    /// One 20ms Opus packet.
    Frame(Bytes),
    /// Clean end of stream.
    End,
    /// The stream died mid-way.
    Failed(TranscodeError),
}

/// Result of [`TrackFeed::try_next`].
#[derive(Debug)]
pub enum FeedPoll {
    Ready(FeedItem),
    Empty,
    /// The producer is gone and everything it sent was drained.
    Closed,
}

/// Pacer side of a running pipeline.
#[derive(Debug, Clone)]
pub struct TrackFeed {
    rx: flume::Receiver<FeedItem>,
    played: Arc<AtomicU64>,
}

impl TrackFeed {
    /// A bare feed and its sending side.
    pub fn channel(capacity: usize) -> (flume::Sender<FeedItem>, TrackFeed) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (
            tx,
            TrackFeed {
                rx,
                played: Arc::new(AtomicU64::new(0)),
            },
        )
    }

    /// Next item, or `None` if the producer vanished without a final item.
    pub async fn next(&self) -> Option<FeedItem> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking variant of [`TrackFeed::next`].
    pub fn try_next(&self) -> FeedPoll {
        match self.rx.try_recv() {
            Ok(item) => FeedPoll::Ready(item),
            Err(flume::TryRecvError::Empty) => FeedPoll::Empty,
            Err(flume::TryRecvError::Disconnected) => FeedPoll::Closed,
        }
    }

    /// Called by the pacer for every real frame that reached the network.
    pub fn mark_played(&self) {
        self.played.fetch_add(1, Ordering::Relaxed);
    }
}

/// Producer end handed to whatever generates frames.
pub struct Producer {
    tx: flume::Sender<FeedItem>,
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
}

impl Producer {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Blocks while paused; `false` if cancelled meanwhile.
    pub async fn wait_unpaused(&mut self) -> bool {
        while *self.paused.borrow_and_update() {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
        !self.cancel.is_cancelled()
    }

    /// Sends one item, waiting for room in the feed. `false` means stop producing.
    pub async fn emit(&mut self, item: FeedItem) -> bool {
        if !self.wait_unpaused().await {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send_async(item) => sent.is_ok(),
        }
    }
}

/// Worker side of a running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    task: JoinHandle<()>,
    offset: Duration,
    played: Arc<AtomicU64>,
}

impl PipelineHandle {
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Start offset plus what the pacer has actually sent.
    pub fn position(&self) -> Duration {
        let played = u32::try_from(self.played.load(Ordering::Relaxed)).unwrap_or(u32::MAX);
        self.offset.saturating_add(FRAME_DURATION.saturating_mul(played))
    }

    /// Cancels production and waits (bounded) for the producer to release its resources.
    pub async fn stop(self, grace: Duration) {
        self.cancel.cancel();
        let mut task = self.task;
        // the producer itself spends up to `grace` closing the child
        if tokio::time::timeout(grace * 2, &mut task).await.is_err() {
            warn!("⏰ El pipeline no terminó a tiempo, abortando");
            task.abort();
        }
    }
}

/// A started transcode: frames for the pacer, controls for the worker.
#[derive(Debug)]
pub struct Pipeline {
    pub feed: TrackFeed,
    pub handle: PipelineHandle,
}

impl Pipeline {
    /// Runs `producer` on its own task behind a feed of `capacity` items.
    pub fn spawn<F, Fut>(offset: Duration, capacity: usize, producer: F) -> Self
    where
        F: FnOnce(Producer) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, feed) = TrackFeed::channel(capacity);
        let cancel = CancellationToken::new();
        let (paused_tx, paused_rx) = watch::channel(false);
        let played = feed.played.clone();

        let task = tokio::spawn(producer(Producer {
            tx,
            cancel: cancel.clone(),
            paused: paused_rx,
        }));

        Self {
            feed,
            handle: PipelineHandle {
                cancel,
                paused: paused_tx,
                task,
                offset,
                played,
            },
        }
    }
}

/// Settings for the ffmpeg + libopus pipeline.
#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    pub program: String,
    pub format: AudioFormat,
    pub bitrate: i32,
    pub feed_capacity: usize,
    pub stop_grace: Duration,
}

/// Production [`Transcoder`]: ffmpeg decodes to PCM, libopus encodes.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    config: FfmpegConfig,
}

impl FfmpegTranscoder {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    pub fn args(&self, handle: &StreamHandle, offset: Duration) -> Vec<String> {
        let mut args: Vec<String> = ["-nostdin", "-hide_banner", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if handle.is_remote() {
            args.extend(
                ["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }

        if !offset.is_zero() {
            args.push("-ss".to_string());
            args.push(format!("{:.3}", offset.as_secs_f64()));
        }

        args.extend([
            "-i".to_string(),
            handle.input().to_string(),
            "-vn".to_string(),
            "-f".to_string(),
            "s16le".to_string(),
            "-ar".to_string(),
            self.config.format.sample_rate.to_string(),
            "-ac".to_string(),
            self.config.format.channels.to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(
        &self,
        handle: &StreamHandle,
        offset: Duration,
        volume: SharedVolume,
    ) -> Result<Pipeline, TranscodeError> {
        if !offset.is_zero() && !handle.is_seekable() {
            return Err(TranscodeError::SeekUnsupported);
        }

        let encoder = OpusEncoder::new(self.config.format, self.config.bitrate)?;
        let process = FfmpegProcess::spawn(&self.config.program, self.args(handle, offset))?;
        info!("🎵 Transcodificando: {} (desde {:?})", handle.title(), offset);

        let format = self.config.format;
        let grace = self.config.stop_grace;
        Ok(Pipeline::spawn(offset, self.config.feed_capacity, move |producer| {
            pump(process, encoder, format, volume, producer, grace)
        }))
    }
}

/// Reads PCM frames from ffmpeg, encodes them and feeds the pacer.
async fn pump(
    mut process: FfmpegProcess,
    mut encoder: OpusEncoder,
    format: AudioFormat,
    volume: SharedVolume,
    mut producer: Producer,
    grace: Duration,
) {
    let Some(mut stdout) = process.take_stdout() else {
        producer
            .emit(FeedItem::Failed(TranscodeError::Encoder("ffmpeg stdout unavailable".into())))
            .await;
        process.close(grace).await;
        return;
    };

    let mut pcm = vec![0u8; format.frame_bytes()];
    let mut samples = vec![0i16; format.interleaved_samples()];
    let mut frames = 0u64;

    loop {
        if !producer.wait_unpaused().await {
            break;
        }

        let read = tokio::select! {
            _ = producer.cancelled() => break,
            read = read_frame(&mut stdout, &mut pcm) => read,
        };

        let filled = match read {
            Ok(n) => n,
            Err(e) => {
                error!("❌ Error leyendo de ffmpeg: {}", e);
                producer.emit(FeedItem::Failed(TranscodeError::Io(e))).await;
                break;
            }
        };

        if filled == 0 {
            drop(stdout);
            let item = match process.finish(grace).await {
                Ok(()) => {
                    debug!("Fin de stream tras {} frames", frames);
                    FeedItem::End
                }
                Err(e) => {
                    warn!("⚠️ ffmpeg terminó con error: {}", e);
                    FeedItem::Failed(e)
                }
            };
            producer.emit(item).await;
            return;
        }

        // last partial frame
        pcm[filled..].fill(0);
        pcm_to_samples(&pcm, volume.get(), &mut samples);

        let item = match encoder.encode(&samples) {
            Ok(packet) => FeedItem::Frame(packet),
            Err(e) => {
                producer.emit(FeedItem::Failed(e)).await;
                break;
            }
        };

        frames += 1;
        if !producer.emit(item).await {
            break;
        }
    }

    drop(stdout);
    process.close(grace).await;
}

/// Fills `buf` completely unless EOF comes first; returns bytes read.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// s16le bytes to samples, scaled by `volume` with saturation.
pub fn pcm_to_samples(pcm: &[u8], volume: f32, out: &mut [i16]) {
    let unity = (volume - 1.0).abs() < f32::EPSILON;
    for (sample, bytes) in out.iter_mut().zip(pcm.chunks_exact(2)) {
        let raw = i16::from_le_bytes([bytes[0], bytes[1]]);
        *sample = if unity {
            raw
        } else {
            (raw as f32 * volume).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
        };
    }
}

/// libopus encoder sized for 20ms frames.
pub struct OpusEncoder {
    encoder: Encoder,
    output: Vec<u8>,
}

impl OpusEncoder {
    pub fn new(format: AudioFormat, bitrate: i32) -> Result<Self, TranscodeError> {
        let rate = match format.sample_rate {
            8_000 => SampleRate::Hz8000,
            12_000 => SampleRate::Hz12000,
            16_000 => SampleRate::Hz16000,
            24_000 => SampleRate::Hz24000,
            48_000 => SampleRate::Hz48000,
            other => return Err(TranscodeError::Encoder(format!("unsupported sample rate {}", other))),
        };
        let channels = match format.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => return Err(TranscodeError::Encoder(format!("unsupported channel count {}", other))),
        };

        let mut encoder =
            Encoder::new(rate, channels, Application::Audio).map_err(|e| TranscodeError::Encoder(e.to_string()))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(bitrate))
            .map_err(|e| TranscodeError::Encoder(e.to_string()))?;

        Ok(Self {
            encoder,
            output: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    pub fn encode(&mut self, samples: &[i16]) -> Result<Bytes, TranscodeError> {
        let len = self
            .encoder
            .encode(samples, &mut self.output)
            .map_err(|e| TranscodeError::Encoder(e.to_string()))?;
        Ok(Bytes::copy_from_slice(&self.output[..len]))
    }
}

/// Owned ffmpeg child. Callers end it with [`FfmpegProcess::finish`] or
/// [`FfmpegProcess::close`]; `kill_on_drop` covers every other exit path.
pub struct FfmpegProcess {
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl FfmpegProcess {
    pub fn spawn(program: &str, args: Vec<String>) -> Result<Self, TranscodeError> {
        debug!("Lanzando {} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                let start = buf.len().saturating_sub(STDERR_TAIL);
                String::from_utf8_lossy(&buf[start..]).trim().to_string()
            })
        });

        Ok(Self { child, stderr })
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Waits for a natural exit after EOF and maps the status.
    pub async fn finish(mut self, grace: Duration) -> Result<(), TranscodeError> {
        let status = self.wait_or_kill(grace).await?;
        if status.success() {
            return Ok(());
        }
        let stderr = self.stderr_tail().await;
        Err(TranscodeError::Failure {
            status: status.to_string(),
            stderr,
        })
    }

    /// Waits up to `grace` for the child to exit, then kills it.
    pub async fn close(mut self, grace: Duration) {
        match self.wait_or_kill(grace).await {
            Ok(status) => debug!("ffmpeg cerrado ({})", status),
            Err(e) => warn!("⚠️ No se pudo cerrar ffmpeg: {}", e),
        }
        if let Some(task) = self.stderr.take() {
            task.abort();
        }
    }

    async fn wait_or_kill(&mut self, grace: Duration) -> Result<ExitStatus, TranscodeError> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!("⏰ ffmpeg no salió en {:?}, forzando terminación", grace);
                self.child.start_kill()?;
                Ok(self.child.wait().await?)
            }
        }
    }

    async fn stderr_tail(&mut self) -> String {
        match self.stderr.take() {
            Some(task) => tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default(),
            None => String::new(),
        }
    }
}
