//! In-process fakes for the resolver, transcoder and gateway.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    audio::{
        transcode::{FeedItem, Pipeline, Transcoder},
        OpusFrame, SharedVolume,
    },
    error::{ConnectionError, ResolutionError, TranscodeError},
    sources::{SourceKind, SourceResolver, StreamHandle},
    voice::{
        ConnectionInfo, ControlChannel, ControlMessage, Credentials, Destination, FrameSink, Gateway, Link,
        SessionKey,
    },
};

pub fn up_link(epoch: u64) -> Link {
    Link::Up(Arc::new(ConnectionInfo {
        epoch,
        destination: Destination(1),
        session_id: format!("s{}", epoch),
        ssrc: 1,
        media_addr: "127.0.0.1:9".parse().unwrap(),
        key: SessionKey([7u8; 32]),
    }))
}

#[derive(Debug, Clone)]
pub struct SentFrame {
    pub epoch: u64,
    pub frame: OpusFrame,
    pub at: Instant,
}

/// Server half of one fake control connection.
pub struct ServerEnd {
    pub rx: mpsc::UnboundedReceiver<ControlMessage>,
    pub tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ServerEnd {
    pub async fn expect(&mut self) -> ControlMessage {
        self.rx.recv().await.expect("client hung up")
    }

    pub fn send(&self, message: ControlMessage) {
        let _ = self.tx.send(message);
    }

    pub fn ready(&self, session_id: &str) {
        self.send(ControlMessage::Ready {
            session_id: session_id.to_string(),
            ssrc: 1,
            media_addr: "127.0.0.1:9".parse().unwrap(),
            secret_key: BASE64.encode([7u8; 32]),
        });
    }
}

struct FakeControl {
    to_server: Option<mpsc::UnboundedSender<ControlMessage>>,
    from_server: mpsc::UnboundedReceiver<ControlMessage>,
}

#[async_trait]
impl ControlChannel for FakeControl {
    async fn send(&mut self, message: ControlMessage) -> Result<(), ConnectionError> {
        self.to_server
            .as_ref()
            .and_then(|tx| tx.send(message).ok())
            .ok_or_else(|| ConnectionError::Transport("fake server gone".into()))
    }

    async fn recv(&mut self) -> Result<Option<ControlMessage>, ConnectionError> {
        Ok(self.from_server.recv().await)
    }

    async fn close(&mut self) {
        self.to_server = None;
    }
}

struct RecordingSink {
    epoch: u64,
    frames: Arc<Mutex<Vec<SentFrame>>>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_frame(&mut self, frame: &OpusFrame) -> Result<(), ConnectionError> {
        self.frames.lock().push(SentFrame {
            epoch: self.epoch,
            frame: frame.clone(),
            at: Instant::now(),
        });
        Ok(())
    }
}

/// Gateway whose connections are driven by the test.
pub struct FakeGateway {
    accepts: mpsc::UnboundedSender<ServerEnd>,
    fail_connects: AtomicU32,
    attempts: AtomicU32,
    ack_heartbeats: AtomicBool,
    frames: Arc<Mutex<Vec<SentFrame>>>,
}

impl FakeGateway {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepts, accepts_rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(Self {
            accepts,
            fail_connects: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            ack_heartbeats: AtomicBool::new(true),
            frames: Arc::new(Mutex::new(Vec::new())),
        });
        (gateway, accepts_rx)
    }

    /// A gateway that accepts every handshake and acks heartbeats while
    /// [`FakeGateway::set_ack_heartbeats`] allows it.
    pub fn auto() -> Arc<Self> {
        let (gateway, mut accepts) = Self::new();
        let weak = Arc::downgrade(&gateway);
        tokio::spawn(async move {
            let mut sessions = 0u32;
            while let Some(server) = accepts.recv().await {
                sessions += 1;
                tokio::spawn(serve(server, weak.clone(), sessions));
            }
        });
        gateway
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_ack_heartbeats(&self, ack: bool) {
        self.ack_heartbeats.store(ack, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<SentFrame> {
        self.frames.lock().clone()
    }
}

async fn serve(mut server: ServerEnd, gateway: std::sync::Weak<FakeGateway>, n: u32) {
    while let Some(message) = server.rx.recv().await {
        match message {
            ControlMessage::Identify { .. } | ControlMessage::Resume { .. } => server.ready(&format!("auto-{}", n)),
            ControlMessage::Heartbeat { nonce } => {
                let ack = gateway
                    .upgrade()
                    .is_some_and(|g| g.ack_heartbeats.load(Ordering::SeqCst));
                if ack {
                    server.send(ControlMessage::HeartbeatAck { nonce });
                }
            }
            ControlMessage::Close { .. } => return,
            _ => {}
        }
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn open_control(&self, _credentials: &Credentials) -> Result<Box<dyn ControlChannel>, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ConnectionError::Transport("connection refused".into()));
        }

        let (to_server, server_rx) = mpsc::unbounded_channel();
        let (server_tx, from_server) = mpsc::unbounded_channel();
        self.accepts
            .send(ServerEnd {
                rx: server_rx,
                tx: server_tx,
            })
            .map_err(|_| ConnectionError::Transport("no fake server".into()))?;

        Ok(Box::new(FakeControl {
            to_server: Some(to_server),
            from_server,
        }))
    }

    async fn open_media(&self, connection: &ConnectionInfo) -> Result<Box<dyn FrameSink>, ConnectionError> {
        Ok(Box::new(RecordingSink {
            epoch: connection.epoch,
            frames: self.frames.clone(),
        }))
    }
}

/// Resolves everything except references starting with `missing`.
#[derive(Default)]
pub struct FakeResolver {
    calls: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, reference: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == reference).count()
    }
}

#[async_trait]
impl SourceResolver for FakeResolver {
    async fn resolve(&self, reference: &str) -> Result<StreamHandle, ResolutionError> {
        self.calls.lock().push(reference.to_string());
        if reference.starts_with("missing") {
            return Err(ResolutionError::NotFound(reference.to_string()));
        }
        Ok(StreamHandle::new(reference, reference, SourceKind::Direct).with_seekable(!reference.starts_with("live")))
    }
}

/// Emits `frames` frames whose payload is the stream input, then `End`.
///
/// Inputs starting with `broken` fail to start, `midfail` fails after its
/// frames, `endless` never ends.
pub struct FakeTranscoder {
    frames: usize,
    starts: Mutex<Vec<(String, Duration)>>,
}

impl FakeTranscoder {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            starts: Mutex::new(Vec::new()),
        }
    }

    pub fn starts(&self) -> Vec<(String, Duration)> {
        self.starts.lock().clone()
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn start(
        &self,
        handle: &StreamHandle,
        offset: Duration,
        _volume: SharedVolume,
    ) -> Result<Pipeline, TranscodeError> {
        if !offset.is_zero() && !handle.is_seekable() {
            return Err(TranscodeError::SeekUnsupported);
        }
        let input = handle.input().to_string();
        self.starts.lock().push((input.clone(), offset));

        if input.starts_with("broken") {
            return Err(TranscodeError::Failure {
                status: "exit status: 1".into(),
                stderr: "invalid data".into(),
            });
        }

        let frames = if input.starts_with("endless") { usize::MAX } else { self.frames };
        Ok(Pipeline::spawn(offset, 5, move |mut producer| async move {
            let payload = Bytes::from(input.clone().into_bytes());
            for _ in 0..frames {
                if !producer.emit(FeedItem::Frame(payload.clone())).await {
                    return;
                }
            }
            let last = if input.starts_with("midfail") {
                FeedItem::Failed(TranscodeError::Failure {
                    status: "exit status: 1".into(),
                    stderr: "connection reset".into(),
                })
            } else {
                FeedItem::End
            };
            producer.emit(last).await;
        }))
    }
}
