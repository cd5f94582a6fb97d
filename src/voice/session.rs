use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    CloseReason, ConnectionInfo, ControlChannel, ControlMessage, Credentials, Destination, Gateway, Link,
    RetryBudget, SessionKey, VoiceState,
};
use crate::{error::ConnectionError, sleep_until_opt};

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Timing knobs for one voice session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub budget: RetryBudget,
}

/// How one connection attempt ended.
enum SessionEnd {
    /// Leave was requested.
    Leave,
    /// The connection had reached Ready and was then lost.
    Lost(ConnectionError),
}

/// State machine owning the connection to the playback endpoint.
///
/// Runs as its own task. The caller observes state through [`VoiceHandle`];
/// the pacer observes usable connections through the shared [`Link`] watch.
pub struct VoiceSession {
    destination: Destination,
    credentials: Credentials,
    gateway: Arc<dyn Gateway>,
    settings: SessionSettings,
    state_tx: watch::Sender<VoiceState>,
    link_tx: Arc<watch::Sender<Link>>,
    leave: CancellationToken,
    session_id: Option<String>,
    nonce: u64,
}

/// Caller side of a running [`VoiceSession`].
pub struct VoiceHandle {
    state: watch::Receiver<VoiceState>,
    leave: CancellationToken,
    task: JoinHandle<()>,
}

impl VoiceSession {
    /// Starts connecting right away (`Disconnected -> Connecting`).
    pub fn spawn(
        destination: Destination,
        credentials: Credentials,
        gateway: Arc<dyn Gateway>,
        settings: SessionSettings,
        link_tx: Arc<watch::Sender<Link>>,
    ) -> VoiceHandle {
        let (state_tx, state_rx) = watch::channel(VoiceState::Disconnected);
        let leave = CancellationToken::new();

        let session = Self {
            destination,
            credentials,
            gateway,
            settings,
            state_tx,
            link_tx,
            leave: leave.clone(),
            session_id: None,
            nonce: 0,
        };

        let task = tokio::spawn(session.run());

        VoiceHandle {
            state: state_rx,
            leave,
            task,
        }
    }

    async fn run(mut self) {
        info!("🔌 Conectando voz para destino {}", self.destination);
        self.link_tx.send_replace(Link::Down);
        self.transition(VoiceState::Connecting);

        let budget = self.settings.budget;
        let mut attempts = 0u32;
        let mut window_start: Option<Instant> = None;

        let reason = loop {
            let err = match self.connect_once().await {
                Ok(SessionEnd::Leave) => break CloseReason::Left,
                Ok(SessionEnd::Lost(err)) => {
                    // the connection was healthy, so the budget starts over
                    attempts = 0;
                    window_start = None;
                    err
                }
                Err(err) => err,
            };

            self.link_tx.send_replace(Link::Down);
            self.transition(VoiceState::Reconnecting);

            let started = *window_start.get_or_insert_with(Instant::now);
            attempts += 1;
            if attempts > budget.max_attempts || started.elapsed() > budget.window {
                error!(
                    "❌ Voz {}: presupuesto de reconexión agotado tras {} intentos: {}",
                    self.destination,
                    attempts - 1,
                    err
                );
                break CloseReason::RetryBudgetExhausted;
            }

            let delay = budget.backoff(attempts);
            warn!(
                "🔄 Voz {}: {} - reintento {}/{} en {:?}",
                self.destination, err, attempts, budget.max_attempts, delay
            );

            tokio::select! {
                _ = self.leave.cancelled() => break CloseReason::Left,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.link_tx.send_replace(Link::Closed);
        self.transition(VoiceState::Closed(reason));
        info!("🔌 Voz {} cerrada ({:?})", self.destination, reason);
    }

    /// One handshake plus, if it succeeds, the heartbeat loop.
    async fn connect_once(&mut self) -> Result<SessionEnd, ConnectionError> {
        let timeout = self.settings.connect_timeout;

        let opened = tokio::select! {
            _ = self.leave.cancelled() => return Ok(SessionEnd::Leave),
            opened = tokio::time::timeout(timeout, self.gateway.open_control(&self.credentials)) => opened,
        };
        let mut control = opened.map_err(|_| ConnectionError::Timeout("connect"))??;

        if *self.state_tx.borrow() == VoiceState::Connecting {
            self.transition(VoiceState::Authenticating);
        }

        let hello = match &self.session_id {
            Some(session_id) => ControlMessage::Resume {
                destination: self.destination.0,
                token: self.credentials.token.clone(),
                session_id: session_id.clone(),
            },
            None => ControlMessage::Identify {
                destination: self.destination.0,
                token: self.credentials.token.clone(),
            },
        };
        control.send(hello).await?;

        let ready = tokio::select! {
            _ = self.leave.cancelled() => {
                control.close().await;
                return Ok(SessionEnd::Leave);
            }
            ready = tokio::time::timeout(timeout, wait_ready(control.as_mut())) => ready,
        };

        let info = match ready {
            Ok(Ok(info)) => info,
            Ok(Err(err)) => {
                if matches!(err, ConnectionError::Rejected(_)) && self.session_id.take().is_some() {
                    debug!("Resume rechazado, el próximo intento hará identify");
                }
                control.close().await;
                return Err(err);
            }
            Err(_) => {
                control.close().await;
                return Err(ConnectionError::Timeout("handshake"));
            }
        };

        let info = self.connection_info(info)?;
        self.session_id = Some(info.session_id.clone());
        info!(
            "✅ Voz {} lista (session {}, ssrc {}, epoch {})",
            self.destination, info.session_id, info.ssrc, info.epoch
        );

        self.transition(VoiceState::Ready);
        self.link_tx.send_replace(Link::Up(Arc::new(info)));

        self.heartbeat_loop(control).await
    }

    async fn heartbeat_loop(&mut self, mut control: Box<dyn ControlChannel>) -> Result<SessionEnd, ConnectionError> {
        let timeout = self.settings.heartbeat_timeout;
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut ack_deadline: Option<Instant> = None;
        let mut last_acked = self.nonce;
        let mut sent_at = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = self.leave.cancelled() => {
                    let _ = control
                        .send(ControlMessage::Close { code: 1000, reason: "leave".to_string() })
                        .await;
                    control.close().await;
                    return Ok(SessionEnd::Leave);
                }

                _ = sleep_until_opt(ack_deadline) => {
                    warn!("💔 Voz {}: heartbeat sin respuesta en {:?}", self.destination, timeout);
                    control.close().await;
                    return Ok(SessionEnd::Lost(ConnectionError::HeartbeatTimeout(timeout)));
                }

                _ = ticker.tick() => {
                    self.nonce += 1;
                    if let Err(e) = control.send(ControlMessage::Heartbeat { nonce: self.nonce }).await {
                        control.close().await;
                        return Ok(SessionEnd::Lost(e));
                    }
                    if ack_deadline.is_none() {
                        sent_at = Instant::now();
                        ack_deadline = Some(sent_at + timeout);
                    }
                }

                message = control.recv() => match message {
                    Ok(Some(ControlMessage::HeartbeatAck { nonce })) => {
                        if nonce > last_acked && nonce <= self.nonce {
                            last_acked = nonce;
                            ack_deadline = None;
                            trace!("💓 Voz {}: ack {} en {:?}", self.destination, nonce, sent_at.elapsed());
                        }
                    }
                    Ok(Some(ControlMessage::Close { code, reason })) => {
                        control.close().await;
                        return Ok(SessionEnd::Lost(ConnectionError::RemoteClosed { code, reason }));
                    }
                    Ok(Some(other)) => debug!("Mensaje de control ignorado: {:?}", other),
                    Ok(None) => {
                        return Ok(SessionEnd::Lost(ConnectionError::Transport(
                            "control channel closed".to_string(),
                        )));
                    }
                    Err(e) => {
                        control.close().await;
                        return Ok(SessionEnd::Lost(e));
                    }
                },
            }
        }
    }

    fn connection_info(&self, ready: ReadyPayload) -> Result<ConnectionInfo, ConnectionError> {
        let bytes = BASE64
            .decode(ready.secret_key.as_bytes())
            .map_err(|e| ConnectionError::Protocol(format!("bad secret key: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| ConnectionError::Protocol(format!("secret key is {} bytes, expected 32", b.len())))?;

        Ok(ConnectionInfo {
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
            destination: self.destination,
            session_id: ready.session_id,
            ssrc: ready.ssrc,
            media_addr: ready.media_addr,
            key: SessionKey(key),
        })
    }

    fn transition(&self, next: VoiceState) {
        let current = *self.state_tx.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!("Transición de voz inválida {} -> {} ignorada", current, next);
            return;
        }
        debug!("🔀 Voz {}: {} -> {}", self.destination, current, next);
        self.state_tx.send_replace(next);
    }
}

struct ReadyPayload {
    session_id: String,
    ssrc: u32,
    media_addr: std::net::SocketAddr,
    secret_key: String,
}

async fn wait_ready(control: &mut dyn ControlChannel) -> Result<ReadyPayload, ConnectionError> {
    loop {
        match control.recv().await? {
            Some(ControlMessage::Ready {
                session_id,
                ssrc,
                media_addr,
                secret_key,
            }) => {
                return Ok(ReadyPayload {
                    session_id,
                    ssrc,
                    media_addr,
                    secret_key,
                })
            }
            Some(ControlMessage::Rejected { reason }) => return Err(ConnectionError::Rejected(reason)),
            Some(ControlMessage::Close { code, reason }) => {
                return Err(ConnectionError::RemoteClosed { code, reason })
            }
            Some(other) => debug!("Mensaje inesperado durante handshake: {:?}", other),
            None => {
                return Err(ConnectionError::Transport(
                    "control channel closed during handshake".to_string(),
                ))
            }
        }
    }
}

impl VoiceHandle {
    pub fn state(&self) -> VoiceState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<VoiceState> {
        self.state.clone()
    }

    /// Next state change; `None` once the session task is gone.
    pub async fn changed(&mut self) -> Option<VoiceState> {
        self.state.changed().await.ok()?;
        Some(*self.state.borrow_and_update())
    }

    /// Requests leave and waits up to `grace` for the task to release the transport.
    pub async fn leave(self, grace: Duration) {
        self.leave.cancel();
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!("⏰ La sesión de voz no cerró a tiempo, abortando");
            task.abort();
        }
    }
}
