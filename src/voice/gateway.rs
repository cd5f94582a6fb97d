//! TCP/UDP transport for the playback gateway.
//!
//! Control: newline-delimited JSON [`ControlMessage`]s over TCP.
//! Media: one UDP datagram per frame: a 12-byte header, the 12-byte nonce,
//! then the AES-256-GCM sealed Opus payload. The header is associated data,
//! so it is authenticated but readable.
//!
//! Sequence and timestamp restart at zero on every connection while a
//! resumed session may keep its key, so the nonce never derives from the
//! header: each sealer draws a random salt and counts packets.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, trace};

use super::{ConnectionInfo, ControlChannel, ControlMessage, Credentials, FrameSink, Gateway};
use crate::{audio::OpusFrame, error::ConnectionError};

pub const HEADER_LEN: usize = 12;
pub const NONCE_LEN: usize = 12;
const VERSION_BYTE: u8 = 0x80;
const PAYLOAD_TYPE: u8 = 0x78;
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Production [`Gateway`].
#[derive(Debug, Clone)]
pub struct TcpGateway {
    connect_timeout: Duration,
}

impl TcpGateway {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Gateway for TcpGateway {
    async fn open_control(&self, credentials: &Credentials) -> Result<Box<dyn ControlChannel>, ConnectionError> {
        debug!("Abriendo canal de control hacia {}", credentials.endpoint);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&credentials.endpoint))
            .await
            .map_err(|_| ConnectionError::Timeout("tcp connect"))??;
        stream.set_nodelay(true)?;

        Ok(Box::new(TcpControl {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        }))
    }

    async fn open_media(&self, connection: &ConnectionInfo) -> Result<Box<dyn FrameSink>, ConnectionError> {
        let sink = UdpMediaSink::connect(connection).await?;
        Ok(Box::new(sink))
    }
}

struct TcpControl {
    framed: Framed<TcpStream, LinesCodec>,
}

#[async_trait]
impl ControlChannel for TcpControl {
    async fn send(&mut self, message: ControlMessage) -> Result<(), ConnectionError> {
        let line = serde_json::to_string(&message).map_err(|e| ConnectionError::Protocol(e.to_string()))?;
        trace!("→ {}", line);
        self.framed
            .send(line)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<ControlMessage>, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(line)) => {
                trace!("← {}", line);
                serde_json::from_str(&line)
                    .map(Some)
                    .map_err(|e| ConnectionError::Protocol(format!("{}: {}", e, line)))
            }
            Some(Err(e)) => Err(ConnectionError::Transport(e.to_string())),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        let _ = SinkExt::<String>::close(&mut self.framed).await;
    }
}

/// Seals frames for one connection and sends them over UDP.
pub struct UdpMediaSink {
    socket: UdpSocket,
    sealer: FrameSealer,
}

impl UdpMediaSink {
    pub async fn connect(connection: &ConnectionInfo) -> Result<Self, ConnectionError> {
        let bind = if connection.media_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(connection.media_addr).await?;
        debug!(
            "🎧 Canal de medios listo hacia {} (ssrc {})",
            connection.media_addr, connection.ssrc
        );

        Ok(Self {
            socket,
            sealer: FrameSealer::new(connection.ssrc, &connection.key.0)?,
        })
    }
}

#[async_trait]
impl FrameSink for UdpMediaSink {
    async fn send_frame(&mut self, frame: &OpusFrame) -> Result<(), ConnectionError> {
        let packet = self.sealer.seal(frame)?;
        self.socket.send(&packet).await?;
        Ok(())
    }
}

/// Builds encrypted media packets.
///
/// Nonce: 4-byte per-sealer salt followed by a big-endian u64 packet counter.
pub struct FrameSealer {
    ssrc: u32,
    cipher: Aes256Gcm,
    salt: [u8; 4],
    counter: u64,
}

impl FrameSealer {
    pub fn new(ssrc: u32, key: &[u8]) -> Result<Self, ConnectionError> {
        Self::with_salt(ssrc, key, rand::random())
    }

    pub fn with_salt(ssrc: u32, key: &[u8], salt: [u8; 4]) -> Result<Self, ConnectionError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| ConnectionError::Crypto(e.to_string()))?;
        Ok(Self {
            ssrc,
            cipher,
            salt,
            counter: 0,
        })
    }

    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], ConnectionError> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.salt);
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| ConnectionError::Crypto("nonce space exhausted".into()))?;
        Ok(nonce)
    }

    pub fn header(&self, frame: &OpusFrame) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = VERSION_BYTE;
        header[1] = PAYLOAD_TYPE;
        header[2..4].copy_from_slice(&frame.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&frame.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    pub fn seal(&mut self, frame: &OpusFrame) -> Result<Vec<u8>, ConnectionError> {
        let header = self.header(frame);
        let nonce = self.next_nonce()?;
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &frame.payload,
                    aad: &header,
                },
            )
            .map_err(|e| ConnectionError::Crypto(e.to_string()))?;

        let mut packet = Vec::with_capacity(HEADER_LEN + NONCE_LEN + sealed.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(&sealed);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::{Destination, SessionKey};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;
    use tokio_util::codec::LinesCodec;

    fn frame(sequence: u16, timestamp: u32) -> OpusFrame {
        OpusFrame {
            sequence,
            timestamp,
            payload: Bytes::from_static(b"opus-bytes"),
        }
    }

    fn try_open(key: &[u8; 32], packet: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
        let cipher = Aes256Gcm::new_from_slice(key).unwrap();
        let (header, rest) = packet.split_at(HEADER_LEN);
        let (nonce, body) = rest.split_at(NONCE_LEN);
        cipher.decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad: header })
    }

    fn open(key: &[u8; 32], packet: &[u8]) -> Vec<u8> {
        try_open(key, packet).unwrap()
    }

    fn nonce_of(packet: &[u8]) -> Vec<u8> {
        packet[HEADER_LEN..HEADER_LEN + NONCE_LEN].to_vec()
    }

    #[test]
    fn test_header_layout() {
        let sealer = FrameSealer::new(0xDEADBEEF, &[1u8; 32]).unwrap();
        let header = sealer.header(&frame(0x0102, 0x03040506));
        assert_eq!(
            header,
            [0x80, 0x78, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn test_sealed_payload_opens_with_key() {
        let key = [9u8; 32];
        let mut sealer = FrameSealer::new(42, &key).unwrap();
        let packet = sealer.seal(&frame(7, 960)).unwrap();
        assert_eq!(packet.len(), HEADER_LEN + NONCE_LEN + b"opus-bytes".len() + 16);
        assert_eq!(open(&key, &packet), b"opus-bytes".to_vec());
    }

    #[test]
    fn test_nonce_is_salt_then_counter() {
        let mut sealer = FrameSealer::with_salt(42, &[9u8; 32], [0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        sealer.seal(&frame(0, 0)).unwrap();
        let packet = sealer.seal(&frame(0, 0)).unwrap();
        assert_eq!(
            nonce_of(&packet),
            vec![0xAA, 0xBB, 0xCC, 0xDD, 0, 0, 0, 0, 0, 0, 0, 1]
        );
    }

    #[test]
    fn test_restarted_counters_never_reuse_a_nonce() {
        let key = [9u8; 32];
        let mut sealer = FrameSealer::with_salt(42, &key, [0; 4]).unwrap();
        let mut seen = std::collections::HashSet::new();
        // sequence numbers wrap and epochs restart at zero
        for i in 0..70_000u32 {
            let packet = sealer.seal(&frame(i as u16, (i % 100) * 960)).unwrap();
            assert!(seen.insert(nonce_of(&packet)), "nonce reused at {}", i);
        }
    }

    #[test]
    fn test_sealers_for_the_same_session_use_distinct_nonces() {
        let key = [9u8; 32];
        let mut first = FrameSealer::new(42, &key).unwrap();
        let mut second = FrameSealer::new(42, &key).unwrap();
        let a = first.seal(&frame(0, 0)).unwrap();
        let b = second.seal(&frame(0, 0)).unwrap();
        assert_eq!(&a[..HEADER_LEN], &b[..HEADER_LEN]);
        assert_ne!(nonce_of(&a), nonce_of(&b));
        assert_eq!(open(&key, &a), open(&key, &b));
    }

    #[test]
    fn test_tampered_header_fails_authentication() {
        let key = [9u8; 32];
        let mut sealer = FrameSealer::new(42, &key).unwrap();
        let mut packet = sealer.seal(&frame(7, 960)).unwrap();
        packet[3] ^= 0xFF;
        assert!(try_open(&key, &packet).is_err());
    }

    #[test]
    fn test_bad_key_length() {
        assert!(matches!(FrameSealer::new(1, &[0u8; 16]), Err(ConnectionError::Crypto(_))));
    }

    #[tokio::test]
    async fn test_control_channel_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());
            let line = framed.next().await.unwrap().unwrap();
            let hello: ControlMessage = serde_json::from_str(&line).unwrap();
            assert!(matches!(hello, ControlMessage::Identify { destination: 3, .. }));
            framed
                .send(r#"{"op":"heartbeat_ack","d":{"nonce":1}}"#.to_string())
                .await
                .unwrap();
        });

        let gateway = TcpGateway::new(Duration::from_secs(2));
        let mut control = gateway
            .open_control(&Credentials {
                endpoint: addr.to_string(),
                token: "t".into(),
            })
            .await
            .unwrap();
        control
            .send(ControlMessage::Identify {
                destination: 3,
                token: "t".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            control.recv().await.unwrap(),
            Some(ControlMessage::HeartbeatAck { nonce: 1 })
        );
        server.await.unwrap();
        assert_eq!(control.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_media_sink_sends_sealed_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let key = [3u8; 32];
        let info = ConnectionInfo {
            epoch: 1,
            destination: Destination(1),
            session_id: "s".into(),
            ssrc: 77,
            media_addr: receiver.local_addr().unwrap(),
            key: SessionKey(key),
        };

        let mut sink = UdpMediaSink::connect(&info).await.unwrap();
        sink.send_frame(&frame(1, 0)).await.unwrap();

        let mut buf = [0u8; 1500];
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[8..12], &77u32.to_be_bytes());
        assert_eq!(open(&key, &buf[..n]), b"opus-bytes".to_vec());
        let first_nonce = nonce_of(&buf[..n]);

        // a resumed connection with the same key starts counting again
        let mut resumed = UdpMediaSink::connect(&info).await.unwrap();
        resumed.send_frame(&frame(1, 0)).await.unwrap();
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_ne!(nonce_of(&buf[..n]), first_nonce);
    }
}
