//! Tunnel IPC Channel
//!
//! A single logical request/response connection to the privileged
//! tunnel process. Sends are serialized: each request gets a sequence
//! number and the channel only accepts the response carrying it.
//!
//! # Layers
//!
//! ```text
//!  TunnelManager / IpcIssuer
//!          │ ControlMessage
//!          ▼
//!  TunnelIpcChannel ── encode/decode (codec) ── seq pairing
//!          │ frame bytes
//!          ▼
//!  IpcTransport (StreamTransport over any byte stream)
//!          │
//!          ▼
//!  serve() + ControlHandler in the privileged process
//! ```

use crate::codec::{self, CodecError, HEADER_LEN, Header};
use crate::config::ControlConfig;
use crate::message::{ControlMessage, ControlResponse};
use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info, warn};

/// IPC errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("Privileged process disconnected")]
    Disconnected,

    #[error("IPC request timed out")]
    Timeout,

    #[error("Malformed message: {0}")]
    Malformed(#[from] CodecError),

    #[error("Response sequence mismatch (expected {expected}, got {got})")]
    SequenceMismatch { expected: u32, got: u32 },

    #[error("Unexpected response to {request}: {response}")]
    UnexpectedResponse {
        request: &'static str,
        response: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => IpcError::Disconnected,
            _ => IpcError::Io(e.to_string()),
        }
    }
}

/// Anything that can deliver a control message and return its response
#[async_trait]
pub trait ControlSender: Send + Sync {
    async fn send(&self, message: ControlMessage) -> Result<ControlResponse, IpcError>;
}

/// Byte-level request/response primitive: exactly one response frame
/// per request frame, or an error
#[async_trait]
pub trait IpcTransport: Send + Sync {
    async fn exchange(&self, frame: Vec<u8>) -> Result<Vec<u8>, IpcError>;
}

/// Splits a byte stream into whole envelopes
///
/// A partly received envelope stays in the [`Framed`] read buffer, so a
/// read dropped half way (a timed-out exchange) resumes where it stopped.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<u8>>, IpcError> {
        let Some(head) = src.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let head: &[u8; HEADER_LEN] = head.try_into().map_err(|_| CodecError::Truncated)?;
        let header = Header::parse(head)?;

        let total = HEADER_LEN + header.len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(total).to_vec()))
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = IpcError;

    fn encode(&mut self, frame: Vec<u8>, dst: &mut BytesMut) -> Result<(), IpcError> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

fn frame_seq(frame: &[u8]) -> Option<u32> {
    frame.get(2..6)?.try_into().ok().map(u32::from_be_bytes)
}

/// Frames envelopes over a bidirectional byte stream
pub struct StreamTransport<S> {
    framed: Mutex<Framed<S, FrameCodec>>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            framed: Mutex::new(Framed::new(stream, FrameCodec)),
        }
    }
}

#[async_trait]
impl<S> IpcTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn exchange(&self, frame: Vec<u8>) -> Result<Vec<u8>, IpcError> {
        let seq = frame_seq(&frame);
        let mut framed = self.framed.lock().await;
        framed.send(frame).await?;

        // Responses to requests abandoned after a timeout arrive late; skip them
        loop {
            let reply = framed.next().await.ok_or(IpcError::Disconnected)??;
            match (seq, frame_seq(&reply)) {
                (Some(want), Some(got)) if got < want => {
                    debug!("Discarding stale IPC response (seq {}, want {})", got, want);
                }
                _ => return Ok(reply),
            }
        }
    }
}

/// Typed channel to the privileged tunnel process
///
/// Each round trip runs in its own task so a caller that gives up (for
/// example a cancelled connect) never leaves half an exchange on the wire.
pub struct TunnelIpcChannel<T> {
    inner: Arc<ChannelInner<T>>,
}

struct ChannelInner<T> {
    transport: T,
    /// Serializes request/response pairs
    lock: Mutex<()>,
    next_seq: AtomicU32,
    timeout: Duration,
}

impl<T: IpcTransport + 'static> TunnelIpcChannel<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                lock: Mutex::new(()),
                next_seq: AtomicU32::new(1),
                timeout,
            }),
        }
    }

    /// Channel with the configured per-request timeout
    pub fn from_config(transport: T, config: &ControlConfig) -> Self {
        Self::new(transport, config.ipc_timeout())
    }
}

impl<T: IpcTransport> ChannelInner<T> {
    async fn round_trip(&self, message: &ControlMessage) -> Result<ControlResponse, IpcError> {
        let _guard = self.lock.lock().await;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let frame = codec::encode_request(seq, message)?;

        debug!("IPC -> {} (seq {}, {} bytes)", message.name(), seq, frame.len());

        let reply = tokio::time::timeout(self.timeout, self.transport.exchange(frame))
            .await
            .map_err(|_| IpcError::Timeout)??;

        let (got, response) = codec::decode_response(&reply)?;
        if got != seq {
            return Err(IpcError::SequenceMismatch { expected: seq, got });
        }

        debug!("IPC <- {:?} (seq {})", response, seq);
        Ok(response)
    }
}

#[async_trait]
impl<T: IpcTransport + 'static> ControlSender for TunnelIpcChannel<T> {
    async fn send(&self, message: ControlMessage) -> Result<ControlResponse, IpcError> {
        let inner = self.inner.clone();
        let name = message.name();
        let exchange = tokio::spawn(async move { inner.round_trip(&message).await });

        exchange
            .await
            .map_err(|e| IpcError::Io(e.to_string()))?
            .inspect_err(|e| warn!("IPC {} failed: {}", name, e))
    }
}

/// Answers control messages inside the privileged process
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, message: ControlMessage) -> ControlResponse;
}

/// Run the privileged-side loop: read a request, dispatch it, write
/// exactly one response. Returns when the peer closes the stream.
pub async fn serve<S, H>(stream: S, handler: &H) -> Result<(), IpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: ControlHandler + ?Sized,
{
    info!("IPC server loop started");
    let mut framed = Framed::new(stream, FrameCodec);

    while let Some(frame) = framed.next().await.transpose()? {
        let (seq, response) = match codec::decode_request(&frame) {
            Ok((seq, message)) => {
                debug!("IPC server handling {} (seq {})", message.name(), seq);
                (seq, handler.handle(message).await)
            }
            Err(e) => {
                warn!("IPC server rejected malformed request: {}", e);
                let seq = frame_seq(&frame).unwrap_or(0);
                (seq, ControlResponse::Error(e.to_string()))
            }
        };

        let reply = codec::encode_response(seq, &response).or_else(|e| {
            warn!("IPC response to seq {} does not fit an envelope: {}", seq, e);
            codec::encode_response(seq, &ControlResponse::Error(e.to_string()))
        })?;
        framed.send(reply).await?;
    }

    info!("IPC peer closed the channel");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ControlHandler for Echo {
        async fn handle(&self, message: ControlMessage) -> ControlResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match message {
                ControlMessage::StopTunnel => ControlResponse::Ok,
                ControlMessage::SetSessionSelector { selector, .. } => {
                    ControlResponse::Error(selector)
                }
                _ => ControlResponse::ErrorSessionExpired,
            }
        }
    }

    type DuplexChannel = TunnelIpcChannel<StreamTransport<tokio::io::DuplexStream>>;

    fn spawn_server() -> (DuplexChannel, Arc<Echo>) {
        let (client, server) = tokio::io::duplex(4096);
        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let served = handler.clone();
        tokio::spawn(async move {
            let _ = serve(server, served.as_ref()).await;
        });
        let config = ControlConfig {
            ipc_timeout_secs: 2,
            ..ControlConfig::default()
        };
        (TunnelIpcChannel::from_config(StreamTransport::new(client), &config), handler)
    }

    #[tokio::test]
    async fn test_typed_responses_over_stream() {
        let (channel, handler) = spawn_server();

        assert_eq!(channel.send(ControlMessage::StopTunnel).await, Ok(ControlResponse::Ok));
        assert_eq!(
            channel
                .send(ControlMessage::SetSessionSelector {
                    selector: "abc".into(),
                    cookie: Some("c".into()),
                })
                .await,
            Ok(ControlResponse::Error("abc".into()))
        );
        assert_eq!(
            channel
                .send(ControlMessage::RefreshCertificate { features: None })
                .await,
            Ok(ControlResponse::ErrorSessionExpired)
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_paired() {
        let (channel, handler) = spawn_server();
        let channel = Arc::new(channel);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let channel = channel.clone();
                tokio::spawn(async move {
                    channel
                        .send(ControlMessage::SetSessionSelector {
                            selector: format!("sel-{}", i),
                            cookie: None,
                        })
                        .await
                })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(
                task.await.unwrap(),
                Ok(ControlResponse::Error(format!("sel-{}", i)))
            );
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_peer_gone_is_disconnected() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let channel = TunnelIpcChannel::new(StreamTransport::new(client), Duration::from_secs(1));

        assert_eq!(
            channel.send(ControlMessage::StopTunnel).await,
            Err(IpcError::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_stale_responses_are_skipped() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut framed = Framed::new(server, FrameCodec);
            let frame = framed.next().await.unwrap().unwrap();
            let seq = frame_seq(&frame).unwrap();
            let stale = codec::encode_response(seq - 1, &ControlResponse::Error("late".into()));
            framed.send(stale.unwrap()).await.unwrap();
            let reply = codec::encode_response(seq, &ControlResponse::Ok);
            framed.send(reply.unwrap()).await.unwrap();
        });

        let channel = TunnelIpcChannel::new(StreamTransport::new(client), Duration::from_secs(1));
        assert_eq!(channel.send(ControlMessage::StopTunnel).await, Ok(ControlResponse::Ok));
    }

    #[tokio::test]
    async fn test_reply_split_across_timeout_keeps_stream_aligned() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut requests = FramedRead::new(read, FrameCodec);

            let first = requests.next().await.unwrap().unwrap();
            let late = codec::encode_response(frame_seq(&first).unwrap(), &ControlResponse::Ok);
            let late = late.unwrap();
            write.write_all(&late[..HEADER_LEN]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(450)).await;
            write.write_all(&late[HEADER_LEN..]).await.unwrap();

            let second = requests.next().await.unwrap().unwrap();
            let seq = frame_seq(&second).unwrap();
            let reply = codec::encode_response(seq, &ControlResponse::ErrorSessionExpired);
            write.write_all(&reply.unwrap()).await.unwrap();
        });

        let transport = StreamTransport::new(client);
        let channel = TunnelIpcChannel::new(transport, Duration::from_millis(300));

        assert_eq!(
            channel.send(ControlMessage::StopTunnel).await,
            Err(IpcError::Timeout)
        );
        assert_eq!(
            channel.send(ControlMessage::StopTunnel).await,
            Ok(ControlResponse::ErrorSessionExpired)
        );
    }

    #[tokio::test]
    async fn test_server_answers_an_oversized_response_with_an_error() {
        struct Huge;

        #[async_trait]
        impl ControlHandler for Huge {
            async fn handle(&self, _message: ControlMessage) -> ControlResponse {
                ControlResponse::Certificate(crate::certificate::Certificate::from_unix(
                    "x".repeat(codec::MAX_PAYLOAD_LEN),
                    2_000,
                    1_000,
                    crate::features::VpnFeatures::default(),
                ))
            }
        }

        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = serve(server, &Huge).await;
        });
        let channel = TunnelIpcChannel::new(StreamTransport::new(client), Duration::from_secs(1));

        assert!(matches!(
            channel.send(ControlMessage::RefreshCertificate { features: None }).await,
            Ok(ControlResponse::Error(ref message)) if message.contains("too large")
        ));
    }

    struct WrongSeq;

    #[async_trait]
    impl IpcTransport for WrongSeq {
        async fn exchange(&self, _frame: Vec<u8>) -> Result<Vec<u8>, IpcError> {
            Ok(codec::encode_response(999, &ControlResponse::Ok)?)
        }
    }

    #[tokio::test]
    async fn test_mismatched_sequence_is_rejected() {
        let channel = TunnelIpcChannel::new(WrongSeq, Duration::from_secs(1));

        assert_eq!(
            channel.send(ControlMessage::StopTunnel).await,
            Err(IpcError::SequenceMismatch { expected: 1, got: 999 })
        );
    }

    struct Garbage;

    #[async_trait]
    impl IpcTransport for Garbage {
        async fn exchange(&self, _frame: Vec<u8>) -> Result<Vec<u8>, IpcError> {
            Ok(vec![1, 0x80, 0, 0])
        }
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let channel = TunnelIpcChannel::new(Garbage, Duration::from_secs(1));

        assert_eq!(
            channel.send(ControlMessage::StopTunnel).await,
            Err(IpcError::Malformed(CodecError::Truncated))
        );
    }

    struct Silent;

    #[async_trait]
    impl IpcTransport for Silent {
        async fn exchange(&self, _frame: Vec<u8>) -> Result<Vec<u8>, IpcError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let channel = TunnelIpcChannel::new(Silent, Duration::from_millis(20));

        assert_eq!(
            channel.send(ControlMessage::StopTunnel).await,
            Err(IpcError::Timeout)
        );
    }
}
