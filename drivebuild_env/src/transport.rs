//! Length-prefixed framing over persistent TCP connections.
//!
//! Every message on a DriveBuild socket is a fixed-width decimal length
//! header followed by exactly that many payload bytes:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ "     123"   │ 123 bytes of protobuf payload │
//! │ HEADER_WIDTH │                               │
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! The header width is the number of decimal digits of [`MAX_MESSAGE_SIZE`],
//! so any legal length fits. Readers trim spaces on both sides of the
//! number so either padding direction is accepted.

use crate::error::is_disconnect_kind;
use crate::EnvError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Largest payload a single frame may carry.
pub const MAX_MESSAGE_SIZE: usize = 10_000_000;

/// Width of the length header in bytes.
pub const HEADER_WIDTH: usize = decimal_width(MAX_MESSAGE_SIZE);

const fn decimal_width(mut n: usize) -> usize {
    let mut width = 1;
    while n >= 10 {
        n /= 10;
        width += 1;
    }
    width
}

/// Tuning for header reads and liveness probes.
#[derive(Debug, Clone)]
pub struct FramingConfig {
    /// Extra attempts when a header read finds no bytes at all
    pub max_header_retries: u32,

    /// Pause between header attempts
    pub retry_backoff: Duration,

    /// How long a liveness probe waits for the socket to report readiness
    pub probe_window: Duration,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_header_retries: 2,
            retry_backoff: Duration::from_millis(50),
            probe_window: Duration::from_millis(1),
        }
    }
}

/// Encodes the length header for a payload of `len` bytes.
pub fn encode_header(len: usize) -> Result<[u8; HEADER_WIDTH], EnvError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(EnvError::MessageTooLarge {
            size: len,
            limit: MAX_MESSAGE_SIZE,
        });
    }
    let text = format!("{:>width$}", len, width = HEADER_WIDTH);
    let mut header = [b' '; HEADER_WIDTH];
    header.copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Parses a length header, accepting spaces on either side of the number.
pub fn parse_header(raw: &[u8]) -> Result<usize, EnvError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| EnvError::InvalidHeader(format!("{:?}", raw)))?
        .trim_matches(' ');
    let len: usize = text
        .parse()
        .map_err(|_| EnvError::InvalidHeader(text.to_string()))?;
    if len > MAX_MESSAGE_SIZE {
        return Err(EnvError::MessageTooLarge {
            size: len,
            limit: MAX_MESSAGE_SIZE,
        });
    }
    Ok(len)
}

/// Writes one frame. Oversized payloads are rejected before anything is sent.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), EnvError>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(payload.len())?;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame.
///
/// A header read that finds no bytes is retried `max_header_retries` times
/// before the peer is declared gone. End of stream in the middle of a frame
/// is always a close.
pub async fn read_frame<R>(reader: &mut R, config: &FramingConfig) -> Result<Vec<u8>, EnvError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_WIDTH];
    let mut filled = 0;
    let mut empty_reads = 0;
    while filled < HEADER_WIDTH {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled > 0 || empty_reads >= config.max_header_retries {
                return Err(EnvError::closed("end of stream"));
            }
            empty_reads += 1;
            tokio::time::sleep(config.retry_backoff).await;
            continue;
        }
        filled += n;
    }

    let len = parse_header(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// A framed, bidirectional connection shared by several tasks.
///
/// Separate locks guard the read half, the write half, outgoing
/// request/reply exchanges and incoming request parsing, so concurrent
/// callers never interleave frames.
pub struct FramedSocket {
    peer: SocketAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    request_lock: Mutex<()>,
    process_lock: Mutex<()>,
    closed: AtomicBool,
    config: FramingConfig,
}

impl FramedSocket {
    /// Wraps an accepted or connected stream.
    pub fn new(stream: TcpStream, config: FramingConfig) -> Result<Self, EnvError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            request_lock: Mutex::new(()),
            process_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Opens a new connection.
    pub async fn connect(addr: impl ToSocketAddrs, config: FramingConfig) -> Result<Self, EnvError> {
        let stream = TcpStream::connect(addr).await?;
        let socket = Self::new(stream, config)?;
        debug!("Connected to {}", socket.peer);
        Ok(socket)
    }

    /// Address of the remote end.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True once a read or write observed the peer going away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends one frame under the send lock.
    pub async fn send(&self, payload: &[u8]) -> Result<(), EnvError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(EnvError::MessageTooLarge {
                size: payload.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        let mut writer = self.writer.lock().await;
        let result = write_frame(&mut *writer, payload).await;
        self.observe(result)
    }

    /// Receives one frame under the receive lock.
    ///
    /// A reset, aborted or ended connection marks the socket closed and is
    /// reported as [`EnvError::ConnectionClosed`].
    pub async fn receive(&self) -> Result<Vec<u8>, EnvError> {
        let mut reader = self.reader.lock().await;
        let result = read_frame(&mut *reader, &self.config).await;
        self.observe(result)
    }

    /// Best-effort liveness check.
    ///
    /// Never consumes bytes. A socket that is currently being read by
    /// another task counts as alive; that reader will notice a close itself.
    pub async fn probe(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let Ok(mut reader) = self.reader.try_lock() else {
            return true;
        };
        let mut buf = [0u8; 1];
        match tokio::time::timeout(self.config.probe_window, reader.peek(&mut buf)).await {
            Ok(Ok(0)) => self.mark_closed("peer finished"),
            Ok(Err(e)) if is_disconnect_kind(e.kind()) => self.mark_closed(&e.to_string()),
            Ok(Err(e)) => {
                warn!("Probe of {} failed: {}", self.peer, e);
                true
            }
            // Pending data or nothing to report
            Ok(Ok(_)) | Err(_) => true,
        }
    }

    /// Shuts down the write half, signalling end of stream to the peer.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.closed.store(true, Ordering::Release);
    }

    /// Serializes request/reply exchanges initiated on this socket.
    pub(crate) async fn lock_requests(&self) -> MutexGuard<'_, ()> {
        self.request_lock.lock().await
    }

    /// Serializes parsing of incoming requests on this socket.
    pub(crate) async fn lock_processing(&self) -> MutexGuard<'_, ()> {
        self.process_lock.lock().await
    }

    fn mark_closed(&self, reason: &str) -> bool {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Connection to {} closed: {}", self.peer, reason);
        }
        false
    }

    fn observe<T>(&self, result: Result<T, EnvError>) -> Result<T, EnvError> {
        match result {
            Err(e) if e.is_disconnect() => {
                self.mark_closed(&e.to_string());
                Err(EnvError::closed(self.peer))
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for FramedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedSocket")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (FramedSocket, FramedSocket) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(
            FramedSocket::connect(addr, FramingConfig::default()),
            listener.accept()
        );
        let server = FramedSocket::new(accepted.unwrap().0, FramingConfig::default()).unwrap();
        (client.unwrap(), server)
    }

    #[test]
    fn test_header_width_matches_limit() {
        assert_eq!(HEADER_WIDTH, 8);
        assert_eq!(MAX_MESSAGE_SIZE.to_string().len(), HEADER_WIDTH);
    }

    #[test]
    fn test_header_encoding() {
        assert_eq!(&encode_header(123).unwrap(), b"     123");
        assert_eq!(&encode_header(0).unwrap(), b"       0");
        assert_eq!(&encode_header(MAX_MESSAGE_SIZE).unwrap(), b"10000000");
    }

    #[test]
    fn test_header_parsing_accepts_both_paddings() {
        assert_eq!(parse_header(b"     123").unwrap(), 123);
        assert_eq!(parse_header(b"123     ").unwrap(), 123);
        assert!(matches!(parse_header(b"  12x   "), Err(EnvError::InvalidHeader(_))));
        assert!(matches!(
            parse_header(b"99999999"),
            Err(EnvError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        assert!(matches!(
            encode_header(MAX_MESSAGE_SIZE + 1),
            Err(EnvError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_payload_is_a_valid_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &[]).await.unwrap();
        let frame = read_frame(&mut b, &FramingConfig::default()).await.unwrap();
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn test_payload_split_across_reads() {
        // Buffer smaller than the payload forces partial reads
        let (mut a, mut b) = tokio::io::duplex(16);
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &payload).await.unwrap();
        });
        let frame = read_frame(&mut b, &FramingConfig::default()).await.unwrap();
        writer.await.unwrap();
        assert_eq!(frame, expected);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_a_close() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"      10abc").await.unwrap();
        drop(a);
        let err = read_frame(&mut b, &FramingConfig::default()).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_socket_send_receive() {
        let (client, server) = socket_pair().await;
        client.send(b"hello").await.unwrap();
        client.send(b"     42").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), b"hello");
        assert_eq!(server.receive().await.unwrap(), b"     42");
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        let (client, server) = socket_pair().await;
        let client = Arc::new(client);
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.send(&vec![i; 4096]).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        for _ in 0..8 {
            let frame = server.receive().await.unwrap();
            assert_eq!(frame.len(), 4096);
            assert!(frame.iter().all(|b| *b == frame[0]));
        }
    }

    #[tokio::test]
    async fn test_peer_close_marks_socket_closed() {
        let (client, server) = socket_pair().await;
        client.shutdown().await;
        drop(client);
        let err = server.receive().await.unwrap_err();
        assert!(matches!(err, EnvError::ConnectionClosed(_)));
        assert!(server.is_closed());
        assert!(!server.probe().await);
    }

    #[tokio::test]
    async fn test_probe_live_socket() {
        let (client, server) = socket_pair().await;
        assert!(server.probe().await);
        assert!(client.probe().await);
    }

    proptest! {
        #[test]
        fn prop_frame_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let received = rt.block_on(async {
                let (mut a, mut b) = tokio::io::duplex(256);
                let sent = payload.clone();
                let writer = tokio::spawn(async move { write_frame(&mut a, &sent).await });
                let frame = read_frame(&mut b, &FramingConfig::default()).await;
                writer.await.unwrap().unwrap();
                frame.unwrap()
            });
            prop_assert_eq!(received, payload);
        }

        #[test]
        fn prop_digit_payloads_roundtrip(digits in "[0-9 ]{0,64}") {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let payload = digits.into_bytes();
            let received = rt.block_on(async {
                let (mut a, mut b) = tokio::io::duplex(1024);
                write_frame(&mut a, &payload).await.unwrap();
                read_frame(&mut b, &FramingConfig::default()).await.unwrap()
            });
            prop_assert_eq!(received, payload);
        }
    }
}
