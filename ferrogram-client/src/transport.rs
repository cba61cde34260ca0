//! Async byte streams and the framed connection that runs over them.
//!
//! A [`Connector`] opens a stream to an address; [`Connection`] writes the
//! framing's init bytes and then moves whole frames in both directions using
//! one of the sans-IO framings from [`ferrogram_mtproto::transport`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferrogram_mtproto::transport::{Abridged, Framing, Full, Intermediate, Obfuscated};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::InvocationError;
use crate::socks5::Socks5Config;

const READ_CHUNK: usize = 64 * 1024;

/// Which MTProto transport framing to use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// MTProto [Abridged] transport: 1 or 4 byte length prefix.
    ///
    /// [Abridged]: https://core.telegram.org/mtproto/mtproto-transports#abridged
    Abridged,
    /// MTProto [Intermediate] transport: 4-byte LE length prefix.
    ///
    /// [Intermediate]: https://core.telegram.org/mtproto/mtproto-transports#intermediate
    #[default]
    Intermediate,
    /// MTProto [Full] transport: length, seqno and CRC32 per packet.
    ///
    /// [Full]: https://core.telegram.org/mtproto/mtproto-transports#full
    Full,
    /// [Obfuscated2] over Intermediate framing, for MTProxy and networks
    /// with deep-packet inspection. `secret` is the proxy secret, if any.
    ///
    /// [Obfuscated2]: https://core.telegram.org/mtproto/mtproto-transports#obfuscated-2
    Obfuscated { secret: Option<Vec<u8>> },
}

impl TransportKind {
    /// A fresh framing state for one connection. `dc_id` is only used by
    /// the obfuscated header.
    pub fn framing(&self, dc_id: i16) -> Result<Box<dyn Framing>, InvocationError> {
        Ok(match self {
            TransportKind::Abridged => Box::new(Abridged::new()),
            TransportKind::Intermediate => Box::new(Intermediate::new()),
            TransportKind::Full => Box::new(Full::new()),
            TransportKind::Obfuscated { secret } => {
                Box::new(Obfuscated::new(Intermediate::new(), dc_id, secret.as_deref())?)
            }
        })
    }
}

// ─── Streams ──────────────────────────────────────────────────────────────────

/// Any bidirectional byte stream a connection can run over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Opens byte streams to DC addresses.
///
/// The engine never dials sockets itself; tests plug in in-memory pipes here.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: &str) -> io::Result<BoxedStream>;
}

/// Plain TCP, optionally through a SOCKS5 proxy.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    pub socks5: Option<Socks5Config>,
    /// TCP keepalive idle time; `None` leaves the OS default.
    pub keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(socks5: Option<Socks5Config>) -> Self {
        Self { socks5, keepalive: Some(Duration::from_secs(60)) }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = match &self.socks5 {
            Some(proxy) => proxy.connect(addr).await?,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;
        if let Some(idle) = self.keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(idle);
            socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(Box::new(stream))
    }
}

// ─── Connection ───────────────────────────────────────────────────────────────

/// One open, framed connection.
pub struct Connection {
    stream: BoxedStream,
    framing: Box<dyn Framing>,
    read_buf: Box<[u8]>,
    out: Vec<u8>,
}

impl Connection {
    /// Dial `addr` and send the framing's init bytes.
    pub async fn open(
        connector: &Arc<dyn Connector>,
        addr: &str,
        kind: &TransportKind,
        dc_id: i16,
        timeout: Duration,
    ) -> Result<Self, InvocationError> {
        tracing::debug!("[ferrogram] connecting to {addr} ({kind:?})");
        let stream = tokio::time::timeout(timeout, connector.connect(addr))
            .await
            .map_err(|_| InvocationError::Timeout)??;
        Self::over(stream, kind.framing(dc_id)?).await
    }

    /// Start a connection over an already-open stream.
    pub async fn over(mut stream: BoxedStream, mut framing: Box<dyn Framing>) -> Result<Self, InvocationError> {
        let init = framing.init();
        if !init.is_empty() {
            stream.write_all(&init).await?;
        }
        Ok(Self { stream, framing, read_buf: vec![0u8; READ_CHUNK].into_boxed_slice(), out: Vec::new() })
    }

    /// Frame and write one payload.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), InvocationError> {
        self.out.clear();
        self.framing.encode(payload, &mut self.out);
        self.stream.write_all(&self.out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next whole frame.
    ///
    /// Cancel safe: bytes are only consumed from the stream once they have
    /// been handed to the framing.
    pub async fn recv(&mut self) -> Result<Vec<u8>, InvocationError> {
        loop {
            if let Some(frame) = self.framing.next_frame()? {
                return Ok(frame);
            }
            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer").into());
            }
            self.framing.feed(&self.read_buf[..n]);
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrogram_mtproto::transport::FramingError;

    struct Pipe(tokio::sync::Mutex<Option<BoxedStream>>);

    #[async_trait]
    impl Connector for Pipe {
        async fn connect(&self, _addr: &str) -> io::Result<BoxedStream> {
            self.0.lock().await.take().ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    #[tokio::test]
    async fn frames_cross_an_in_memory_pipe() {
        let (client, mut server) = tokio::io::duplex(1024);
        let connector: Arc<dyn Connector> = Arc::new(Pipe(tokio::sync::Mutex::new(Some(Box::new(client) as BoxedStream))));
        let mut conn =
            Connection::open(&connector, "test", &TransportKind::Intermediate, 2, Duration::from_secs(1)).await.unwrap();
        conn.send(&[1, 2, 3, 4]).await.unwrap();

        let mut got = [0u8; 12];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..4], &[0xee; 4]);
        assert_eq!(&got[4..8], &4u32.to_le_bytes());
        assert_eq!(&got[8..], &[1, 2, 3, 4]);

        // A reply split over two writes still arrives whole.
        server.write_all(&8u32.to_le_bytes()).await.unwrap();
        server.write_all(&[9; 3]).await.unwrap();
        let pending = tokio::spawn(async move {
            let frame = conn.recv().await.unwrap();
            (conn, frame)
        });
        server.write_all(&[9; 5]).await.unwrap();
        let (_conn, frame) = pending.await.unwrap();
        assert_eq!(frame, vec![9; 8]);
    }

    #[tokio::test]
    async fn negative_code_is_a_transport_error() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = Connection::over(Box::new(client), Box::new(Intermediate::new())).await.unwrap();
        let mut tag = [0u8; 4];
        server.read_exact(&mut tag).await.unwrap();
        server.write_all(&4u32.to_le_bytes()).await.unwrap();
        server.write_all(&(-404i32).to_le_bytes()).await.unwrap();
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, InvocationError::Transport(-404)));
        assert!(FramingError::Transport(-404).is_fatal());
    }

    #[tokio::test]
    async fn eof_is_reported() {
        let (client, server) = tokio::io::duplex(64);
        let mut conn = Connection::over(Box::new(client), Box::new(Abridged::new())).await.unwrap();
        drop(server);
        assert!(matches!(conn.recv().await, Err(InvocationError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn full_framing_cannot_be_obfuscated_but_intermediate_can() {
        assert!(TransportKind::Obfuscated { secret: None }.framing(2).is_ok());
        assert!(Obfuscated::new(Full::new(), 2, None).is_err());
    }
}
