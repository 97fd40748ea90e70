//! Stream transport abstraction.
//!
//! The overlay runs over any ordered byte stream; production uses TCP via
//! `tokio::net`.  This module owns only byte I/O:
//! - [`Connector`] / [`TcpConnector`] : client role (`connect(host, port)`).
//! - [`Listener`] : server role (`bind`/`listen`/`accept`).
//! - [`FrameReader`] : reassembles whole frames out of the stream using the
//!   length prefix, so the stream itself never needs to preserve boundaries.
//! - [`FrameSender`] : serialises whole-frame writes from many producers and
//!   lets any holder close the write side.
//!
//! Protocol logic lives elsewhere.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex;

use crate::error::{Error, NetworkError};
use crate::frame::{self, HEADER_LEN};

/// Connect timeout used by [`TcpConnector::default`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pending-connection backlog for [`Listener::bind`].
const LISTEN_BACKLOG: u32 = 128;

/// Type-erased write half stored per switch session.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ---------------------------------------------------------------------------
// Client role
// ---------------------------------------------------------------------------

/// Opens a transport stream to the switch.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Fails with [`NetworkError::ConnectionFailed`] (or
    /// [`NetworkError::ConnectionTimeout`]) when no stream can be opened.
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<Self::Stream, NetworkError>> + Send;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, NetworkError> {
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(NetworkError::ConnectionFailed(format!("{host}:{port}: {e}")))
            }
            Err(_elapsed) => return Err(NetworkError::ConnectionTimeout),
        };
        // Frames are small and latency-bound.
        stream
            .set_nodelay(true)
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Server role
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Listener {
    /// Address the listener is bound to (ephemeral port resolved).
    pub local_addr: SocketAddr,
    inner: TcpListener,
}

impl Listener {
    /// Bind and listen on `addr`.  Passing port 0 lets the OS choose.
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        socket
            .bind(addr)
            .map_err(|e| NetworkError::BindFailed(format!("{addr}: {e}")))?;
        let inner = socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| NetworkError::ListenFailed(e.to_string()))?;
        let local_addr = inner
            .local_addr()
            .map_err(|e| NetworkError::ListenFailed(e.to_string()))?;
        Ok(Self { local_addr, inner })
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), NetworkError> {
        let (stream, peer) = self
            .inner
            .accept()
            .await
            .map_err(|e| NetworkError::AcceptFailed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| NetworkError::AcceptFailed(e.to_string()))?;
        Ok((stream, peer))
    }
}

// ---------------------------------------------------------------------------
// FrameReader
// ---------------------------------------------------------------------------

/// Reads length-prefixed frames from a byte stream.
///
/// [`FrameReader::next_frame`] is not cancel safe: dropping it mid-frame loses
/// the partial read.  Only cancel it when the stream is being abandoned.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive the next whole frame, returning its raw wire bytes
    /// (header included) so it can be forwarded verbatim.
    ///
    /// End of stream at a frame boundary is
    /// [`NetworkError::ConnectionClosed`]; a bad magic is
    /// [`crate::error::ProtocolError::InvalidMagic`] and leaves the stream
    /// unusable.
    pub async fn next_frame(&mut self) -> Result<Vec<u8>, Error> {
        let mut header = [0u8; HEADER_LEN];
        self.read_full(&mut header).await?;
        let length = frame::peek_length(&header)?;

        let mut raw = Vec::with_capacity(HEADER_LEN + length);
        raw.extend_from_slice(&header);
        raw.resize(HEADER_LEN + length, 0);
        self.read_full(&mut raw[HEADER_LEN..]).await?;
        Ok(raw)
    }

    async fn read_full(&mut self, buf: &mut [u8]) -> Result<(), NetworkError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]).await {
                Ok(0) => return Err(NetworkError::ConnectionClosed),
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(NetworkError::from_receive(e)),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FrameSender
// ---------------------------------------------------------------------------

/// The write half of a transport behind a send lock.
///
/// Every [`FrameSender::send`] writes one complete frame while holding the
/// lock, so concurrent producers never interleave partial frames.
pub struct FrameSender<W> {
    inner: Mutex<Option<W>>,
}

impl<W: AsyncWrite + Send + Unpin> FrameSender<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(Some(writer)),
        }
    }

    /// Write one already-encoded frame and flush it.
    ///
    /// The writer is only put back once the whole frame went out.  A failed
    /// write, or a send future dropped half way (a timeout), leaves the
    /// sender closed so no later frame lands behind a partial one.
    pub async fn send(&self, raw: &[u8]) -> Result<(), NetworkError> {
        let mut guard = self.inner.lock().await;
        let mut writer = guard
            .take()
            .ok_or_else(|| NetworkError::SendFailed("transport closed".into()))?;
        writer.write_all(raw).await.map_err(NetworkError::from_send)?;
        writer.flush().await.map_err(NetworkError::from_send)?;
        *guard = Some(writer);
        Ok(())
    }

    /// Frame `payload` and send it.
    pub async fn send_payload(&self, payload: &[u8]) -> Result<(), Error> {
        let raw = frame::encode(payload)?;
        self.send(&raw).await?;
        Ok(())
    }

    /// Shut the write side down.  Idempotent; later sends fail.
    pub async fn close(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}
