//! The unified connection abstraction: plain TCP, TLS, or Unix socket.
//!
//! All three terminal engines (transfer, exec bridge, relay) speak to a
//! `Connection` and never to the concrete socket. Operations dispatch via
//! match; there is no trait object in the hot path.

use std::io;
use std::net::{IpAddr, SocketAddr};
#[cfg(unix)]
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::TlsStream;
use tracing::{debug, warn};

/// Connection error kinds. `From<io::Error>` performs the classification so
/// call sites stay on `?`.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("operation would block")]
    WouldBlock,

    #[error("interrupted")]
    Interrupted,

    #[error("connection reset by peer")]
    PeerReset,

    #[error("operation timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => ConnError::WouldBlock,
            io::ErrorKind::Interrupted => ConnError::Interrupted,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => ConnError::PeerReset,
            io::ErrorKind::TimedOut => ConnError::Timeout,
            io::ErrorKind::NotConnected => ConnError::Closed,
            io::ErrorKind::InvalidData => ConnError::Protocol(e.to_string()),
            _ => ConnError::Io(e),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Plain,
    Tls,
    Unix,
}

impl std::fmt::Display for ConnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnKind::Plain => write!(f, "tcp"),
            ConnKind::Tls => write!(f, "tls"),
            ConnKind::Unix => write!(f, "unix"),
        }
    }
}

impl std::fmt::Debug for ConnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnKind::Plain => write!(f, "Plain"),
            ConnKind::Tls => write!(f, "Tls"),
            ConnKind::Unix => write!(f, "Unix"),
        }
    }
}

/// Tagged transport. The TLS variant wraps the raw socket; its fd is usable
/// for readiness polling only, never for direct I/O: one application read
/// may need several socket reads. The Unix variant optionally owns the
/// socket path for cleanup.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream, Option<PathBuf>),
}

impl Connection {
    pub fn kind(&self) -> ConnKind {
        match self {
            Connection::Plain(_) => ConnKind::Plain,
            Connection::Tls(_) => ConnKind::Tls,
            #[cfg(unix)]
            Connection::Unix(..) => ConnKind::Unix,
        }
    }

    /// Peer IP address, when the transport has one.
    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_addr().map(|a| a.ip())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::Plain(s) => s.peer_addr().ok(),
            Connection::Tls(s) => s.get_ref().0.peer_addr().ok(),
            #[cfg(unix)]
            Connection::Unix(..) => None,
        }
    }

    /// Human-readable peer description for logging.
    pub fn peer_desc(&self) -> String {
        match self {
            Connection::Plain(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp peer".into()),
            Connection::Tls(s) => s
                .get_ref()
                .0
                .peer_addr()
                .map(|a| format!("{a} (tls)"))
                .unwrap_or_else(|_| "tls peer".into()),
            #[cfg(unix)]
            Connection::Unix(s, _) => s
                .peer_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix peer".into()),
        }
    }

    /// Raw fd for diagnostics and readiness checks only.
    #[cfg(unix)]
    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        match self {
            Connection::Plain(s) => s.as_raw_fd(),
            Connection::Tls(s) => s.get_ref().0.as_raw_fd(),
            Connection::Unix(s, _) => s.as_raw_fd(),
        }
    }

    /// Read into `buf`; 0 means the peer closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnError> {
        let n = AsyncReadExt::read(self, buf).await?;
        Ok(n)
    }

    /// Single write; may be short.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, ConnError> {
        let n = AsyncWriteExt::write(self, buf).await?;
        Ok(n)
    }

    /// Write the whole buffer.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), ConnError> {
        AsyncWriteExt::write_all(self, buf).await?;
        Ok(())
    }

    /// Half-close: no more writes from this side; reads continue. On TLS
    /// this sends close_notify, which ends the write direction.
    pub async fn shutdown_write(&mut self) -> Result<(), ConnError> {
        match AsyncWriteExt::shutdown(self).await {
            Ok(()) => Ok(()),
            // Already-closed shutdown is a no-op, keeping close idempotent.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Close the connection. Idempotent; on TLS the close_notify alert is
    /// sent best-effort.
    pub async fn close(&mut self) {
        if let Err(e) = self.shutdown_write().await {
            debug!("close: shutdown failed: {}", e);
        }
    }

    /// Close and release owned resources: a Unix connection that owns its
    /// socket path unlinks it. Unlink errors are logged, not propagated.
    pub async fn close_with_cleanup(&mut self) {
        self.close().await;
        #[cfg(unix)]
        if let Connection::Unix(_, Some(path)) = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove socket {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s, _) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s, _) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_flush(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            Connection::Unix(s, _) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            Connection::Unix(s, _) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection::{:?}({})", self.kind(), self.peer_desc())
    }
}
