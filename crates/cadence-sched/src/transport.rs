//! Listener and connection plumbing for Unix socket and TCP transports.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream, UnixListener as TokioUnixListener, UnixStream};

use crate::error::{Result, SchedError};

/// A bidirectional connection.
pub trait Connection:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin
{
}

impl Connection for TcpStream {}
impl Connection for UnixStream {}

/// A listener that accepts incoming connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accepts a new incoming connection.
    async fn accept(&self) -> Result<Box<dyn Connection>>;

    /// Returns the local address this listener is bound to.
    fn local_addr(&self) -> String;
}

/// Listen or dial address: `unix://<path>` or `tcp://<addr>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// Unix domain socket.
    Unix(PathBuf),
    /// TCP socket.
    Tcp(SocketAddr),
}

impl FromStr for ListenAddr {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(SchedError::InvalidAddress(s.to_owned()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|_| SchedError::InvalidAddress(s.to_owned()))?;
            return Ok(Self::Tcp(addr));
        }
        Err(SchedError::InvalidAddress(s.to_owned()))
    }
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

impl ListenAddr {
    /// Binds the address and returns a listener.
    pub async fn bind(&self) -> Result<Box<dyn Listener>> {
        match self {
            Self::Unix(path) => Ok(Box::new(UnixListener::bind(path)?)),
            Self::Tcp(addr) => Ok(Box::new(TcpListener::bind(*addr).await?)),
        }
    }

    /// Connects to the address.
    pub async fn connect(&self) -> Result<Box<dyn Connection>> {
        match self {
            Self::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
            Self::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
        }
    }
}

/// TCP listener with keepalive probing enabled on accepted connections.
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
}

impl TcpListener {
    /// Binds to the given address.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = TokioTcpListener::bind(addr).await?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (stream, _addr) = self.inner.accept().await?;
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(5))
            .with_retries(4);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> String {
        self.inner
            .local_addr()
            .map_or_else(|_| "tcp://?".to_owned(), |addr| format!("tcp://{addr}"))
    }
}

/// Unix socket listener.
#[derive(Debug)]
pub struct UnixListener {
    inner: TokioUnixListener,
    path: PathBuf,
}

impl UnixListener {
    /// Binds to the given socket path.
    ///
    /// A stale socket file at the path is removed first.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let inner = TokioUnixListener::bind(path)?;
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for UnixListener {
    fn drop(&mut self) {
        // Clean up socket file on drop
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl Listener for UnixListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn address_parsing() {
        let unix: ListenAddr = "unix:///tmp/test.sock".parse().unwrap();
        assert_eq!(unix, ListenAddr::Unix(PathBuf::from("/tmp/test.sock")));
        assert_eq!(unix.to_string(), "unix:///tmp/test.sock");

        let tcp: ListenAddr = "tcp://127.0.0.1:5000".parse().unwrap();
        assert_eq!(tcp.to_string(), "tcp://127.0.0.1:5000");

        assert!("http://example".parse::<ListenAddr>().is_err());
        assert!("unix://".parse::<ListenAddr>().is_err());
        assert!("tcp://not-an-addr".parse::<ListenAddr>().is_err());
    }

    #[tokio::test]
    async fn unix_echo() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("echo.sock");

        let addr = ListenAddr::Unix(sock_path.clone());
        let listener = addr.bind().await.unwrap();
        assert!(sock_path.exists());

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut client = addr.connect().await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn stale_socket_removed_on_bind() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("stale.sock");
        std::fs::write(&sock_path, b"stale").unwrap();

        let listener = UnixListener::bind(&sock_path).unwrap();
        assert!(sock_path.exists());
        drop(listener);
        assert!(!sock_path.exists());
    }

    #[tokio::test]
    async fn tcp_echo() {
        let addr = ListenAddr::Tcp("127.0.0.1:0".parse().unwrap());
        let listener = addr.bind().await.unwrap();
        let bound: ListenAddr = listener.local_addr().parse().unwrap();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut client = bound.connect().await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    }
}
