//! Client-facing listener.
//!
//! The address string selects the transport: anything containing a colon is
//! a TCP `host:port` (an empty host listens on all interfaces), anything else
//! is a Unix-domain socket path.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::error::{ConfigError, ProxyError};
use crate::ipc::{BoxReader, BoxWriter};

/// Where the proxy listens, and where clients connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = ConfigError;

    fn from_str(addr: &str) -> Result<Self, Self::Err> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        if !addr.contains(':') {
            return Ok(ListenAddr::Unix(PathBuf::from(addr)));
        }
        if addr.ends_with(':') {
            return Err(ConfigError::InvalidAddress(addr.to_string()));
        }
        if addr.starts_with(':') {
            return Ok(ListenAddr::Tcp(format!("0.0.0.0{}", addr)));
        }
        Ok(ListenAddr::Tcp(addr.to_string()))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp {}", addr),
            ListenAddr::Unix(path) => write!(f, "unix {}", path.display()),
        }
    }
}

/// An accepted client connection, split into owned halves.
pub struct Connection {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    /// Human-readable peer description for logs.
    pub peer: String,
}

impl Connection {
    fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "tcp peer".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer,
        }
    }

    fn from_unix(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: "unix peer".to_string(),
        }
    }
}

/// A bound listener. Dropping it stops accepting and, for Unix sockets,
/// removes the socket file.
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenTcp` / `ProxyError::ListenUnix` if the
    /// address is unusable or already taken.
    pub async fn bind(addr: &ListenAddr) -> Result<Self, ProxyError> {
        match addr {
            ListenAddr::Tcp(host_port) => {
                let listener =
                    TcpListener::bind(host_port.as_str())
                        .await
                        .map_err(|source| ProxyError::ListenTcp {
                            addr: host_port.clone(),
                            source,
                        })?;
                Ok(Listener::Tcp(listener))
            }
            ListenAddr::Unix(path) => {
                let listener = UnixListener::bind(path).map_err(|source| ProxyError::ListenUnix {
                    path: path.clone(),
                    source,
                })?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// The address clients should connect to (with the real port when the
    /// listener was bound to port 0).
    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        match self {
            Listener::Tcp(listener) => Ok(ListenAddr::Tcp(listener.local_addr()?.to_string())),
            Listener::Unix { path, .. } => Ok(ListenAddr::Unix(path.clone())),
        }
    }

    /// Accept the next connection. Cancel safe.
    pub async fn accept(&self) -> io::Result<Connection> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::from_tcp(stream))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::from_unix(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove socket {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Connect to a listener address, returning owned halves.
pub async fn connect(addr: &ListenAddr) -> io::Result<(BoxReader, BoxWriter)> {
    match addr {
        ListenAddr::Tcp(host_port) => {
            let stream = TcpStream::connect(host_port.as_str()).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        ListenAddr::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_selects_transport() {
        assert_eq!(
            "127.0.0.1:8080".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("127.0.0.1:8080".to_string())
        );
        assert_eq!(
            ":8080".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("0.0.0.0:8080".to_string())
        );
        assert_eq!(
            "/tmp/jproxy.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/jproxy.sock"))
        );
        assert_eq!("".parse::<ListenAddr>().unwrap_err(), ConfigError::MissingAddress);
        assert!(matches!(
            "localhost:".parse::<ListenAddr>(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_listener_reports_bound_port() {
        let listener = Listener::bind(&ListenAddr::Tcp("127.0.0.1:0".to_string()))
            .await
            .expect("bind");
        match listener.local_addr().unwrap() {
            ListenAddr::Tcp(addr) => assert!(!addr.ends_with(":0"), "unresolved port: {}", addr),
            other => panic!("expected tcp, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_unix_listener_removes_socket_on_drop() {
        let path = std::env::temp_dir().join(format!("jproxy-listener-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let listener = Listener::bind(&ListenAddr::Unix(path.clone())).await.expect("bind");
        assert!(path.exists());

        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), connect(&addr));
        assert!(accepted.is_ok());
        assert!(connected.is_ok());

        drop(listener);
        assert!(!path.exists());
    }
}
