//! Listen address classification.
//!
//! An address beginning with `/` or `.` names a Unix domain socket path;
//! anything else is a TCP `host:port` endpoint. The request server, the
//! cluster transport and peer RPC all use this one rule.

use std::io;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

/// Which socket family a configured address refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    UnixSocket,
    NetworkSocket,
}

/// Classify `address` by its first character.
pub fn resolve(address: &str) -> TransportKind {
    match address.as_bytes().first() {
        Some(b'/') | Some(b'.') => TransportKind::UnixSocket,
        _ => TransportKind::NetworkSocket,
    }
}

/// A bound listener of either transport kind.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// Bind `address` using the transport kind [`resolve`] picks for it.
    ///
    /// A socket file left behind at a Unix path by a previous run is removed
    /// first. A socket that still accepts connections, or any other kind of
    /// file at that path, is an error.
    pub async fn bind(address: &str) -> io::Result<Self> {
        match resolve(address) {
            TransportKind::NetworkSocket => Ok(Listener::Tcp(TcpListener::bind(address).await?)),
            TransportKind::UnixSocket => bind_unix(address).await,
        }
    }

    /// Human-readable local address, for logging.
    pub fn local_addr(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string()),
            #[cfg(unix)]
            Listener::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "<unnamed>".to_string()),
        }
    }
}

#[cfg(unix)]
async fn bind_unix(path: &str) -> io::Result<Listener> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            match tokio::net::UnixStream::connect(path).await {
                Ok(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("{path} is in use by a running process"),
                    ))
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
                Err(e) => return Err(e),
            }
            tracing::debug!(path, "Removing stale socket file");
            std::fs::remove_file(path)?;
        }
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{path} exists and is not a socket"),
            ))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(Listener::Unix(UnixListener::bind(path)?))
}

#[cfg(not(unix))]
async fn bind_unix(path: &str) -> io::Result<Listener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unix socket {path} is not supported on this platform"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resolve_unix_paths() {
        assert_eq!(resolve("/tmp/server.sock"), TransportKind::UnixSocket);
        assert_eq!(resolve("./node0.sock"), TransportKind::UnixSocket);
        assert_eq!(resolve("/"), TransportKind::UnixSocket);
        assert_eq!(resolve("."), TransportKind::UnixSocket);
    }

    #[test]
    fn test_resolve_network_endpoints() {
        assert_eq!(resolve("127.0.0.1:4000"), TransportKind::NetworkSocket);
        assert_eq!(resolve("localhost:4001"), TransportKind::NetworkSocket);
        assert_eq!(resolve("node0.sock"), TransportKind::NetworkSocket);
        assert_eq!(resolve(""), TransportKind::NetworkSocket);
    }

    proptest! {
        #[test]
        fn prop_resolve_matches_leading_char(s in ".*") {
            let expected = if s.starts_with('/') || s.starts_with('.') {
                TransportKind::UnixSocket
            } else {
                TransportKind::NetworkSocket
            };
            prop_assert_eq!(resolve(&s), expected);
        }

        #[test]
        fn prop_resolve_host_port_is_network(host in "[a-z0-9][a-z0-9.-]{0,20}", port in 1u16..) {
            let addr = format!("{host}:{port}");
            prop_assert_eq!(resolve(&addr), TransportKind::NetworkSocket);
        }
    }

    #[tokio::test]
    async fn test_bind_tcp() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(listener, Listener::Tcp(_)));
        assert!(listener.local_addr().starts_with("127.0.0.1:"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_unix_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.sock");
        let path = path.to_str().unwrap();

        let first = Listener::bind(path).await.unwrap();
        assert!(matches!(first, Listener::Unix(_)));
        drop(first);

        // The socket file outlives the listener; binding again must succeed.
        let second = Listener::bind(path).await.unwrap();
        assert_eq!(second.local_addr(), path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_unix_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.sock");
        let path = path.to_str().unwrap();

        let first = Listener::bind(path).await.unwrap();
        let err = Listener::bind(path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        // The running listener still owns the path.
        let Listener::Unix(first) = first else {
            panic!("expected a unix listener");
        };
        let (connected, accepted) =
            tokio::join!(tokio::net::UnixStream::connect(path), first.accept());
        connected.unwrap();
        accepted.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_unix_refuses_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"data").unwrap();

        let err = Listener::bind(path.to_str().unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
