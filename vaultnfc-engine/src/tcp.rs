//! Wi-Fi Direct socket exchange.
//!
//! Once the P2P group is formed the group owner listens on
//! [`WIFI_DIRECT_PORT`](vaultnfc_core::WIFI_DIRECT_PORT) and the other peer
//! connects to the owner's address; from there it is a plain TCP stream.

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net;
use tracing::{debug, info};

use vaultnfc_core::transport::{Connection, Connector, Listener, ListenerFactory};

/// One side of a Wi-Fi Direct socket.
pub struct TcpConnection {
    stream: net::TcpStream,
    peer_addr: String,
}

impl TcpConnection {
    fn from_stream(stream: net::TcpStream) -> anyhow::Result<Self> {
        // A record fits in one segment; don't let Nagle hold it back.
        stream
            .set_nodelay(true)
            .context("failed to disable Nagle on socket")?;
        let peer_addr = stream
            .peer_addr()
            .context("failed to retrieve peer address")?
            .to_string();
        Ok(Self { stream, peer_addr })
    }
}

impl Connection for TcpConnection {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from TCP connection")
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .write_all(buf)
                .await
                .context("failed to write to TCP connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down TCP connection")
        }
    }
}

/// The group owner's listening socket.
pub struct TcpListener {
    inner: net::TcpListener,
    local_addr: String,
}

impl Listener for TcpListener {
    type Conn = TcpConnection;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let (stream, _) = self
                .inner
                .accept()
                .await
                .context("failed to accept Wi-Fi Direct peer")?;
            let conn = TcpConnection::from_stream(stream)?;
            debug!(peer = %conn.peer_addr, "Accepted Wi-Fi Direct peer");
            Ok(conn)
        }
    }
}

/// Binds the group-owner listener on `ip:port`.
pub struct TcpListenerFactory;

impl ListenerFactory for TcpListenerFactory {
    type L = TcpListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let inner = net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
            let local_addr = inner
                .local_addr()
                .context("failed to retrieve local address")?
                .to_string();
            info!(addr = %local_addr, "Group owner listening");
            Ok(TcpListener { inner, local_addr })
        }
    }
}

/// Opens the client side of a Wi-Fi Direct socket to the group owner's
/// `ip:port`.
///
/// The connect is bounded only by the OS connect timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect<'a>(
        &'a self,
        endpoint: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            let stream = net::TcpStream::connect(endpoint)
                .await
                .with_context(|| format!("failed to connect to {endpoint}"))?;
            let conn = TcpConnection::from_stream(stream)?;
            info!(peer = %conn.peer_addr, "Connected to group owner");
            Ok(conn)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// When binding an address that cannot parse, expect an error.
    #[tokio::test]
    async fn when_binding_invalid_address_expect_error() {
        let factory = TcpListenerFactory;
        let result = factory.bind("999.999.999.999:0").await;
        assert!(result.is_err());
    }

    /// When a client connects, expect each side to report the other's address.
    #[tokio::test]
    async fn when_client_connects_expect_peer_matches_client_address() {
        let factory = TcpListenerFactory;
        let mut listener = factory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let client = TcpConnector.connect(&addr).await.unwrap();
        assert_eq!(client.peer(), addr);

        let conn = listener.accept().await.unwrap();
        let client_local = client.stream.local_addr().unwrap().to_string();
        assert_eq!(conn.peer(), client_local);
    }

    /// When nothing listens on the endpoint, expect the error to name it.
    #[tokio::test]
    async fn when_nothing_listens_expect_connect_error_names_endpoint() {
        let factory = TcpListenerFactory;
        let listener = factory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        drop(listener);

        let err = TcpConnector.connect(&addr).await.err().unwrap();
        assert!(err.to_string().contains(&addr));
    }

    /// When bytes are written and the writer shuts down, expect the peer to read them then EOF.
    #[tokio::test]
    async fn when_bytes_written_expect_peer_reads_them_then_eof_after_shutdown() {
        let factory = TcpListenerFactory;
        let mut listener = factory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let mut client = TcpConnector.connect(&addr).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.write_all(b"vault").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = server.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"vault");
    }
}
