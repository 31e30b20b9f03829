//! Client side of a secure connection.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// An established client TLS connection.
#[derive(Debug)]
pub struct SecureStream {
    inner: TlsStream<TcpStream>,
}

impl SecureStream {
    pub(crate) fn new(inner: TlsStream<TcpStream>) -> Self {
        Self { inner }
    }

    /// Write all of `data` and flush it. Returns the number of bytes sent.
    pub async fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(data.len())
    }

    /// Read whatever is available into `buf`. `Ok(0)` means the peer closed.
    pub async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }

    /// Read until `buf` is full.
    pub async fn receive_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf).await.map(|_| ())
    }

    /// Send close_notify and shut down the write half.
    pub async fn close(mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    /// Whether this handshake resumed a previous session.
    pub fn session_was_reused(&self) -> bool {
        self.inner.get_ref().1.handshake_kind() == Some(rustls::HandshakeKind::Resumed)
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.inner.get_ref().1.protocol_version()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.get_ref().0.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.get_ref().0.peer_addr()
    }
}
