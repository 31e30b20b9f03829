//! Server-side byte streams handed to connection handlers.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// Most bytes buffered from a client while its connection waits in the queue.
pub const READ_AHEAD_LIMIT: usize = 16 * 1024;

/// An accepted socket that first yields any bytes read ahead while the
/// connection was queued, then reads from the socket.
#[derive(Debug)]
pub struct AcceptedStream {
    tcp: TcpStream,
    read_ahead: Vec<u8>,
    replayed: usize,
}

impl AcceptedStream {
    pub fn new(tcp: TcpStream) -> Self {
        Self {
            tcp,
            read_ahead: Vec::new(),
            replayed: 0,
        }
    }

    /// Bytes read ahead and not yet handed to a reader.
    pub fn buffered(&self) -> usize {
        self.read_ahead.len() - self.replayed
    }

    /// Read ahead until the peer closes or resets the socket.
    ///
    /// Stays pending once [`READ_AHEAD_LIMIT`] bytes are buffered. Cancel
    /// safe: bytes already read are kept for replay.
    pub(crate) async fn peer_closed(&mut self) {
        let mut chunk = [0u8; 2048];
        loop {
            let room = READ_AHEAD_LIMIT - self.read_ahead.len();
            if room == 0 {
                return std::future::pending().await;
            }
            let limit = room.min(chunk.len());
            match self.tcp.read(&mut chunk[..limit]).await {
                Ok(0) | Err(_) => return,
                Ok(n) => self.read_ahead.extend_from_slice(&chunk[..n]),
            }
        }
    }
}

impl AsyncRead for AcceptedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.replayed < this.read_ahead.len() {
            let pending = &this.read_ahead[this.replayed..];
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            this.replayed += n;
            if this.replayed == this.read_ahead.len() {
                this.read_ahead = Vec::new();
                this.replayed = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.tcp).poll_read(cx, buf)
    }
}

impl AsyncWrite for AcceptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().tcp).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().tcp).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().tcp).poll_shutdown(cx)
    }
}

/// A plain or TLS-wrapped accepted socket.
#[derive(Debug)]
pub enum ServerStream {
    Plain(AcceptedStream),
    Tls(Box<TlsStream<AcceptedStream>>),
}

impl ServerStream {
    pub fn is_secure(&self) -> bool {
        matches!(self, ServerStream::Tls(_))
    }

    /// Whether the TLS handshake resumed a cached session.
    pub fn session_was_reused(&self) -> bool {
        match self {
            ServerStream::Plain(_) => false,
            ServerStream::Tls(tls) => {
                tls.get_ref().1.handshake_kind() == Some(rustls::HandshakeKind::Resumed)
            }
        }
    }

    /// Negotiated protocol version, e.g. `TLSv1_2`.
    pub fn protocol_version(&self) -> Option<String> {
        match self {
            ServerStream::Plain(_) => None,
            ServerStream::Tls(tls) => tls.get_ref().1.protocol_version().map(|v| format!("{v:?}")),
        }
    }

    /// Negotiated cipher suite name.
    pub fn cipher_suite(&self) -> Option<String> {
        match self {
            ServerStream::Plain(_) => None,
            ServerStream::Tls(tls) => tls
                .get_ref()
                .1
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
        }
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            ServerStream::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            ServerStream::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            ServerStream::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            ServerStream::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (AcceptedStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, client) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (AcceptedStream::new(accepted.unwrap().0), client.unwrap())
    }

    #[tokio::test]
    async fn read_ahead_is_replayed_before_socket() {
        let (mut server, mut client) = pair().await;
        client.write_all(b"early ").await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(200), server.peer_closed()).await;
        assert!(waited.is_err(), "client is still connected");
        assert_eq!(server.buffered(), 6);

        client.write_all(b"late").await.unwrap();
        let mut received = [0u8; 10];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"early late");
        assert_eq!(server.buffered(), 0);
    }

    #[tokio::test]
    async fn peer_closed_after_sending() {
        let (mut server, mut client) = pair().await;
        client.write_all(b"hello").await.unwrap();
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), server.peer_closed())
            .await
            .expect("close noticed");
        assert_eq!(server.buffered(), 5);
    }

    #[tokio::test]
    async fn read_ahead_is_bounded() {
        let (mut server, mut client) = pair().await;
        let flood = vec![b'x'; READ_AHEAD_LIMIT + 4096];
        let writer = tokio::spawn(async move {
            client.write_all(&flood).await.unwrap();
            client
        });

        let waited = tokio::time::timeout(Duration::from_millis(500), server.peer_closed()).await;
        assert!(waited.is_err());
        assert_eq!(server.buffered(), READ_AHEAD_LIMIT);

        // Nothing is lost past the limit; the rest comes from the socket.
        let _client = writer.await.unwrap();
        let mut received = vec![0u8; READ_AHEAD_LIMIT + 4096];
        server.read_exact(&mut received).await.unwrap();
        assert!(received.iter().all(|b| *b == b'x'));
    }
}
