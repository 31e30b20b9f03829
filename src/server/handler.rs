//! Application logic run on each connection.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::net::{ConnectionId, ServerStream};
use crate::pool::WorkerId;

/// Echo buffer size.
const ECHO_BUFFER_SIZE: usize = 256;

/// What a handler knows about the connection it is serving.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub accepted_at: Instant,
    pub worker: Option<WorkerId>,
    /// Whether the stream is TLS.
    pub secure: bool,
    /// Whether the TLS handshake resumed a cached session.
    pub session_reused: bool,
}

/// Per-connection application logic.
///
/// The handler runs after the TLS handshake (if any) and owns the stream
/// until it returns. Returning, with or without error, closes the connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        stream: &'a mut ServerStream,
        context: &'a ConnectionContext,
    ) -> BoxFuture<'a, io::Result<()>>;
}

/// Writes back everything it reads until the peer closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn handle<'a>(
        &'a self,
        stream: &'a mut ServerStream,
        context: &'a ConnectionContext,
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let mut buf = [0u8; ECHO_BUFFER_SIZE];
            let mut echoed = 0u64;
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                stream.write_all(&buf[..n]).await?;
                echoed += n as u64;
            }
            tracing::trace!(connection_id = %context.id, bytes = echoed, "Echo finished");
            Ok(())
        })
    }
}

/// Completes the handshake and closes right away.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeOnlyHandler;

impl ConnectionHandler for HandshakeOnlyHandler {
    fn handle<'a>(
        &'a self,
        _stream: &'a mut ServerStream,
        context: &'a ConnectionContext,
    ) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            tracing::trace!(
                connection_id = %context.id,
                session_reused = context.session_reused,
                "Handshake-only connection done"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::AcceptedStream;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (ServerStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, client) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        let (server, peer) = accepted.unwrap();
        (ServerStream::Plain(AcceptedStream::new(server)), client.unwrap(), peer)
    }

    fn context(peer_addr: SocketAddr) -> ConnectionContext {
        ConnectionContext {
            id: ConnectionId::new(),
            peer_addr,
            accepted_at: Instant::now(),
            worker: None,
            secure: false,
            session_reused: false,
        }
    }

    #[tokio::test]
    async fn echo_returns_bytes_until_eof() {
        let (mut server, mut client, peer) = pair().await;
        let ctx = context(peer);
        let task = tokio::spawn(async move { EchoHandler.handle(&mut server, &ctx).await });

        // Larger than one buffer.
        let message = vec![b'x'; ECHO_BUFFER_SIZE * 3 + 7];
        client.write_all(&message).await.unwrap();
        let mut echoed = vec![0u8; message.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, message);

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handshake_only_returns_immediately() {
        let (mut server, _client, peer) = pair().await;
        HandshakeOnlyHandler
            .handle(&mut server, &context(peer))
            .await
            .unwrap();
    }
}
