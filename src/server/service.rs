//! Per-connection duty cycle: optional TLS handshake, then the handler.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::AsyncWriteExt;

use crate::net::{Connection, ServerStream};
use crate::observability::metrics;
use crate::pool::{ConnectionService, ServeError};
use crate::server::handler::{ConnectionContext, ConnectionHandler};
use crate::tls::ServerTlsContext;

/// Runs a [`ConnectionHandler`] over plain TCP or TLS.
pub struct HandlerService {
    handler: Arc<dyn ConnectionHandler>,
    tls: Option<ServerTlsContext>,
    handshake_timeout: Duration,
}

impl HandlerService {
    pub fn new(
        handler: Arc<dyn ConnectionHandler>,
        tls: Option<ServerTlsContext>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            handler,
            tls,
            handshake_timeout,
        }
    }

    async fn run(&self, connection: &mut Connection) -> Result<(), ServeError> {
        let id = connection.id();
        let peer_addr = connection.peer_addr();
        let accepted_at = connection.accepted_at();
        let worker = connection.worker();
        let tcp = connection.take_stream().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "connection stream already taken")
        })?;

        let mut stream = match &self.tls {
            Some(tls) => match tls.accept(tcp, self.handshake_timeout).await {
                Ok(tls_stream) => {
                    let stream = ServerStream::Tls(Box::new(tls_stream));
                    let kind = if stream.session_was_reused() { "resumed" } else { "full" };
                    metrics::record_handshake(kind);
                    let protocol = stream.protocol_version().unwrap_or_default();
                    let cipher_suite = stream.cipher_suite().unwrap_or_default();
                    tracing::debug!(
                        connection_id = %id,
                        peer_addr = %peer_addr,
                        handshake = kind,
                        protocol = %protocol,
                        cipher_suite = %cipher_suite,
                        "TLS handshake complete"
                    );
                    stream
                }
                Err(e) => {
                    metrics::record_handshake("failed");
                    return Err(e.into());
                }
            },
            None => ServerStream::Plain(tcp),
        };

        let context = ConnectionContext {
            id,
            peer_addr,
            accepted_at,
            worker,
            secure: stream.is_secure(),
            session_reused: stream.session_was_reused(),
        };

        let result = self.handler.handle(&mut stream, &context).await;
        // Best effort: the peer may already be gone.
        let _ = stream.shutdown().await;
        result.map_err(ServeError::from)
    }
}

impl ConnectionService for HandlerService {
    fn serve<'a>(&'a self, connection: &'a mut Connection) -> BoxFuture<'a, Result<(), ServeError>> {
        Box::pin(self.run(connection))
    }
}

impl std::fmt::Debug for HandlerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerService")
            .field("tls", &self.tls)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}
