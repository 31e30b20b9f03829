//! The server: accept loop wired to the connection pool.
//!
//! # Responsibilities
//! - Own the listening socket and run the accept loop
//! - Hand every accepted connection to the pool, close rejected ones
//! - Expose the pool counters and the TLS session cache
//! - Ordered stop: accept loop, queue, running connections, session cache

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::lifecycle::Shutdown;
use crate::net::listener::accept_backoff;
use crate::net::{Connection, Listener, ListenerError};
use crate::pool::{Admission, ConnectionPool, PoolStats};
use crate::server::handler::ConnectionHandler;
use crate::server::service::HandlerService;
use crate::tls::ServerTlsContext;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("Server already started")]
    AlreadyStarted,

    #[error("Server has been stopped")]
    Stopped,
}

enum Lifecycle {
    /// Bound, not yet accepting.
    Ready(Listener),
    Running(JoinHandle<()>),
    Stopped,
}

/// Concurrent TCP server with optional TLS.
pub struct TcpServer {
    local_addr: SocketAddr,
    pool: ConnectionPool,
    tls: Option<ServerTlsContext>,
    shutdown: Shutdown,
    shutdown_grace: Duration,
    lifecycle: Mutex<Lifecycle>,
}

impl TcpServer {
    /// Build a server on an already bound listener. Nothing is accepted
    /// until [`TcpServer::start`].
    pub fn new(
        listener: Listener,
        handler: Arc<dyn ConnectionHandler>,
        config: &ServerConfig,
        tls: Option<ServerTlsContext>,
    ) -> Self {
        let service = HandlerService::new(handler, tls.clone(), config.timeouts.handshake());
        let pool = ConnectionPool::new(&config.pool, Arc::new(service));

        Self {
            local_addr: listener.local_addr(),
            pool,
            tls,
            shutdown: Shutdown::new(),
            shutdown_grace: config.timeouts.shutdown_grace(),
            lifecycle: Mutex::new(Lifecycle::Ready(listener)),
        }
    }

    /// Bind the configured address and build the server.
    pub async fn bind(
        config: &ServerConfig,
        handler: Arc<dyn ConnectionHandler>,
        tls: Option<ServerTlsContext>,
    ) -> Result<Self, ServerError> {
        let listener = Listener::bind(&config.listener).await?;
        Ok(Self::new(listener, handler, config, tls))
    }

    /// Spawn the accept loop. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle();
        let listener = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Ready(listener) => listener,
            Lifecycle::Running(task) => {
                *lifecycle = Lifecycle::Running(task);
                return Err(ServerError::AlreadyStarted);
            }
            Lifecycle::Stopped => return Err(ServerError::Stopped),
        };

        let limits = self.pool.limits();
        tracing::info!(
            address = %self.local_addr,
            secure = self.tls.is_some(),
            max_threads = limits.max_threads,
            max_queued = limits.max_queued,
            thread_idle_ms = limits.idle_time.as_millis() as u64,
            "Server started"
        );

        let task = tokio::spawn(accept_loop(listener, self.pool.clone(), self.shutdown.clone()));
        *lifecycle = Lifecycle::Running(task);
        Ok(())
    }

    /// Stop accepting, close the listener, discard queued connections and
    /// drain running ones. Returns the final counters.
    pub async fn stop(&self) -> Result<PoolStats, ServerError> {
        let task = match std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped) {
            Lifecycle::Running(task) => Some(task),
            // Never started: the listener is dropped here.
            Lifecycle::Ready(_) => None,
            Lifecycle::Stopped => return Err(ServerError::Stopped),
        };

        tracing::info!(address = %self.local_addr, "Stopping server");
        self.shutdown.trigger();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Accept loop ended abnormally");
            }
        }

        let stats = self.pool.shutdown(self.shutdown_grace).await;
        // Sessions do not outlive the server instance.
        self.flush_session_cache();
        tracing::info!(
            total_connections = stats.total_connections,
            current_connections = stats.current_connections,
            "Server stopped"
        );
        Ok(stats)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn current_connections(&self) -> usize {
        self.pool.current_connections()
    }

    pub fn current_threads(&self) -> usize {
        self.pool.current_threads()
    }

    pub fn queued_connections(&self) -> usize {
        self.pool.queued_connections()
    }

    pub fn total_connections(&self) -> u64 {
        self.pool.total_connections()
    }

    /// All counters from one consistent snapshot.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn tls(&self) -> Option<&ServerTlsContext> {
        self.tls.as_ref()
    }

    /// Invalidate every cached TLS session. No-op for a plain server.
    pub fn flush_session_cache(&self) {
        if let Some(tls) = &self.tls {
            tls.flush_session_cache();
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().expect("server lifecycle mutex poisoned")
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr)
            .field("secure", &self.tls.is_some())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(listener: Listener, pool: ConnectionPool, shutdown: Shutdown) {
    let mut failures = 0u32;

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                failures = 0;
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(peer_addr = %peer_addr, error = %e, "Cannot set TCP_NODELAY");
                }
                match pool.submit(Connection::new(stream, peer_addr)) {
                    Admission::Run(_) | Admission::Queued => {}
                    Admission::Rejected(connection) => connection.close(),
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = accept_backoff(failures);
                tracing::warn!(
                    error = %e,
                    consecutive_failures = failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Accept failed"
                );
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    tracing::info!(address = %listener.local_addr(), "Accept loop stopped, listener closed");
}
