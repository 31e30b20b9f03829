//! Pool workers.
//!
//! A worker is a task that services one connection at a time. After each
//! connection it reports back to the pool, which either promotes the oldest
//! queued connection onto it, parks it on the idle list, or tells it to exit.
//! Idle workers retire after the configured idle time.

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::net::Connection;
use crate::pool::dispatcher::ConnectionPool;
use crate::pool::state::{QueuedEntry, Release, WorkerId};
use crate::tls::TlsError;

/// Why servicing a connection ended early.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] TlsError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The duty cycle a worker runs for each connection.
///
/// The service takes the socket with [`Connection::take_stream`]; the worker
/// closes the connection once the future completes.
pub trait ConnectionService: Send + Sync + 'static {
    fn serve<'a>(&'a self, connection: &'a mut Connection) -> BoxFuture<'a, Result<(), ServeError>>;
}

pub(crate) struct Worker {
    id: WorkerId,
    pool: ConnectionPool,
    inbox: mpsc::Receiver<Connection>,
}

/// Reports the worker's exit to the pool however the task ends, including
/// when it is aborted mid-connection.
struct ExitGuard {
    id: WorkerId,
    pool: ConnectionPool,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.pool.worker_exited(self.id);
    }
}

impl Worker {
    pub(crate) fn new(id: WorkerId, pool: ConnectionPool, inbox: mpsc::Receiver<Connection>) -> Self {
        Self { id, pool, inbox }
    }

    pub(crate) async fn run(mut self, first: Connection) {
        let _exit = ExitGuard {
            id: self.id,
            pool: self.pool.clone(),
        };
        tracing::debug!(worker_id = %self.id, "Worker started");

        let mut next = Some(first);
        while let Some(connection) = next {
            self.serve(connection).await;
            next = self.next_connection().await;
        }
    }

    async fn serve(&self, mut connection: Connection) {
        connection.assign(self.id);
        let connection_id = connection.id();
        let peer_addr = connection.peer_addr();
        let service = self.pool.service();

        let outcome = AssertUnwindSafe(service.serve(&mut connection)).catch_unwind().await;
        connection.close();

        match outcome {
            Ok(Ok(())) => {
                tracing::debug!(
                    worker_id = %self.id,
                    connection_id = %connection_id,
                    peer_addr = %peer_addr,
                    "Connection finished"
                );
            }
            Ok(Err(ServeError::Handshake(e))) => {
                tracing::warn!(
                    worker_id = %self.id,
                    connection_id = %connection_id,
                    peer_addr = %peer_addr,
                    error = %e,
                    "Handshake failed, closing connection"
                );
            }
            Ok(Err(ServeError::Io(e))) => {
                tracing::debug!(
                    worker_id = %self.id,
                    connection_id = %connection_id,
                    peer_addr = %peer_addr,
                    error = %e,
                    "Connection ended with I/O error"
                );
            }
            Err(panic) => {
                tracing::error!(
                    worker_id = %self.id,
                    connection_id = %connection_id,
                    peer_addr = %peer_addr,
                    panic = panic_message(&*panic),
                    "Connection handler panicked"
                );
            }
        }
    }

    /// Report completion and wait for the next connection, if any.
    async fn next_connection(&mut self) -> Option<Connection> {
        loop {
            match self.pool.worker_idle(self.id) {
                Release::Promote(entry) => {
                    if let Some(connection) = claim(entry).await {
                        return Some(connection);
                    }
                    // The parked task is gone; release the slot and look again.
                }
                Release::Idle => return self.wait_idle().await,
                Release::Exit => return None,
            }
        }
    }

    async fn wait_idle(&mut self) -> Option<Connection> {
        let idle_time = self.pool.idle_time();
        let shutdown = self.pool.shutdown_signal().clone();

        tokio::select! {
            connection = self.inbox.recv() => connection,
            _ = tokio::time::sleep(idle_time) => {
                let next = self.pool.retire(self.id, &mut self.inbox);
                if next.is_none() {
                    tracing::debug!(
                        worker_id = %self.id,
                        idle_ms = idle_time.as_millis() as u64,
                        "Idle worker retired"
                    );
                }
                next
            }
            _ = shutdown.wait() => self.pool.retire(self.id, &mut self.inbox),
        }
    }
}

/// Ask the parked task for its connection.
async fn claim(entry: QueuedEntry) -> Option<Connection> {
    let (tx, rx) = oneshot::channel();
    if entry.handoff.send(tx).is_err() {
        tracing::debug!(connection_id = %entry.connection_id, "Queued connection vanished before promotion");
        return None;
    }
    rx.await.ok()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
