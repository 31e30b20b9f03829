//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track connection state (Accepted → Queued | Running → Closed)
//! - Own the accepted socket until a worker takes it, and watch it while queued

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::net::stream::AcceptedStream;
use crate::pool::WorkerId;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
///
/// States only move forward: `Accepted → Queued → Running → Closed`, with
/// `Queued` optional and `Closed` reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Accepted by the listener, admission not yet decided.
    Accepted,
    /// Waiting in the pool queue for a worker.
    Queued,
    /// Being serviced by a worker.
    Running,
    /// Socket closed.
    Closed,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        next > self
    }
}

/// One accepted client link.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    /// Taken by the worker servicing the connection.
    stream: Option<AcceptedStream>,
    peer_addr: SocketAddr,
    accepted_at: Instant,
    state: ConnectionState,
    worker: Option<WorkerId>,
}

impl Connection {
    /// Wrap a freshly accepted socket.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            stream: Some(AcceptedStream::new(stream)),
            peer_addr,
            accepted_at: Instant::now(),
            state: ConnectionState::Accepted,
            worker: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    /// Time since the listener accepted the socket.
    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Worker currently servicing this connection, if running.
    pub fn worker(&self) -> Option<WorkerId> {
        self.worker
    }

    /// Bytes the client sent while queued, not yet handed to a worker.
    pub fn buffered(&self) -> usize {
        self.stream.as_ref().map_or(0, AcceptedStream::buffered)
    }

    /// Move to `next`. Backward or repeated transitions are ignored and
    /// reported as `false`.
    pub(crate) fn advance(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::warn!(
                connection_id = %self.id,
                from = ?self.state,
                to = ?next,
                "Ignoring backward connection state transition"
            );
            return false;
        }
        self.state = next;
        if next != ConnectionState::Running {
            self.worker = None;
        }
        true
    }

    /// Mark the connection as running on `worker`.
    pub(crate) fn assign(&mut self, worker: WorkerId) -> bool {
        let advanced = self.advance(ConnectionState::Running);
        if advanced {
            self.worker = Some(worker);
        }
        advanced
    }

    /// Resolve once the client closes or resets the socket. Stays pending
    /// after the stream was taken.
    pub(crate) async fn peer_closed(&mut self) {
        match &mut self.stream {
            Some(stream) => stream.peer_closed().await,
            None => std::future::pending().await,
        }
    }

    /// Hand the socket to the worker servicing this connection.
    pub(crate) fn take_stream(&mut self) -> Option<AcceptedStream> {
        self.stream.take()
    }

    /// Close the socket, if still held, and finish the lifecycle.
    pub(crate) fn close(mut self) {
        self.advance(ConnectionState::Closed);
        tracing::trace!(connection_id = %self.id, peer_addr = %self.peer_addr, "Connection closed");
    }
}
