//! Admission control and worker dispatch.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};

use crate::config::PoolConfig;
use crate::lifecycle::Shutdown;
use crate::net::{Connection, ConnectionState};
use crate::observability::metrics;
use crate::pool::state::{Placement, PoolLimits, PoolState, PoolStats, Release, WorkerId};
use crate::pool::worker::{ConnectionService, Worker};

/// How long to wait for aborted workers to unwind during shutdown.
const ABORT_WAIT: Duration = Duration::from_secs(1);

/// Outcome of [`ConnectionPool::submit`].
#[derive(Debug)]
pub enum Admission {
    /// Running on this worker.
    Run(WorkerId),
    /// Waiting for a worker.
    Queued,
    /// Pool and queue are full. The caller owns the connection again and
    /// must close it.
    Rejected(Connection),
}

/// Bounded set of workers with a FIFO overflow queue.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

struct Shared {
    limits: PoolLimits,
    service: Arc<dyn ConnectionService>,
    state: Mutex<PoolState>,
    drained: Notify,
    shutdown: Shutdown,
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig, service: Arc<dyn ConnectionService>) -> Self {
        Self::with_limits(PoolLimits::from(config), service)
    }

    pub fn with_limits(limits: PoolLimits, service: Arc<dyn ConnectionService>) -> Self {
        Self {
            shared: Arc::new(Shared {
                limits,
                service,
                state: Mutex::new(PoolState::new()),
                drained: Notify::new(),
                shutdown: Shutdown::new(),
            }),
        }
    }

    /// Admit `connection`: run it now, queue it, or hand it back.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, mut connection: Connection) -> Admission {
        let limits = self.shared.limits;
        let mut state = self.lock();

        loop {
            match state.place(&limits) {
                Placement::Reuse(worker) => {
                    let Some(inbox) = state.inbox(worker) else {
                        continue;
                    };
                    match inbox.try_send(connection) {
                        Ok(()) => {
                            state.admit_running(worker);
                            return self.admitted(&state, Admission::Run(worker), "run");
                        }
                        // The worker is being torn down; try the next option.
                        Err(e) => connection = e.into_inner(),
                    }
                }
                Placement::Spawn => {
                    let (tx, rx) = mpsc::channel(1);
                    let worker = state.add_worker(tx);
                    let task = tokio::spawn(Worker::new(worker, self.clone(), rx).run(connection));
                    state.set_abort(worker, task.abort_handle());
                    state.admit_running(worker);
                    return self.admitted(&state, Admission::Run(worker), "run");
                }
                Placement::Queue => {
                    connection.advance(ConnectionState::Queued);
                    let (tx, rx) = oneshot::channel();
                    let entry = state.admit_queued(connection.id(), tx);
                    tokio::spawn(park(self.clone(), entry, connection, rx));
                    return self.admitted(&state, Admission::Queued, "queue");
                }
                Placement::Reject => {
                    metrics::record_admission("reject");
                    tracing::warn!(
                        connection_id = %connection.id(),
                        peer_addr = %connection.peer_addr(),
                        current_connections = state.current_connections,
                        queued_connections = state.queued_connections,
                        "Pool saturated, rejecting connection"
                    );
                    return Admission::Rejected(connection);
                }
            }
        }
    }

    fn admitted(
        &self,
        state: &PoolState,
        admission: Admission,
        outcome: &'static str,
    ) -> Admission {
        metrics::record_admission(outcome);
        let stats = state.snapshot(&self.shared.limits);
        metrics::record_pool_stats(&stats);
        tracing::debug!(
            outcome,
            current_connections = stats.current_connections,
            current_threads = stats.current_threads,
            queued_connections = stats.queued_connections,
            total_connections = stats.total_connections,
            "Connection admitted"
        );
        admission
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().snapshot(&self.shared.limits)
    }

    pub fn current_connections(&self) -> usize {
        self.lock().current_connections
    }

    pub fn current_threads(&self) -> usize {
        self.lock().current_threads
    }

    pub fn queued_connections(&self) -> usize {
        self.lock().queued_connections
    }

    pub fn total_connections(&self) -> u64 {
        self.lock().total_connections
    }

    pub fn limits(&self) -> PoolLimits {
        self.shared.limits
    }

    /// Stop admitting, discard queued connections, give running ones
    /// `grace` to finish, then abort the rest. Returns the final counters.
    pub async fn shutdown(&self, grace: Duration) -> PoolStats {
        let discarded = self.lock().close();
        if !discarded.is_empty() {
            tracing::info!(count = discarded.len(), "Discarding queued connections");
        }
        // Dropping the handoffs closes the parked sockets.
        drop(discarded);
        self.shared.shutdown.trigger();

        if !self.wait_drained(grace).await {
            let handles = self.lock().abort_handles();
            tracing::warn!(
                workers = handles.len(),
                grace_ms = grace.as_millis() as u64,
                "Aborting workers still running after grace period"
            );
            for handle in handles {
                handle.abort();
            }
            if !self.wait_drained(ABORT_WAIT).await {
                tracing::error!(stats = ?self.stats(), "Pool did not drain after abort");
            }
        }

        let stats = self.stats();
        metrics::record_pool_stats(&stats);
        stats
    }

    async fn wait_drained(&self, limit: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.shared.drained.notified();
                if self.lock().is_drained() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }

    /// Report that `worker` finished its connection.
    pub(crate) fn worker_idle(&self, worker: WorkerId) -> Release {
        let mut state = self.lock();
        let release = state.release(worker);
        let stats = state.snapshot(&self.shared.limits);
        drop(state);

        metrics::record_pool_stats(&stats);
        if let Release::Promote(entry) = &release {
            tracing::debug!(
                worker_id = %worker,
                connection_id = %entry.connection_id,
                queued_connections = stats.queued_connections,
                "Promoting queued connection"
            );
        }
        self.notify_if_drained(&stats);
        release
    }

    /// Retire an idle worker, unless a connection was routed to it first.
    pub(crate) fn retire(
        &self,
        worker: WorkerId,
        inbox: &mut mpsc::Receiver<Connection>,
    ) -> Option<Connection> {
        let mut state = self.lock();
        if state.retire(worker) {
            return None;
        }
        // `submit` sends under this lock, so the connection is already here.
        inbox.try_recv().ok()
    }

    /// Drop a queued entry whose client disconnected.
    pub(crate) fn abandon(&self, entry: u64) -> bool {
        let mut state = self.lock();
        let abandoned = state.abandon(entry);
        let stats = state.snapshot(&self.shared.limits);
        drop(state);

        if abandoned {
            metrics::record_pool_stats(&stats);
            self.notify_if_drained(&stats);
        }
        abandoned
    }

    pub(crate) fn worker_exited(&self, worker: WorkerId) {
        let mut state = self.lock();
        let was_busy = state.remove_worker(worker);
        let drained = state.is_drained();
        let stats = state.snapshot(&self.shared.limits);
        drop(state);

        if was_busy {
            tracing::warn!(worker_id = %worker, "Worker stopped while servicing a connection");
        }
        tracing::trace!(worker_id = %worker, "Worker exited");
        metrics::record_pool_stats(&stats);
        if drained {
            self.shared.drained.notify_waiters();
        }
    }

    pub(crate) fn service(&self) -> Arc<dyn ConnectionService> {
        self.shared.service.clone()
    }

    pub(crate) fn idle_time(&self) -> Duration {
        self.shared.limits.idle_time
    }

    pub(crate) fn shutdown_signal(&self) -> &Shutdown {
        &self.shared.shutdown
    }

    fn notify_if_drained(&self, stats: &PoolStats) {
        if stats.current_connections == 0 && stats.queued_connections == 0 {
            self.shared.drained.notify_waiters();
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.shared.state.lock().expect("pool state mutex poisoned")
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("limits", &self.shared.limits)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Hold a queued connection until a worker claims it or the client leaves.
///
/// Whatever the client sends meanwhile is buffered on the connection and
/// replayed to the worker.
async fn park(
    pool: ConnectionPool,
    entry: u64,
    mut connection: Connection,
    mut handoff: oneshot::Receiver<oneshot::Sender<Connection>>,
) {
    let reply = tokio::select! {
        reply = &mut handoff => reply.ok(),
        _ = connection.peer_closed() => {
            if pool.abandon(entry) {
                tracing::debug!(
                    connection_id = %connection.id(),
                    waited_ms = connection.age().as_millis() as u64,
                    buffered = connection.buffered(),
                    "Queued client disconnected"
                );
                connection.close();
                return;
            }
            // A worker already took this entry; its request is on the way.
            (&mut handoff).await.ok()
        }
    };

    match reply {
        Some(tx) => {
            if let Err(connection) = tx.send(connection) {
                connection.close();
            }
        }
        None => {
            tracing::debug!(connection_id = %connection.id(), "Queued connection discarded");
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::pool::worker::ServeError;

    /// Writes one byte on start, then reads until EOF.
    struct DrainService;

    impl ConnectionService for DrainService {
        fn serve<'a>(&'a self, connection: &'a mut Connection) -> BoxFuture<'a, Result<(), ServeError>> {
            Box::pin(async move {
                let Some(mut stream) = connection.take_stream() else {
                    return Ok(());
                };
                stream.write_all(b"!").await?;
                let mut buf = [0u8; 64];
                while stream.read(&mut buf).await? > 0 {}
                Ok(())
            })
        }
    }

    /// Echoes everything until EOF.
    struct EchoService;

    impl ConnectionService for EchoService {
        fn serve<'a>(&'a self, connection: &'a mut Connection) -> BoxFuture<'a, Result<(), ServeError>> {
            Box::pin(async move {
                let Some(mut stream) = connection.take_stream() else {
                    return Ok(());
                };
                let mut buf = [0u8; 64];
                loop {
                    let n = stream.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    stream.write_all(&buf[..n]).await?;
                }
            })
        }
    }

    /// Returns without touching the socket.
    struct NoopService;

    impl ConnectionService for NoopService {
        fn serve<'a>(&'a self, _connection: &'a mut Connection) -> BoxFuture<'a, Result<(), ServeError>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct PanicService;

    impl ConnectionService for PanicService {
        fn serve<'a>(&'a self, _connection: &'a mut Connection) -> BoxFuture<'a, Result<(), ServeError>> {
            Box::pin(async move { panic!("handler exploded") })
        }
    }

    struct StuckService;

    impl ConnectionService for StuckService {
        fn serve<'a>(&'a self, _connection: &'a mut Connection) -> BoxFuture<'a, Result<(), ServeError>> {
            Box::pin(std::future::pending())
        }
    }

    fn pool(max_threads: usize, max_queued: usize, service: impl ConnectionService) -> ConnectionPool {
        ConnectionPool::with_limits(
            PoolLimits {
                max_threads,
                max_queued,
                idle_time: Duration::from_secs(10),
            },
            Arc::new(service),
        )
    }

    async fn connect(listener: &TcpListener) -> (Connection, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (accepted, client) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        let (stream, peer) = accepted.unwrap();
        (Connection::new(stream, peer), client.unwrap())
    }

    async fn settle(pool: &ConnectionPool, check: impl Fn(&PoolStats) -> bool) -> PoolStats {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats = pool.stats();
            if check(&stats) {
                return stats;
            }
            assert!(tokio::time::Instant::now() < deadline, "pool did not settle: {stats:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn started(client: &mut TcpStream) {
        let mut byte = [0u8; 1];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut byte))
            .await
            .expect("connection should start")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admits_runs_queues_and_rejects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = pool(2, 1, DrainService);

        let mut clients = Vec::new();
        for expected in ["run", "run", "queue", "reject"] {
            let (connection, client) = connect(&listener).await;
            let admission = pool.submit(connection);
            match (expected, admission) {
                ("run", Admission::Run(_)) | ("queue", Admission::Queued) => {}
                ("reject", Admission::Rejected(connection)) => connection.close(),
                (expected, other) => panic!("expected {expected}, got {other:?}"),
            }
            clients.push(client);
        }

        let stats = pool.stats();
        assert_eq!(stats.current_connections, 2);
        assert_eq!(stats.current_threads, 2);
        assert_eq!(stats.queued_connections, 1);
        assert_eq!(stats.total_connections, 3);

        drop(clients);
        let stats = settle(&pool, |s| s.current_connections == 0 && s.queued_connections == 0).await;
        assert_eq!(stats.total_connections, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_threads_rejects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = pool(0, 8, DrainService);
        let (connection, _client) = connect(&listener).await;

        assert!(matches!(pool.submit(connection), Admission::Rejected(_)));
        assert_eq!(pool.stats(), PoolStats {
            max_queued: 8,
            ..PoolStats::default()
        });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn promotes_queued_connections_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = pool(1, 2, DrainService);

        let (running, mut first) = connect(&listener).await;
        let (queued_a, mut second) = connect(&listener).await;
        let (queued_b, mut third) = connect(&listener).await;
        pool.submit(running);
        pool.submit(queued_a);
        pool.submit(queued_b);
        started(&mut first).await;
        assert_eq!(pool.queued_connections(), 2);

        drop(first);
        started(&mut second).await;
        let stats = settle(&pool, |s| s.queued_connections == 1).await;
        assert_eq!(stats.current_connections, 1);

        // Still queued: nothing has been written to it.
        let mut byte = [0u8; 1];
        let pending = tokio::time::timeout(Duration::from_millis(50), third.read(&mut byte)).await;
        assert!(pending.is_err());

        drop(second);
        started(&mut third).await;
        drop(third);
        let stats = settle(&pool, |s| s.current_connections == 0).await;
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.idle_threads, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_client_leaving_frees_its_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = pool(1, 1, DrainService);

        let (running, mut first) = connect(&listener).await;
        let (queued, second) = connect(&listener).await;
        pool.submit(running);
        assert!(matches!(pool.submit(queued), Admission::Queued));
        started(&mut first).await;

        drop(second);
        let stats = settle(&pool, |s| s.queued_connections == 0).await;
        assert_eq!(stats.current_connections, 1);
        assert_eq!(stats.total_connections, 2);

        drop(first);
        settle(&pool, |s| s.current_connections == 0).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_client_leaving_after_sending_frees_its_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = pool(1, 1, DrainService);

        let (running, mut first) = connect(&listener).await;
        let (queued, mut second) = connect(&listener).await;
        pool.submit(running);
        assert!(matches!(pool.submit(queued), Admission::Queued));
        started(&mut first).await;

        second.write_all(b"hello").await.unwrap();
        drop(second);
        let stats = settle(&pool, |s| s.queued_connections == 0).await;
        assert_eq!(stats.current_connections, 1);

        // The slot is free again for a live client.
        let (next, _third) = connect(&listener).await;
        assert!(matches!(pool.submit(next), Admission::Queued));
        assert_eq!(pool.queued_connections(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bytes_sent_while_queued_reach_the_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = pool(1, 1, EchoService);

        let (running, mut first) = connect(&listener).await;
        let (queued, mut second) = connect(&listener).await;
        pool.submit(running);
        pool.submit(queued);
        first.write_all(b"a").await.unwrap();
        let mut byte = [0u8; 1];
        first.read_exact(&mut byte).await.unwrap();

        second.write_all(b"early").await.unwrap();
        settle(&pool, |s| s.queued_connections == 1).await;
        drop(first);

        second.write_all(b" late").await.unwrap();
        let mut echoed = [0u8; 10];
        tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut echoed))
            .await
            .expect("promoted connection should echo")
            .unwrap();
        assert_eq!(&echoed, b"early late");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_workers_retire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = ConnectionPool::with_limits(
            PoolLimits {
                max_threads: 2,
                max_queued: 0,
                idle_time: Duration::from_millis(50),
            },
            Arc::new(DrainService),
        );

        let (connection, mut client) = connect(&listener).await;
        pool.submit(connection);
        started(&mut client).await;
        drop(client);

        settle(&pool, |s| s.current_threads == 0 && s.idle_threads == 1).await;
        settle(&pool, |s| s.idle_threads == 0).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_closes_connection_after_service_returns() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = pool(1, 0, NoopService);

        let (connection, mut client) = connect(&listener).await;
        assert!(matches!(pool.submit(connection), Admission::Run(_)));

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("socket should be closed by the worker");
        assert!(matches!(read, Ok(0) | Err(_)));
        let stats = settle(&pool, |s| s.current_connections == 0).await;
        assert_eq!(stats.idle_threads, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_service_still_releases_counters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = pool(1, 1, PanicService);

        let (connection, _client) = connect(&listener).await;
        pool.submit(connection);

        let stats = settle(&pool, |s| s.current_connections == 0).await;
        assert_eq!(stats.current_threads, 0);
        assert_eq!(stats.total_connections, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_discards_queue_and_aborts_stuck_workers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = pool(1, 2, StuckService);

        let (running, _first) = connect(&listener).await;
        let (queued, mut second) = connect(&listener).await;
        pool.submit(running);
        pool.submit(queued);

        let stats = pool.shutdown(Duration::from_millis(50)).await;
        assert_eq!(stats.current_connections, 0);
        assert_eq!(stats.current_threads, 0);
        assert_eq!(stats.queued_connections, 0);
        assert_eq!(stats.total_connections, 2);

        // The discarded connection is closed without being serviced.
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .expect("queued socket should be closed");
        assert!(matches!(read, Ok(0) | Err(_)));

        let (late, _late_client) = connect(&listener).await;
        assert!(matches!(pool.submit(late), Admission::Rejected(_)));
    }
}
