//! Pool bookkeeping: counters, idle workers and the FIFO queue.
//!
//! Everything here is plain data mutated under the pool mutex. Each method
//! is one transition, so the four counters never disagree with each other
//! when observed from outside the lock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::config::PoolConfig;
use crate::net::{Connection, ConnectionId};

/// Identifier of a pool worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Point-in-time view of the pool, taken in one critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Connections being serviced.
    pub current_connections: usize,
    /// Busy workers. Always equal to `current_connections`.
    pub current_threads: usize,
    /// Connections waiting for a worker.
    pub queued_connections: usize,
    /// Connections ever admitted (run or queued). Never decreases.
    pub total_connections: u64,
    /// Workers alive but without a connection.
    pub idle_threads: usize,
    pub max_threads: usize,
    pub max_queued: usize,
}

/// Pool limits resolved from configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_threads: usize,
    pub max_queued: usize,
    pub idle_time: Duration,
}

impl From<&PoolConfig> for PoolLimits {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_threads: config.max_threads,
            max_queued: config.max_queued,
            idle_time: config.thread_idle_time(),
        }
    }
}

/// Where an incoming connection goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Hand it to this idle worker.
    Reuse(WorkerId),
    /// Start a new worker for it.
    Spawn,
    /// Park it in the queue.
    Queue,
    Reject,
}

/// What a worker does after finishing a connection.
#[derive(Debug)]
pub(crate) enum Release {
    /// Take over the oldest queued connection.
    Promote(QueuedEntry),
    /// Wait on the inbox for new work.
    Idle,
    /// The pool is shutting down.
    Exit,
}

/// Channel a promoted worker uses to receive the parked connection.
pub(crate) type Handoff = oneshot::Sender<oneshot::Sender<Connection>>;

/// A parked connection waiting for a worker.
#[derive(Debug)]
pub(crate) struct QueuedEntry {
    pub(crate) id: u64,
    pub(crate) connection_id: ConnectionId,
    pub(crate) handoff: Handoff,
}

#[derive(Debug)]
pub(crate) struct WorkerSlot {
    pub(crate) inbox: mpsc::Sender<Connection>,
    pub(crate) abort: Option<AbortHandle>,
    pub(crate) busy: bool,
}

#[derive(Debug)]
pub(crate) struct PoolState {
    pub(crate) current_connections: usize,
    pub(crate) current_threads: usize,
    pub(crate) queued_connections: usize,
    pub(crate) total_connections: u64,
    idle: Vec<WorkerId>,
    queue: VecDeque<QueuedEntry>,
    workers: HashMap<WorkerId, WorkerSlot>,
    accepting: bool,
    next_worker: u64,
    next_entry: u64,
}

impl PoolState {
    pub(crate) fn new() -> Self {
        Self {
            current_connections: 0,
            current_threads: 0,
            queued_connections: 0,
            total_connections: 0,
            idle: Vec::new(),
            queue: VecDeque::new(),
            workers: HashMap::new(),
            accepting: true,
            next_worker: 1,
            next_entry: 1,
        }
    }

    /// Decide where the next connection goes. A reused worker is taken off
    /// the idle list.
    ///
    /// The most recently idled worker is reused first, so surplus workers
    /// age out through the idle timeout.
    pub(crate) fn place(&mut self, limits: &PoolLimits) -> Placement {
        if !self.accepting || limits.max_threads == 0 {
            return Placement::Reject;
        }
        if let Some(worker) = self.idle.pop() {
            return Placement::Reuse(worker);
        }
        if self.current_threads < limits.max_threads {
            return Placement::Spawn;
        }
        if self.queued_connections < limits.max_queued {
            return Placement::Queue;
        }
        Placement::Reject
    }

    /// Allocate an id and register a worker that is about to run.
    pub(crate) fn add_worker(&mut self, inbox: mpsc::Sender<Connection>) -> WorkerId {
        let id = WorkerId::new(self.next_worker);
        self.next_worker += 1;
        self.workers.insert(
            id,
            WorkerSlot {
                inbox,
                abort: None,
                busy: false,
            },
        );
        id
    }

    pub(crate) fn set_abort(&mut self, worker: WorkerId, abort: AbortHandle) {
        if let Some(slot) = self.workers.get_mut(&worker) {
            slot.abort = Some(abort);
        }
    }

    pub(crate) fn inbox(&self, worker: WorkerId) -> Option<&mpsc::Sender<Connection>> {
        self.workers.get(&worker).map(|slot| &slot.inbox)
    }

    /// A newly admitted connection starts running on `worker`.
    pub(crate) fn admit_running(&mut self, worker: WorkerId) {
        self.current_connections += 1;
        self.current_threads += 1;
        self.total_connections += 1;
        self.set_busy(worker, true);
    }

    /// A newly admitted connection is parked. Returns the queue entry id.
    pub(crate) fn admit_queued(&mut self, connection_id: ConnectionId, handoff: Handoff) -> u64 {
        let id = self.next_entry;
        self.next_entry += 1;
        self.queue.push_back(QueuedEntry {
            id,
            connection_id,
            handoff,
        });
        self.queued_connections += 1;
        self.total_connections += 1;
        id
    }

    /// `worker` finished its connection. Promotes the head of the queue onto
    /// the same worker in the same step, so a promotion never shows up as a
    /// dip in the running counters.
    pub(crate) fn release(&mut self, worker: WorkerId) -> Release {
        self.current_connections -= 1;
        self.current_threads -= 1;
        self.set_busy(worker, false);

        if !self.accepting {
            return Release::Exit;
        }

        match self.queue.pop_front() {
            Some(entry) => {
                self.queued_connections -= 1;
                self.current_connections += 1;
                self.current_threads += 1;
                self.set_busy(worker, true);
                Release::Promote(entry)
            }
            None => {
                self.idle.push(worker);
                Release::Idle
            }
        }
    }

    /// Drop a queued entry whose client went away. `false` if a worker
    /// already took it.
    pub(crate) fn abandon(&mut self, entry: u64) -> bool {
        match self.queue.iter().position(|queued| queued.id == entry) {
            Some(index) => {
                self.queue.remove(index);
                self.queued_connections -= 1;
                true
            }
            None => false,
        }
    }

    /// Take `worker` off the idle list. `false` if a connection was already
    /// handed to it.
    pub(crate) fn retire(&mut self, worker: WorkerId) -> bool {
        match self.idle.iter().position(|idle| *idle == worker) {
            Some(index) => {
                self.idle.remove(index);
                true
            }
            None => false,
        }
    }

    /// Forget `worker`. If it still counted as busy its connection is
    /// released too.
    pub(crate) fn remove_worker(&mut self, worker: WorkerId) -> bool {
        self.idle.retain(|idle| *idle != worker);
        match self.workers.remove(&worker) {
            Some(slot) if slot.busy => {
                self.current_connections = self.current_connections.saturating_sub(1);
                self.current_threads = self.current_threads.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Stop admitting and hand back everything still queued.
    pub(crate) fn close(&mut self) -> Vec<QueuedEntry> {
        self.accepting = false;
        self.queued_connections = 0;
        self.queue.drain(..).collect()
    }

    pub(crate) fn abort_handles(&self) -> Vec<AbortHandle> {
        self.workers
            .values()
            .filter_map(|slot| slot.abort.clone())
            .collect()
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.workers.is_empty() && self.current_connections == 0 && self.queued_connections == 0
    }

    pub(crate) fn snapshot(&self, limits: &PoolLimits) -> PoolStats {
        PoolStats {
            current_connections: self.current_connections,
            current_threads: self.current_threads,
            queued_connections: self.queued_connections,
            total_connections: self.total_connections,
            idle_threads: self.idle.len(),
            max_threads: limits.max_threads,
            max_queued: limits.max_queued,
        }
    }

    fn set_busy(&mut self, worker: WorkerId, busy: bool) {
        if let Some(slot) = self.workers.get_mut(&worker) {
            slot.busy = busy;
        }
    }
}
