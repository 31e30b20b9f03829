//! Connection queue and worker pool.
//!
//! # Responsibilities
//! - Decide admission for every accepted connection: run, queue or reject
//! - Keep the four public counters consistent under one lock
//! - Promote queued connections in FIFO order as workers free up
//! - Retire idle workers and drain everything on shutdown
//!
//! # Data Flow
//! ```text
//! submit(connection)
//!     ├─ idle worker?      → inbox → Worker::serve
//!     ├─ below max_threads → spawn Worker
//!     ├─ queue has room    → park (watch for client close)
//!     └─ otherwise         → Rejected, caller closes
//!
//! Worker finished → worker_idle
//!     ├─ queue non-empty   → promote head onto this worker
//!     ├─ accepting         → idle list, retire after idle time
//!     └─ shutting down     → exit
//! ```
//!
//! # Design Decisions
//! - One mutex guards counters, queue and idle list; every transition is a
//!   single critical section
//! - Workers are Tokio tasks; a drop guard reports every worker exit, even
//!   an abort in the middle of a connection
//! - A queued connection is owned by a parked task, which notices a client
//!   that gives up and removes it from the queue

pub mod dispatcher;
pub mod state;
pub mod worker;

pub use dispatcher::{Admission, ConnectionPool};
pub use state::{PoolLimits, PoolStats, WorkerId};
pub use worker::{ConnectionService, ServeError};
