//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, backoff on accept errors)
//!     → connection.rs (id, state machine)
//!     → pool (admission: run / queue / reject)
//!     → stream.rs (plain or TLS stream handed to the handler)
//!
//! Connection States:
//!     Accepted → Queued → Running → Closed
//! ```
//!
//! # Design Decisions
//! - The listener never blocks on admission; the pool decides
//! - TLS handshakes run on workers, never on the accept loop
//! - A queued socket is read ahead (bounded) so a departing client is
//!   noticed even after it sent data; the worker replays those bytes first

pub mod connection;
pub mod listener;
pub mod stream;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use listener::{Listener, ListenerError};
pub use stream::{AcceptedStream, ServerStream, READ_AHEAD_LIMIT};
