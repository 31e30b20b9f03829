//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     Load config → Validate → Bind listener → TcpServer::start
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Discard queue → Drain workers → Flush sessions
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Listener binds before start so bind failures are fatal at startup
//! - Ordered shutdown: stop accept, drain, flush
//! - Shutdown has timeout: running connections are aborted after the grace period

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
