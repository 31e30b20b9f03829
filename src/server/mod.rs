//! Server subsystem.
//!
//! # Data Flow
//! ```text
//! TcpServer::start
//!     → accept loop (tcp_server.rs)
//!     → ConnectionPool::submit
//!     → HandlerService (service.rs): TLS handshake, then ConnectionHandler
//! ```

pub mod handler;
pub mod service;
pub mod tcp_server;

pub use handler::{ConnectionContext, ConnectionHandler, EchoHandler, HandshakeOnlyHandler};
pub use service::HandlerService;
pub use tcp_server::{ServerError, TcpServer};
