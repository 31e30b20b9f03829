//! Concurrent TCP server with a bounded worker pool and TLS session resumption.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pool;
pub mod server;
pub mod tls;

pub use config::schema::ServerConfig;
pub use lifecycle::Shutdown;
pub use pool::{ConnectionPool, PoolStats};
pub use server::{ConnectionHandler, EchoHandler, ServerError, TcpServer};
pub use tls::{ClientTlsContext, ServerTlsContext};
