//! TLS subsystem.
//!
//! # Responsibilities
//! - Load certificates and keys, build rustls server and client configs
//! - Keep the server-side session cache and expose it to the TLS engine
//! - Validate peer certificates with a pluggable invalid-certificate policy
//!
//! # Data Flow
//! ```text
//! Server: worker → ServerTlsContext::accept → rustls
//!                      ↕ CacheSessionStore (put / take)
//!                  SessionCache (timeout, capacity, flush)
//!
//! Client: ClientTlsContext::connect → rustls (in-memory session store)
//!             → PolicyVerifier → InvalidCertificateHandler on failure
//! ```
//!
//! # Design Decisions
//! - One crypto provider (ring) is passed explicitly everywhere
//! - Only stateful resumption: sessions live in the server's cache, so a
//!   flush or timeout always forces a full handshake
//! - Handshake failures close the connection; there are no retries

pub mod certificate;
pub mod client;
pub mod context;
pub mod error;
pub mod session_cache;

pub use certificate::{
    AcceptCertificateHandler, CertificateContext, CertificateDecision,
    InvalidCertificateHandler, PolicyVerifier, RejectCertificateHandler,
};
pub use client::SecureStream;
pub use context::{
    load_certs, load_private_key, load_roots, ClientTlsContext, ServerTlsContext,
};
pub use error::TlsError;
pub use session_cache::{
    CacheSessionStore, SessionCache, SessionCacheStats, SessionId, SessionLookup,
};
