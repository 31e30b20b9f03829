//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → handed to TcpServer / TLS contexts at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a running server never re-reads it
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ClientTlsConfig, InvalidCertificatePolicy, ListenerConfig, LogFormat, ObservabilityConfig,
    PoolConfig, ServerConfig, SessionCacheConfig, TimeoutConfig, TlsConfig, TlsVersion,
};
pub use validation::{validate_config, ValidationError};
