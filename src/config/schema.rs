//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the connection server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Worker pool and admission limits.
    pub pool: PoolConfig,

    /// Optional server-side TLS. Plain TCP when absent.
    pub tls: Option<TlsConfig>,

    /// Client-side TLS settings (used by the bundled echo client and tests).
    pub client_tls: ClientTlsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:9443"). Port 0 picks an ephemeral port.
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9443".to_string(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on concurrently running connections (busy workers).
    /// Zero rejects every connection.
    pub max_threads: usize,

    /// Hard cap on connections waiting for a worker.
    pub max_queued: usize,

    /// Milliseconds an idle worker waits for work before retiring.
    pub thread_idle_time_ms: u64,
}

impl PoolConfig {
    pub fn thread_idle_time(&self) -> Duration {
        Duration::from_millis(self.thread_idle_time_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_threads: 16,
            max_queued: 64,
            thread_idle_time_ms: 10_000,
        }
    }
}

/// A TLS protocol version that can be enabled on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "tls12",
            TlsVersion::Tls13 => "tls13",
        }
    }
}

fn default_protocols() -> Vec<TlsVersion> {
    vec![TlsVersion::Tls12, TlsVersion::Tls13]
}

/// Server-side TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// Enabled protocol versions.
    #[serde(default = "default_protocols")]
    pub protocols: Vec<TlsVersion>,

    /// Number of TLS 1.3 session tickets issued per handshake.
    /// Zero disables TLS 1.3 resumption entirely.
    #[serde(default)]
    pub tls13_tickets: usize,

    /// Server-side session cache.
    #[serde(default)]
    pub session_cache: SessionCacheConfig,
}

impl TlsConfig {
    /// TLS settings for the given PEM files with all defaults applied.
    pub fn new(cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            protocols: default_protocols(),
            tls13_tickets: 0,
            session_cache: SessionCacheConfig::default(),
        }
    }
}

/// Session cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionCacheConfig {
    /// Store negotiated sessions for resumption.
    pub enable_cache: bool,

    /// Label used in logs and metrics.
    pub cache_name: String,

    /// Seconds a session stays eligible for resumption.
    pub session_timeout_secs: u64,

    /// Maximum number of live entries.
    pub cache_size: usize,
}

impl SessionCacheConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            enable_cache: false,
            cache_name: "default".to_string(),
            session_timeout_secs: 300,
            cache_size: 20_480,
        }
    }
}

/// What to do when the peer presents a certificate that fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidCertificatePolicy {
    /// Abort the handshake.
    #[default]
    Reject,
    /// Override the failure and proceed.
    Accept,
}

/// Client-side TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientTlsConfig {
    /// Trust anchors (PEM). No anchors means every certificate is untrusted.
    pub ca_path: Option<String>,

    /// Name the server certificate must be valid for.
    pub server_name: String,

    /// Enabled protocol versions.
    pub protocols: Vec<TlsVersion>,

    /// Number of sessions the client remembers for resumption.
    pub session_store_size: usize,

    /// Policy consulted when certificate validation fails.
    pub invalid_certificate_handler: InvalidCertificatePolicy,
}

impl Default for ClientTlsConfig {
    fn default() -> Self {
        Self {
            ca_path: None,
            server_name: "localhost".to_string(),
            protocols: default_protocols(),
            session_store_size: 256,
            invalid_certificate_handler: InvalidCertificatePolicy::Reject,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Server-side TLS handshake deadline in seconds.
    pub handshake_secs: u64,

    /// Seconds running connections get to finish during stop.
    pub shutdown_grace_secs: u64,
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_secs: 10,
            shutdown_grace_secs: 5,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human-readable or JSON log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
