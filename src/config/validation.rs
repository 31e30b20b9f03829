//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses, paths and value ranges
//! - Check that enabled features have what they need (TLS files, cache name)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ServerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: '{value}' is not a valid socket address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }

    if config.pool.thread_idle_time_ms == 0 {
        errors.push(ValidationError::Zero("pool.thread_idle_time_ms"));
    }

    if let Some(tls) = &config.tls {
        if tls.cert_path.trim().is_empty() {
            errors.push(ValidationError::Empty("tls.cert_path"));
        }
        if tls.key_path.trim().is_empty() {
            errors.push(ValidationError::Empty("tls.key_path"));
        }
        if tls.protocols.is_empty() {
            errors.push(ValidationError::Empty("tls.protocols"));
        }

        let cache = &tls.session_cache;
        if cache.enable_cache {
            if cache.cache_name.trim().is_empty() {
                errors.push(ValidationError::Empty("tls.session_cache.cache_name"));
            }
            if cache.session_timeout_secs == 0 {
                errors.push(ValidationError::Zero("tls.session_cache.session_timeout_secs"));
            }
        }
    }

    if config.client_tls.protocols.is_empty() {
        errors.push(ValidationError::Empty("client_tls.protocols"));
    }
    if config.client_tls.server_name.trim().is_empty() {
        errors.push(ValidationError::Empty("client_tls.server_name"));
    }

    if config.timeouts.handshake_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.handshake_secs"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ServerConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.pool.thread_idle_time_ms = 0;
        let mut tls = TlsConfig::new("", "key.pem");
        tls.protocols.clear();
        tls.session_cache.enable_cache = true;
        tls.session_cache.session_timeout_secs = 0;
        config.tls = Some(tls);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5, "{errors:?}");
        assert!(errors.contains(&ValidationError::Empty("tls.cert_path")));
        assert!(errors.contains(&ValidationError::Zero("tls.session_cache.session_timeout_secs")));
    }

    #[test]
    fn disabled_cache_skips_cache_checks() {
        let mut config = ServerConfig::default();
        let mut tls = TlsConfig::new("cert.pem", "key.pem");
        tls.session_cache.cache_name = String::new();
        tls.session_cache.session_timeout_secs = 0;
        config.tls = Some(tls);

        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn metrics_address_checked_only_when_enabled() {
        let mut config = ServerConfig::default();
        config.observability.metrics_address = "nowhere".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(
            errors[0],
            ValidationError::InvalidAddress { field: "observability.metrics_address", .. }
        ));
    }
}
