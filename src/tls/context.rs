//! TLS contexts: certificate loading and rustls configuration.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::{Resumption, Tls12Resumption};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{RootCertStore, SupportedProtocolVersion};
use tokio::net::TcpStream;
use tokio_rustls::{server::TlsStream, TlsAcceptor, TlsConnector};

use crate::config::{ClientTlsConfig, TlsConfig, TlsVersion};
use crate::net::AcceptedStream;
use crate::tls::certificate::{InvalidCertificateHandler, PolicyVerifier};
use crate::tls::client::SecureStream;
use crate::tls::session_cache::{CacheSessionStore, SessionCache};
use crate::tls::TlsError;

/// Crypto provider shared by every context.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn protocol_versions(protocols: &[TlsVersion]) -> Vec<&'static SupportedProtocolVersion> {
    let mut versions: Vec<&'static SupportedProtocolVersion> = Vec::with_capacity(protocols.len());
    for protocol in protocols {
        let version = match protocol {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        };
        if !versions.iter().any(|v| std::ptr::eq(*v, version)) {
            versions.push(version);
        }
    }
    versions
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Load every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Load trust anchors from a PEM file.
pub fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server-side TLS: certificate, protocols and the session cache.
///
/// Cloning is cheap and shares the session cache.
#[derive(Clone)]
pub struct ServerTlsContext {
    acceptor: TlsAcceptor,
    config: Arc<rustls::ServerConfig>,
    cache: Arc<SessionCache>,
}

impl ServerTlsContext {
    /// Build from the PEM files named in `config`.
    pub fn from_config(config: &TlsConfig) -> Result<Self, TlsError> {
        let certs = load_certs(Path::new(&config.cert_path))?;
        let key = load_private_key(Path::new(&config.key_path))?;
        Self::new(certs, key, config)
    }

    pub fn new(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        config: &TlsConfig,
    ) -> Result<Self, TlsError> {
        let versions = protocol_versions(&config.protocols);
        if versions.is_empty() {
            return Err(TlsError::Config("no protocol versions enabled".into()));
        }

        let cache = Arc::new(SessionCache::from_config(&config.session_cache));

        let mut server = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&versions)?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        server.session_storage = Arc::new(CacheSessionStore::new(cache.clone()));
        // Stateless (ticket-key) resumption stays disabled: the default
        // ticketer never issues tickets. TLS 1.3 tickets, when enabled, are
        // stateful and point into the session cache.
        server.send_tls13_tickets = config.tls13_tickets;

        let protocols = config
            .protocols
            .iter()
            .map(TlsVersion::as_str)
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(
            protocols = %protocols,
            cache = %cache.name(),
            cache_enabled = cache.is_enabled(),
            session_timeout_secs = cache.timeout().as_secs(),
            cache_size = cache.capacity(),
            "Server TLS context ready"
        );

        let config = Arc::new(server);
        Ok(Self {
            acceptor: TlsAcceptor::from(config.clone()),
            config,
            cache,
        })
    }

    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// Invalidate every cached session.
    pub fn flush_session_cache(&self) {
        self.cache.flush();
    }

    pub fn rustls_config(&self) -> &Arc<rustls::ServerConfig> {
        &self.config
    }

    /// Run the server side of the handshake on an accepted socket.
    pub async fn accept(
        &self,
        stream: AcceptedStream,
        timeout: Duration,
    ) -> Result<TlsStream<AcceptedStream>, TlsError> {
        match tokio::time::timeout(timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(TlsError::Handshake(e)),
            Err(_) => Err(TlsError::HandshakeTimeout(timeout)),
        }
    }
}

impl std::fmt::Debug for ServerTlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTlsContext")
            .field("session_cache", &self.cache.name())
            .finish_non_exhaustive()
    }
}

/// Client-side TLS: trust anchors, certificate policy and session store.
#[derive(Clone)]
pub struct ClientTlsContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl ClientTlsContext {
    /// Build from `config`, loading trust anchors from `ca_path` if set and
    /// using the configured invalid-certificate policy.
    pub fn from_config(config: &ClientTlsConfig) -> Result<Self, TlsError> {
        let roots = match &config.ca_path {
            Some(path) => load_roots(Path::new(path))?,
            None => RootCertStore::empty(),
        };
        Self::new(roots, config, config.invalid_certificate_handler.handler())
    }

    pub fn new(
        roots: RootCertStore,
        config: &ClientTlsConfig,
        handler: Arc<dyn InvalidCertificateHandler>,
    ) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| TlsError::InvalidServerName(config.server_name.clone()))?;

        let versions = protocol_versions(&config.protocols);
        if versions.is_empty() {
            return Err(TlsError::Config("no protocol versions enabled".into()));
        }

        let provider = crypto_provider();
        let verifier = PolicyVerifier::new(roots, provider.clone(), handler)?;

        let mut client = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&versions)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        client.resumption = if config.session_store_size == 0 {
            Resumption::disabled()
        } else {
            Resumption::in_memory_sessions(config.session_store_size)
                .tls12_resumption(Tls12Resumption::SessionIdOrTickets)
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client)),
            server_name,
        })
    }

    /// Connect and complete the handshake, presenting a stored session for
    /// this server name if there is one.
    pub async fn connect(&self, addr: SocketAddr) -> Result<SecureStream, TlsError> {
        let tcp = TcpStream::connect(addr).await.map_err(TlsError::Connect)?;
        tcp.set_nodelay(true).map_err(TlsError::Connect)?;

        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(TlsError::Handshake)?;

        let stream = SecureStream::new(tls);
        tracing::debug!(
            peer_addr = %addr,
            reused = stream.session_was_reused(),
            "Client handshake complete"
        );
        Ok(stream)
    }
}

impl std::fmt::Debug for ClientTlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    #[test]
    fn loads_fixture_material() {
        assert_eq!(load_certs(&fixture("server.pem")).unwrap().len(), 1);
        assert!(load_private_key(&fixture("server.key")).is_ok());
        assert_eq!(load_roots(&fixture("ca.pem")).unwrap().len(), 1);
    }

    #[test]
    fn missing_files_are_reported() {
        assert!(matches!(
            load_certs(Path::new("missing.pem")),
            Err(TlsError::Io { .. })
        ));
        // A key file holds no certificates.
        assert!(matches!(
            load_certs(&fixture("server.key")),
            Err(TlsError::NoCertificate(_))
        ));
        // A certificate file holds no keys.
        assert!(matches!(
            load_private_key(&fixture("server.pem")),
            Err(TlsError::NoPrivateKey(_))
        ));
    }

    #[test]
    fn versions_are_deduplicated() {
        let versions =
            protocol_versions(&[TlsVersion::Tls13, TlsVersion::Tls12, TlsVersion::Tls13]);
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, rustls::ProtocolVersion::TLSv1_3);
    }

    #[test]
    fn server_context_wires_cache_into_engine() {
        let mut config = TlsConfig::new(
            fixture("server.pem").to_string_lossy(),
            fixture("server.key").to_string_lossy(),
        );
        config.session_cache.enable_cache = true;
        config.session_cache.cache_name = "unit".into();

        let context = ServerTlsContext::from_config(&config).unwrap();
        assert_eq!(context.session_cache().name(), "unit");
        assert!(context.rustls_config().session_storage.can_cache());
        assert_eq!(context.rustls_config().send_tls13_tickets, 0);
    }

    #[test]
    fn empty_protocol_list_is_rejected() {
        let mut config = TlsConfig::new(
            fixture("server.pem").to_string_lossy(),
            fixture("server.key").to_string_lossy(),
        );
        config.protocols.clear();
        assert!(matches!(
            ServerTlsContext::from_config(&config),
            Err(TlsError::Config(_))
        ));
    }

    #[test]
    fn client_rejects_invalid_server_name() {
        let config = ClientTlsConfig {
            server_name: "not a name!".into(),
            ..ClientTlsConfig::default()
        };
        assert!(matches!(
            ClientTlsContext::from_config(&config),
            Err(TlsError::InvalidServerName(_))
        ));
    }
}
