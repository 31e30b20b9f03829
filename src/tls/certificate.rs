//! Certificate validation with a pluggable invalid-certificate policy.
//!
//! Chain and name validation is done by rustls' WebPKI verifier. When it
//! fails with a certificate error, the configured [`InvalidCertificateHandler`]
//! decides whether the handshake proceeds. Its decision is applied verbatim.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::InvalidCertificatePolicy;
use crate::tls::TlsError;

/// What the validator saw when a peer certificate failed.
#[derive(Debug, Clone)]
pub struct CertificateContext {
    /// Name the certificate was checked against.
    pub server_name: String,
    /// Why validation failed.
    pub error: CertificateError,
    /// Number of certificates the peer presented (end entity included).
    pub chain_len: usize,
}

/// Whether to go on with a handshake after a certificate failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateDecision {
    Proceed,
    Abort,
}

/// Policy consulted when a peer certificate cannot be validated.
pub trait InvalidCertificateHandler: fmt::Debug + Send + Sync {
    fn decide(&self, context: &CertificateContext) -> CertificateDecision;
}

/// Treat every invalid certificate as fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectCertificateHandler;

impl InvalidCertificateHandler for RejectCertificateHandler {
    fn decide(&self, context: &CertificateContext) -> CertificateDecision {
        tracing::warn!(
            server_name = %context.server_name,
            error = ?context.error,
            "Rejecting invalid peer certificate"
        );
        CertificateDecision::Abort
    }
}

/// Override every certificate failure. For testing and closed networks only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptCertificateHandler;

impl InvalidCertificateHandler for AcceptCertificateHandler {
    fn decide(&self, context: &CertificateContext) -> CertificateDecision {
        tracing::warn!(
            server_name = %context.server_name,
            error = ?context.error,
            "Accepting invalid peer certificate"
        );
        CertificateDecision::Proceed
    }
}

impl InvalidCertificatePolicy {
    /// The handler implementing this policy.
    pub fn handler(self) -> Arc<dyn InvalidCertificateHandler> {
        match self {
            InvalidCertificatePolicy::Reject => Arc::new(RejectCertificateHandler),
            InvalidCertificatePolicy::Accept => Arc::new(AcceptCertificateHandler),
        }
    }
}

/// Server certificate verifier that defers failures to a handler.
#[derive(Debug)]
pub struct PolicyVerifier {
    /// `None` when there are no trust anchors: nothing can be trusted.
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    handler: Arc<dyn InvalidCertificateHandler>,
}

impl PolicyVerifier {
    pub fn new(
        roots: RootCertStore,
        provider: Arc<CryptoProvider>,
        handler: Arc<dyn InvalidCertificateHandler>,
    ) -> Result<Self, TlsError> {
        let webpki = if roots.is_empty() {
            None
        } else {
            let verifier =
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                    .build()
                    .map_err(|e| TlsError::Config(e.to_string()))?;
            Some(verifier)
        };

        Ok(Self {
            webpki,
            provider,
            handler,
        })
    }

    fn validate(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.webpki {
            Some(webpki) => webpki.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ),
            None => Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)),
        }
    }
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.validate(end_entity, intermediates, server_name, ocsp_response, now) {
            Err(rustls::Error::InvalidCertificate(error)) => {
                let context = CertificateContext {
                    server_name: server_name.to_str().into_owned(),
                    error: error.clone(),
                    chain_len: intermediates.len() + 1,
                };
                match self.handler.decide(&context) {
                    CertificateDecision::Proceed => Ok(ServerCertVerified::assertion()),
                    CertificateDecision::Abort => Err(rustls::Error::InvalidCertificate(error)),
                }
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
