//! TLS configuration for the hyper transport.
//!
//! Certificate evaluation is webpki against the bundled Mozilla roots,
//! except for hosts on the trusted-domain allowlist, which pass through
//! without evaluation. The allowlist is matched on the exact lowercased
//! host name presented during the handshake.

use std::collections::BTreeSet;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::error::Error;

pub(crate) fn build_tls_config(
    trusted_domains: &BTreeSet<String>,
) -> Result<rustls::ClientConfig, Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|source| Error::TlsInit {
            message: source.to_string(),
        })?;

    let verifier: Arc<dyn ServerCertVerifier> = if trusted_domains.is_empty() {
        webpki
    } else {
        Arc::new(TrustedDomainVerifier {
            webpki,
            trusted_domains: trusted_domains
                .iter()
                .map(|domain| domain.to_ascii_lowercase())
                .collect(),
        })
    };

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|source| Error::TlsInit {
            message: source.to_string(),
        })?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}

#[derive(Debug)]
struct TrustedDomainVerifier {
    webpki: Arc<WebPkiServerVerifier>,
    trusted_domains: BTreeSet<String>,
}

impl TrustedDomainVerifier {
    fn is_trusted(&self, server_name: &ServerName<'_>) -> bool {
        match server_name {
            ServerName::DnsName(dns_name) => self
                .trusted_domains
                .contains(&dns_name.as_ref().to_ascii_lowercase()),
            _ => false,
        }
    }
}

impl ServerCertVerifier for TrustedDomainVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.is_trusted(server_name) {
            return Ok(ServerCertVerified::assertion());
        }
        self.webpki
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}
