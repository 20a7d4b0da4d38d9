//! TLS support for both inbound (termination) and outbound (origination).
//!
//! Termination is driven by a certificate-provider callback: the acceptor
//! asks the provider for a certificate by SNI server name on every
//! handshake. How certificates come to exist (issuance, renewal) is
//! entirely outside this crate; the built-in [`file_cert_provider`] simply
//! loads one PEM pair from disk at startup and serves it for every name.
//!
//! Origination (proxy -> upstream) uses the Mozilla root certificate store
//! via [`webpki_roots`] for `https://` upstream backends.

use std::fmt;
use std::io::BufReader;
use std::sync::Arc;

use hyper_rustls::HttpsConnectorBuilder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::{ProxyError, Result};

/// A callback resolving an SNI server name to a certificate.
///
/// Returning `None` aborts the handshake for that client. Providers are
/// shared across every connection of a listener and must be cheap to call.
pub type CertProvider = Arc<dyn Fn(&str) -> Option<Arc<CertifiedKey>> + Send + Sync>;

/// Adapts a [`CertProvider`] to the rustls resolver interface.
struct ProviderResolver {
    provider: CertProvider,
}

impl fmt::Debug for ProviderResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderResolver")
    }
}

impl ResolvesServerCert for ProviderResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        (self.provider)(client_hello.server_name()?)
    }
}

/// Builds a [`TlsAcceptor`] whose certificates come from `provider`.
pub fn build_tls_acceptor(provider: CertProvider) -> TlsAcceptor {
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ProviderResolver { provider }));

    TlsAcceptor::from(Arc::new(server_config))
}

/// Builds a [`CertProvider`] from one PEM certificate chain and private
/// key on disk. The pair is loaded once; every SNI name resolves to it.
pub fn file_cert_provider(config: &TlsConfig) -> Result<CertProvider> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| ProxyError::Tls(format!("unsupported private key type: {e}")))?;

    let certified = Arc::new(CertifiedKey::new(certs, signing_key));
    Ok(Arc::new(move |_server_name| Some(certified.clone())))
}

/// Builds an HTTPS connector for outbound connections to upstream backends.
///
/// Uses the Mozilla root certificate store via [`webpki_roots`] for server
/// verification. The resulting connector supports both `http://` and
/// `https://` schemes; plain HTTP connections pass through unmodified.
pub fn build_https_connector()
-> hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .build()
}

/// Loads PEM-encoded X.509 certificates from the file at `path`.
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| ProxyError::Tls(format!("failed to open cert file {path}: {e}")))?;

    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("failed to parse certificates from {path}: {e}")))
}

/// Loads the first PEM-encoded private key from the file at `path`.
///
/// Supports PKCS#1 (RSA), PKCS#8, and SEC1 (EC) key formats.
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| ProxyError::Tls(format!("failed to open key file {path}: {e}")))?;

    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ProxyError::Tls(format!("failed to parse key from {path}: {e}")))?
        {
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Some(rustls_pemfile::Item::Sec1Key(key)) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            Some(_) => continue,
            None => {
                return Err(ProxyError::Tls(format!("no private key found in {path}")));
            }
        }
    }
}
