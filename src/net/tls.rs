//! Stream TLS adapter over the rustls provider.
//!
//! Presents `connect_tls`/`accept_tls` returning the unified `Connection`.
//! SNI, ALPN, verification against webpki roots or an explicit trust file,
//! optional client-certificate CRLs on the accept side, and cipher-suite
//! filtering are all mapped onto rustls config builders here so no other
//! module touches the provider.

use crate::config::TlsOptions;
use crate::net::connection::Connection;
use rustls::RootCertStore;
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName, UnixTime,
};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),

    #[error("certificate verification failed: {0}")]
    Verification(String),

    #[error("a certificate and key are required to accept TLS connections")]
    CertificateRequired,

    #[error("cannot load {path}: {source}")]
    Pem { path: String, source: io::Error },

    #[error("no private key found in {0}")]
    NoKey(String),

    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error("datagram TLS support is not built into this binary")]
    NotAvailable,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Pem {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem {
            path: path.display().to_string(),
            source,
        })
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Pem {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Pem {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoKey(path.display().to_string()))
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Pem {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::crls(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem {
            path: path.display().to_string(),
            source,
        })
}

fn root_store(opts: &TlsOptions) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    match &opts.trustfile {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::Config(e.to_string()))?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(roots)
}

/// Crypto provider with an optional cipher-suite filter applied. Filter
/// names match case-insensitively against the rustls suite identifiers
/// (e.g. `TLS13_AES_128_GCM_SHA256`).
fn crypto_provider(ciphers: &[String]) -> Result<rustls::crypto::CryptoProvider, TlsError> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    if !ciphers.is_empty() {
        let wanted: Vec<String> = ciphers.iter().map(|c| c.to_uppercase()).collect();
        provider
            .cipher_suites
            .retain(|s| wanted.iter().any(|w| format!("{:?}", s.suite()).contains(w)));
        if provider.cipher_suites.is_empty() {
            return Err(TlsError::Config(
                "no cipher suite matches the requested list".into(),
            ));
        }
    }
    Ok(provider)
}

fn classify_handshake(e: io::Error) -> TlsError {
    if e.kind() == io::ErrorKind::InvalidData {
        TlsError::Verification(e.to_string())
    } else {
        TlsError::Handshake(e)
    }
}

/// Client-side handshake over an established TCP stream.
pub async fn connect_tls(
    stream: TcpStream,
    host: &str,
    opts: &TlsOptions,
) -> Result<Connection, TlsError> {
    let provider = Arc::new(crypto_provider(&opts.ciphers)?);
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?;

    let roots = root_store(opts)?;
    let mut config = match (&opts.cert, &opts.key) {
        (Some(cert), Some(key)) => builder
            .with_root_certificates(roots)
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| TlsError::Config(e.to_string()))?,
        _ => builder.with_root_certificates(roots).with_no_client_auth(),
    };

    if !opts.verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(danger::NoVerification));
    }
    config.alpn_protocols = opts.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    let sni = opts.servername.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|_| TlsError::InvalidServerName(sni.to_string()))?;

    let connector = TlsConnector::from(Arc::new(config));
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(classify_handshake)?;

    debug!("TLS established with {} (sni {})", host, sni);
    Ok(Connection::Tls(Box::new(tls.into())))
}

/// Server-side handshake with a one-shot acceptor. Long-lived listeners
/// should `build_acceptor` once and use `accept_with`.
pub async fn accept_tls(stream: TcpStream, opts: &TlsOptions) -> Result<Connection, TlsError> {
    let acceptor = build_acceptor(opts)?;
    accept_with(&acceptor, stream).await
}

pub async fn accept_with(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> Result<Connection, TlsError> {
    let tls = acceptor.accept(stream).await.map_err(classify_handshake)?;
    debug!("TLS accepted");
    Ok(Connection::Tls(Box::new(tls.into())))
}

/// Build the server-side acceptor. `--ssl-verify` on the listener demands
/// and verifies a client certificate; `--ssl-crl` adds revocation checks
/// to that verifier.
pub fn build_acceptor(opts: &TlsOptions) -> Result<TlsAcceptor, TlsError> {
    let (cert_path, key_path) = match (&opts.cert, &opts.key) {
        (Some(c), Some(k)) => (c, k),
        _ => return Err(TlsError::CertificateRequired),
    };
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let provider = Arc::new(crypto_provider(&opts.ciphers)?);
    let builder = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?;

    let mut config = if opts.verify {
        let roots = root_store(opts)?;
        let mut verifier_builder =
            rustls::server::WebPkiClientVerifier::builder(Arc::new(roots));
        if let Some(crl_path) = &opts.crl {
            verifier_builder = verifier_builder.with_crls(load_crls(crl_path)?);
        }
        let verifier = verifier_builder
            .build()
            .map_err(|e| TlsError::Config(e.to_string()))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(e.to_string()))?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(e.to_string()))?
    };
    config.alpn_protocols = opts.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    Ok(TlsAcceptor::from(Arc::new(config)))
}

mod danger {
    use rustls::DigitallySignedStruct;
    use rustls::SignatureScheme;
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };

    use super::{CertificateDer, ServerName, UnixTime};

    /// Accept-anything verifier backing `--ssl-verify` being off. The
    /// connection is still encrypted; it is just not authenticated.
    #[derive(Debug)]
    pub struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}
