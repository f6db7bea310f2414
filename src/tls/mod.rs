//! TLS transport construction
//!
//! Builds the rustls client and server configurations from the loaded
//! config: SNI, ALPN, verification policy and session reuse on the
//! client side; certificate chain, key and ALPN selection on the
//! server side.

mod session_cache;

pub use session_cache::SingleSessionCache;

use crate::config::Config;
use crate::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{client, TlsAcceptor, TlsConnector};
use tracing::debug;

/// Client-side TLS context: connector plus the name presented as SNI
#[derive(Clone)]
pub struct TlsClientContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    connect_timeout: Duration,
    no_delay: bool,
}

impl TlsClientContext {
    /// Build from config; `cache` backs session resumption when
    /// `ssl.reuse_session` is set.
    pub fn new(config: &Config, cache: Arc<SingleSessionCache>) -> Result<Self> {
        let tls_config = make_client_config(config, cache)?;
        let sni = if config.ssl.sni.is_empty() {
            config.remote_addr.clone()
        } else {
            config.ssl.sni.clone()
        };
        let server_name = ServerName::try_from(sni.clone())
            .map_err(|e| Error::Tls(format!("invalid SNI '{}': {}", sni, e)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            server_name,
            connect_timeout: Duration::from_secs(config.tcp.connect_time_out),
            no_delay: config.tcp.no_delay,
        })
    }

    /// Open a TCP connection to `endpoint` and run the TLS handshake
    pub async fn connect(&self, endpoint: &str) -> Result<client::TlsStream<TcpStream>> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Error::Timeout)??;
        if self.no_delay {
            tcp.set_nodelay(true)?;
        }

        let stream = tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(self.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Tls(format!("handshake with {} failed: {}", endpoint, e)))?;

        debug!("TLS connected to {}", endpoint);
        Ok(stream)
    }
}

/// Build the client `ClientConfig`
fn make_client_config(config: &Config, cache: Arc<SingleSessionCache>) -> Result<ClientConfig> {
    let mut tls_config = if config.ssl.verify {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        // Self-signed deployments; the password line is still the only
        // thing the server will relay for
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier::NoVerification::new()))
            .with_no_client_auth()
    };

    tls_config.alpn_protocols = config
        .ssl
        .alpn
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();

    tls_config.resumption = if config.ssl.reuse_session {
        rustls::client::Resumption::store(cache)
    } else {
        rustls::client::Resumption::disabled()
    };

    Ok(tls_config)
}

/// Build the server acceptor from the configured certificate and key
pub fn make_server_acceptor(config: &Config) -> Result<TlsAcceptor> {
    let certs = load_certs(&config.ssl.cert)?;
    let key = load_private_key(&config.ssl.key)?;

    let mut tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("invalid certificate/key: {}", e)))?;

    tls_config.alpn_protocols = config
        .ssl
        .alpn
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();
    tls_config.ignore_client_order = config.ssl.prefer_server_cipher;
    if !config.ssl.session_ticket {
        tls_config.send_tls13_tickets = 0;
    }

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Load a certificate chain from a PEM file
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("cannot open cert {}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Config(format!("cannot parse cert {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("no certificates in {}", path)));
    }
    Ok(certs)
}

/// Load a private key from a PEM file
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("cannot open key {}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("cannot parse key {}: {}", path, e)))?
        .ok_or_else(|| Error::Config(format!("no private key in {}", path)))
}

mod verifier {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate; used when `ssl.verify` is false
    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
