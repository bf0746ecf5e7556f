//! TLS interception.
//!
//! The [`layer::TlsLayer`] reads the client's ClientHello, asks the
//! [`strategy`] whether to intercept, and if so connects to the server first
//! and then completes the client handshake with a certificate forged by the
//! [`cert_store`]. Clients need the [`ca`]'s root certificate installed.

pub mod ca;
pub mod cert_store;
pub mod client_hello;
pub mod layer;
pub mod strategy;

use std::{
    collections::BTreeSet,
    net::IpAddr,
    path::PathBuf,
    str::FromStr,
    sync::{
        Arc,
        Once,
    },
};

use rustls::{
    client::danger::{
        HandshakeSignatureValid,
        ServerCertVerified,
        ServerCertVerifier,
    },
    pki_types::{
        CertificateDer,
        ServerName,
        UnixTime,
    },
    ClientConfig,
    DigitallySignedStruct,
    RootCertStore,
    ServerConfig,
    SignatureScheme,
};
use tokio::io::{
    AsyncRead,
    AsyncWrite,
};
use tokio_rustls::TlsConnector;

use self::{
    ca::Ca,
    cert_store::CertStore,
    strategy::{
        FailureReason,
        InterceptionStrategy,
    },
};
use crate::{
    address::TcpAddress,
    config::ProxyConfig,
    connection::ClientConnection,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("rcgen error")]
    Rcgen(#[from] rcgen::Error),

    #[error("rustls error")]
    Rustls(#[from] rustls::Error),

    #[error("background task failed")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid host pattern")]
    Regex(#[from] regex::Error),

    #[error("missing certificate: {path}")]
    NoCertificate { path: PathBuf },

    #[error("invalid server name: {hostname}")]
    InvalidServerName { hostname: String },

    #[error("the server didn't send a certificate chain")]
    NoServerCertificate,

    #[error("invalid client hello: {reason}")]
    InvalidClientHello { reason: &'static str },

    #[error("invalid passthrough cache file: {path}")]
    PassthroughCache {
        #[source]
        error: serde_json::Error,
        path: PathBuf,
    },
}

/// What a [`Hooks::tls_client_hello`](crate::hooks::Hooks::tls_client_hello)
/// hook gets to see.
#[derive(Clone, Debug)]
pub struct ClientHelloData {
    pub client: ClientConnection,
    /// Where the connection is going, if known before TLS.
    pub destination: Option<TcpAddress>,
    pub sni: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Relay this connection without interception.
    pub ignore_connection: bool,
}

/// A client rejected our certificate.
#[derive(Clone, Debug)]
pub struct TlsFailure {
    pub client: ClientConnection,
    pub destination: Option<TcpAddress>,
    pub sni: Option<String>,
    pub reason: FailureReason,
}

/// Everything needed to intercept TLS, shared by all connections.
#[derive(Clone, Debug)]
pub struct Context {
    cert_store: Arc<CertStore>,
    strategy: Arc<dyn InterceptionStrategy>,
    insecure: bool,
}

impl Context {
    pub async fn new(ca: Ca, config: &ProxyConfig) -> Result<Self, Error> {
        ensure_crypto_provider();
        let cert_store = CertStore::new(ca, config.cert_cache_capacity).await?;
        Ok(Self {
            cert_store: Arc::new(cert_store),
            strategy: strategy::from_config(&config.strategy)?,
            insecure: config.ssl_insecure,
        })
    }

    /// Replaces the strategy built from the configuration.
    pub fn with_strategy(mut self, strategy: Arc<dyn InterceptionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn cert_store(&self) -> &Arc<CertStore> {
        &self.cert_store
    }

    pub fn strategy(&self) -> &Arc<dyn InterceptionStrategy> {
        &self.strategy
    }

    pub fn ca(&self) -> &Ca {
        self.cert_store.ca()
    }

    pub fn client_config(&self, alpn_protocols: Vec<Vec<u8>>) -> Result<Arc<ClientConfig>, Error> {
        let mut config = if self.insecure {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification))
                .with_no_client_auth()
        }
        else {
            ClientConfig::builder()
                .with_root_certificates(root_certificates()?)
                .with_no_client_auth()
        };
        config.alpn_protocols = alpn_protocols;
        Ok(Arc::new(config))
    }

    /// Connects to a server over TLS.
    pub async fn connect<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: S,
        server_name: ServerName<'static>,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<tokio_rustls::client::TlsStream<S>, Error> {
        let config = self.client_config(alpn_protocols)?;
        let stream = TlsConnector::from(config)
            .connect(server_name, stream)
            .await?;
        Ok(stream)
    }

    /// Builds the config for the client side handshake with a certificate for
    /// `common_name` and `sans`.
    pub async fn server_config(
        &self,
        common_name: Option<String>,
        sans: BTreeSet<String>,
        alpn_protocol: Option<Vec<u8>>,
    ) -> Result<(Arc<ServerConfig>, CertificateDer<'static>), Error> {
        let entry = self
            .cert_store
            .get_certificate(common_name, sans)
            .await?;

        let cert_chain = vec![
            entry.certificate.clone(),
            CertificateDer::clone(self.ca().root_cert()),
        ];
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, entry.key.clone_key())?;
        config.alpn_protocols = alpn_protocol.into_iter().collect();

        Ok((Arc::new(config), entry.certificate.clone()))
    }
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, Error> {
    match IpAddr::from_str(host) {
        Ok(ip_address) => Ok(ServerName::IpAddress(ip_address.into())),
        Err(_) => {
            ServerName::try_from(host.to_owned()).map_err(|_| {
                Error::InvalidServerName {
                    hostname: host.to_owned(),
                }
            })
        }
    }
}

/// Common name and subject alternative names of a certificate. Names are
/// lowercased. Unparseable certificates yield nothing.
pub fn certificate_names(certificate: &CertificateDer<'_>) -> (Option<String>, BTreeSet<String>) {
    let mut sans = BTreeSet::new();

    let Ok((_, certificate)) = x509_parser::parse_x509_certificate(certificate)
    else {
        return (None, sans);
    };

    let common_name = certificate
        .subject()
        .iter_common_name()
        .next()
        .and_then(|common_name| common_name.as_str().ok())
        .map(|common_name| common_name.to_ascii_lowercase());

    if let Ok(Some(extension)) = certificate.subject_alternative_name() {
        for name in &extension.value.general_names {
            match name {
                x509_parser::extensions::GeneralName::DNSName(name) => {
                    sans.insert(name.to_ascii_lowercase());
                }
                x509_parser::extensions::GeneralName::IPAddress(bytes) => {
                    let ip_address = match bytes.len() {
                        4 => <[u8; 4]>::try_from(*bytes).ok().map(IpAddr::from),
                        16 => <[u8; 16]>::try_from(*bytes).ok().map(IpAddr::from),
                        _ => None,
                    };
                    if let Some(ip_address) = ip_address {
                        sans.insert(ip_address.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    (common_name, sans)
}

/// Root certificates of the operating system, loaded once.
pub fn root_certificates() -> Result<Arc<RootCertStore>, Error> {
    static CERTS_CACHE: parking_lot::Mutex<Option<Arc<RootCertStore>>> =
        parking_lot::const_mutex(None);

    let mut certs_cache = CERTS_CACHE.lock();
    if let Some(certs) = &*certs_cache {
        Ok(certs.clone())
    }
    else {
        let mut certs = RootCertStore::empty();
        let (added, ignored) =
            certs.add_parsable_certificates(rustls_native_certs::load_native_certs()?);
        tracing::debug!(added, ignored, "loaded native root certificates");
        let certs = Arc::new(certs);
        *certs_cache = Some(certs.clone());
        Ok(certs)
    }
}

fn ensure_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

/// Accepts any server certificate. Used with `ssl_insecure`.
#[derive(Debug)]
struct NoVerification;

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

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{
        certificate_names,
        ca::Ca,
        server_name,
        Context,
    };
    use crate::config::ProxyConfig;

    #[test]
    fn it_makes_server_names() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("::1").is_ok());
        assert!(server_name("not a name").is_err());
    }

    #[tokio::test]
    async fn it_reads_names_from_forged_certificates() {
        let context = Context::new(Ca::generate().await.unwrap(), &ProxyConfig::default())
            .await
            .unwrap();
        let sans: BTreeSet<String> = ["example.com", "127.0.0.1"]
            .iter()
            .map(|san| san.to_string())
            .collect();

        let (_, certificate) = context
            .server_config(Some("Example.com".to_owned()), sans.clone(), None)
            .await
            .unwrap();

        let (common_name, parsed_sans) = certificate_names(&certificate);
        assert_eq!(common_name.as_deref(), Some("example.com"));
        assert_eq!(parsed_sans, sans);
    }
}
