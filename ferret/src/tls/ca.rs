//! The certificate authority that signs forged leaf certificates.
//!
//! Clients need to trust its root certificate for interception to work, see
//! [`Ca::root_cert_pem`].

use std::{
    fmt::Debug,
    path::Path,
    sync::Arc,
};

use rcgen::{
    BasicConstraints,
    Certificate,
    CertificateParams,
    DistinguishedName,
    DnType,
    IsCa,
    KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;

use super::Error;

const COMMON_NAME: &str = "ferret root ca";
const ORGANIZATION: &str = "ferret";
const VALIDITY_DAYS: i64 = 3 * 365;

/// The root certificate as clients see it.
struct Root {
    der: CertificateDer<'static>,
    pem: String,
}

#[derive(Clone)]
pub struct Ca {
    key_pair: Arc<KeyPair>,
    root: Arc<Root>,
    /// rcgen only signs with a [`Certificate`]. This one has the root's
    /// subject and key, which is all that ends up in a leaf.
    issuer: Arc<Certificate>,
}

impl Ca {
    /// Reads the CA's key and certificate from PEM files.
    pub fn open(key_file: impl AsRef<Path>, cert_file: impl AsRef<Path>) -> Result<Self, Error> {
        let key_pair = KeyPair::from_pem(&std::fs::read_to_string(key_file)?)?;

        let cert_file = cert_file.as_ref();
        let pem = std::fs::read_to_string(cert_file)?;
        let der = rustls_pemfile::certs(&mut pem.as_bytes())
            .next()
            .ok_or_else(|| {
                Error::NoCertificate {
                    path: cert_file.to_owned(),
                }
            })??;

        let issuer = CertificateParams::from_ca_cert_der(&der)?.self_signed(&key_pair)?;
        Ok(Self::from_parts(key_pair, Root { der, pem }, issuer))
    }

    /// Generates a new CA with a random key.
    pub async fn generate() -> Result<Self, Error> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, ORGANIZATION);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(2);
        params.not_after = now + time::Duration::days(VALIDITY_DAYS);

        let (key_pair, issuer) = tokio::task::spawn_blocking(move || {
            let key_pair = KeyPair::generate()?;
            let issuer = params.self_signed(&key_pair)?;
            Ok::<_, Error>((key_pair, issuer))
        })
        .await??;

        let root = Root {
            der: issuer.der().clone(),
            pem: issuer.pem(),
        };
        Ok(Self::from_parts(key_pair, root, issuer))
    }

    fn from_parts(key_pair: KeyPair, root: Root, issuer: Certificate) -> Self {
        Self {
            key_pair: Arc::new(key_pair),
            root: Arc::new(root),
            issuer: Arc::new(issuer),
        }
    }

    /// Saves key and certificate as PEM files. A CA that was opened is saved
    /// unchanged.
    pub fn save(
        &self,
        key_file: impl AsRef<Path>,
        cert_file: impl AsRef<Path>,
    ) -> Result<(), Error> {
        std::fs::write(key_file, self.key_pair.serialize_pem())?;
        std::fs::write(cert_file, &self.root.pem)?;
        Ok(())
    }

    /// Signs a leaf certificate for `server_key`.
    pub async fn sign(
        &self,
        server_key: Arc<KeyPair>,
        mut params: CertificateParams,
    ) -> Result<CertificateDer<'static>, Error> {
        // leaves are forged again in every session, so serials must not repeat
        params.serial_number = None;

        let ca = self.clone();
        let leaf = tokio::task::spawn_blocking(move || {
            params.signed_by(&*server_key, &ca.issuer, &ca.key_pair)
        })
        .await??;

        Ok(leaf.into())
    }

    pub fn root_cert(&self) -> &CertificateDer<'static> {
        &self.root.der
    }

    /// The root certificate, for installing it in a client's trust store.
    pub fn root_cert_pem(&self) -> &str {
        &self.root.pem
    }
}

impl Debug for Ca {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ca")
            .field("root", &self.root.der)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::Ca;

    #[tokio::test]
    async fn it_saves_and_opens_a_ca() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("ca.key.pem");
        let cert_file = dir.path().join("ca.cert.pem");

        let ca = Ca::generate().await.unwrap();
        ca.save(&key_file, &cert_file).unwrap();

        let opened = Ca::open(&key_file, &cert_file).unwrap();
        assert_eq!(opened.root_cert(), ca.root_cert());
    }

    #[tokio::test]
    async fn it_saves_an_opened_ca_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("ca.key.pem");
        let cert_file = dir.path().join("ca.cert.pem");
        Ca::generate()
            .await
            .unwrap()
            .save(&key_file, &cert_file)
            .unwrap();
        let written = std::fs::read_to_string(&cert_file).unwrap();

        let opened = Ca::open(&key_file, &cert_file).unwrap();
        let copy = dir.path().join("copy.cert.pem");
        opened.save(dir.path().join("copy.key.pem"), &copy).unwrap();

        assert_eq!(std::fs::read_to_string(&copy).unwrap(), written);
        assert_eq!(opened.root_cert_pem(), written);
    }
}
