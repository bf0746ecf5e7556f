//! Forged leaf certificates, cached by common name and SANs.

use std::{
    collections::{
        BTreeSet,
        HashMap,
        VecDeque,
    },
    net::IpAddr,
    sync::Arc,
};

use parking_lot::Mutex;
use rcgen::{
    CertificateParams,
    DistinguishedName,
    DnType,
    ExtendedKeyUsagePurpose,
    KeyPair,
    KeyUsagePurpose,
    SanType,
};
use rustls::pki_types::{
    CertificateDer,
    PrivateKeyDer,
    PrivatePkcs8KeyDer,
};

use super::{
    ca::Ca,
    Error,
};

pub const DEFAULT_CAPACITY: usize = 100;

/// Longest common name allowed in an X.509 subject.
const MAX_COMMON_NAME_LENGTH: usize = 64;

/// A signed leaf certificate. Never changes after creation.
#[derive(Debug)]
pub struct CertEntry {
    pub common_name: Option<String>,
    pub sans: BTreeSet<String>,
    pub certificate: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

type CacheKey = (Option<String>, BTreeSet<String>);

#[derive(Debug, Default)]
struct Cache {
    entries: HashMap<CacheKey, Arc<CertEntry>>,
    /// Insertion order, oldest first.
    order: VecDeque<CacheKey>,
}

/// Bounded cache of leaf certificates, shared by all connections.
///
/// All leaf certificates use the same key, so only signing is done per entry.
#[derive(Debug)]
pub struct CertStore {
    ca: Ca,
    key: Arc<KeyPair>,
    capacity: usize,
    cache: Mutex<Cache>,
}

impl CertStore {
    pub async fn new(ca: Ca, capacity: usize) -> Result<Self, Error> {
        let key = tokio::task::spawn_blocking(|| Ok::<_, Error>(Arc::new(KeyPair::generate()?)))
            .await??;

        Ok(Self {
            ca,
            key,
            capacity: capacity.max(1),
            cache: Mutex::new(Cache::default()),
        })
    }

    pub fn ca(&self) -> &Ca {
        &self.ca
    }

    pub fn len(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached certificate for exactly this common name and SAN set,
    /// or signs a new one.
    ///
    /// Callers normalize the SANs (e.g. lowercase host names) to get cache hits.
    pub async fn get_certificate(
        &self,
        common_name: Option<String>,
        sans: BTreeSet<String>,
    ) -> Result<Arc<CertEntry>, Error> {
        let key = (common_name, sans);

        if let Some(entry) = self.cache.lock().entries.get(&key) {
            return Ok(entry.clone());
        }

        // signing happens outside of the lock. two connections racing for the same
        // entry both sign, but only the first one is kept.
        let params = leaf_params(key.0.as_deref(), &key.1)?;
        let certificate = self.ca.sign(self.key.clone(), params).await?;
        let entry = Arc::new(CertEntry {
            common_name: key.0.clone(),
            sans: key.1.clone(),
            certificate,
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.serialize_der())),
        });

        let mut cache = self.cache.lock();
        if let Some(existing) = cache.entries.get(&key) {
            return Ok(existing.clone());
        }
        while cache.entries.len() >= self.capacity {
            let Some(oldest) = cache.order.pop_front()
            else {
                break;
            };
            cache.entries.remove(&oldest);
        }
        tracing::debug!(common_name = ?key.0, sans = ?key.1, "signed leaf certificate");
        cache.order.push_back(key.clone());
        cache.entries.insert(key, entry.clone());

        Ok(entry)
    }
}

fn leaf_params(common_name: Option<&str>, sans: &BTreeSet<String>) -> Result<CertificateParams, Error> {
    let mut params = CertificateParams::default();

    params.distinguished_name = DistinguishedName::new();
    if let Some(common_name) = common_name {
        if common_name.len() < MAX_COMMON_NAME_LENGTH {
            params
                .distinguished_name
                .push(DnType::CommonName, common_name);
        }
    }
    params
        .distinguished_name
        .push(DnType::OrganizationName, "ferret");

    for san in sans {
        let san = match san.parse::<IpAddr>() {
            Ok(ip_address) => SanType::IpAddress(ip_address),
            Err(_) => SanType::DnsName(san.as_str().try_into()?),
        };
        params.subject_alt_names.push(san);
    }

    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(2);
    params.not_after = now + time::Duration::days(30);

    Ok(params)
}
