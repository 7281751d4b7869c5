//! On-demand certificate authority for TLS interception.
//!
//! The authority owns one self-signed root (RSA-2048, persisted as a
//! combined key-then-cert PEM) and mints leaf certificates per intercepted
//! host. Issued leaves are cached by host; concurrent misses for the same
//! host are deduplicated so at most one signing runs per key.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::debug;

mod material;

use material::RootMaterial;
pub use material::{CERT_EXPORT_FILE, COMBINED_FILE};

const LEAF_VALIDITY_DAYS: i64 = 365;
const LEAF_NOT_BEFORE_SKEW: Duration = Duration::hours(1);
/// Cached leaves this close to expiry are reissued instead of reused.
const REISSUE_MARGIN: Duration = Duration::days(1);

#[derive(Debug, Error)]
pub enum CertError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("certificate issuance failed: {0}")]
    Issuance(#[from] rcgen::Error),
    #[error("invalid certificate authority material: {0}")]
    InvalidMaterial(String),
    #[error("unsupported private key: {0}")]
    UnsupportedKey(String),
    #[error("certificate store I/O failed for {path}: {source}")]
    Store {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
}

/// One issued leaf plus the root it chains to.
pub struct IssuedCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub not_after: OffsetDateTime,
}

impl IssuedCert {
    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        now + REISSUE_MARGIN < self.not_after
    }

    /// Builds a server config presenting this leaf with the given ALPN offer.
    pub fn server_config(&self, alpn: Vec<Vec<u8>>) -> Result<Arc<ServerConfig>, CertError> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())?;
        config.alpn_protocols = alpn;
        Ok(Arc::new(config))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CertMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

pub struct CertAuthority {
    root: RootMaterial,
    store_dir: Option<PathBuf>,
    cache: DashMap<String, Arc<IssuedCert>>,
    issue_gates: DashMap<String, Arc<Mutex<()>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl CertAuthority {
    /// Root generated in-process, lost on drop.
    pub fn in_memory() -> Result<Self, CertError> {
        Ok(Self::from_material(material::generate_root()?, None))
    }

    /// Loads the root from `dir`, generating and persisting one on first use.
    pub fn load_or_create(dir: impl AsRef<Path>) -> Result<Self, CertError> {
        let dir = dir.as_ref();
        let root = material::load_or_generate(dir)?;
        Ok(Self::from_material(root, Some(dir.to_path_buf())))
    }

    fn from_material(root: RootMaterial, store_dir: Option<PathBuf>) -> Self {
        Self {
            root,
            store_dir,
            cache: DashMap::new(),
            issue_gates: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        }
    }

    pub fn root_cert(&self) -> &CertificateDer<'static> {
        &self.root.cert_der
    }

    pub fn root_cert_pem(&self) -> &str {
        &self.root.cert_pem
    }

    /// Paths of the on-disk store, when this authority is file-backed.
    pub fn store_paths(&self) -> Option<(PathBuf, PathBuf)> {
        self.store_dir.as_deref().map(material::store_paths)
    }

    /// Leaf for `host` with the host itself as the only subject-alt-name.
    pub async fn get_cert(&self, host: &str) -> Result<Arc<IssuedCert>, CertError> {
        self.get_cert_for(host, &[]).await
    }

    /// Leaf for `host` carrying `alt_names` in addition to the host. Extra
    /// names only take effect on a cache miss; the cache key stays the host.
    pub async fn get_cert_for(
        &self,
        host: &str,
        alt_names: &[String],
    ) -> Result<Arc<IssuedCert>, CertError> {
        let key = normalize_host(host);
        let now = OffsetDateTime::now_utc();

        if let Some(hit) = self.lookup_fresh(&key, now) {
            return Ok(hit);
        }

        let gate = self
            .issue_gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _signing = gate.lock().await;

        // A concurrent caller may have filled the cache while we waited.
        if let Some(hit) = self.lookup_fresh(&key, now) {
            return Ok(hit);
        }

        let issued = Arc::new(self.issue_leaf(&key, alt_names)?);
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(key.clone(), Arc::clone(&issued));
        self.issue_gates.remove(&key);
        debug!(host = %key, "issued leaf certificate");
        Ok(issued)
    }

    fn lookup_fresh(&self, key: &str, now: OffsetDateTime) -> Option<Arc<IssuedCert>> {
        match self.cache.get(key) {
            Some(entry) if entry.is_fresh(now) => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(entry.value()))
            }
            Some(_) => {
                self.cache.remove(key);
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn issue_leaf(&self, host: &str, alt_names: &[String]) -> Result<IssuedCert, CertError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(rand::random::<u64>().into());

        let now = OffsetDateTime::now_utc();
        params.not_before = now - LEAF_NOT_BEFORE_SKEW;
        let not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
        params.not_after = not_after;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host.to_string());
        params.distinguished_name = dn;

        push_san(&mut params, host)?;
        for name in alt_names {
            let name = normalize_host(name);
            if name != host {
                push_san(&mut params, &name)?;
            }
        }

        let leaf_key = KeyPair::generate()?;
        let leaf_cert = params.signed_by(&leaf_key, &self.root.issuer)?;

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        Ok(IssuedCert {
            chain: vec![leaf_cert.der().clone(), self.root.cert_der.clone()],
            key,
            not_after,
        })
    }

    pub fn metrics_snapshot(&self) -> CertMetricsSnapshot {
        CertMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }
}

fn push_san(params: &mut CertificateParams, host: &str) -> Result<(), CertError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params.subject_alt_names.push(SanType::DnsName(
            host.try_into()
                .map_err(|error: rcgen::Error| CertError::InvalidMaterial(error.to_string()))?,
        ));
    }
    Ok(())
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;

    use super::{CertAuthority, CertMetricsSnapshot};

    #[tokio::test]
    async fn leaf_cache_hits_after_first_issue() {
        let authority = CertAuthority::in_memory().expect("authority");

        let first = authority.get_cert("api.example.com").await.expect("first");
        let second = authority
            .get_cert("API.EXAMPLE.COM")
            .await
            .expect("second");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            authority.metrics_snapshot(),
            CertMetricsSnapshot {
                cache_hits: 1,
                cache_misses: 1,
                leaves_issued: 1,
            }
        );
    }

    #[tokio::test]
    async fn concurrent_requests_sign_at_most_once() {
        let authority = Arc::new(CertAuthority::in_memory().expect("authority"));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let authority = Arc::clone(&authority);
            tasks.spawn(async move { authority.get_cert("dedup.example.com").await });
        }
        while let Some(result) = tasks.join_next().await {
            result.expect("join").expect("issue");
        }

        assert_eq!(authority.metrics_snapshot().leaves_issued, 1);
    }

    #[tokio::test]
    async fn leaf_for_dns_host_carries_dns_san_and_cn() {
        let authority = CertAuthority::in_memory().expect("authority");
        let issued = authority.get_cert("api.example.com").await.expect("leaf");

        let (_, cert) = parse_x509_certificate(issued.chain[0].as_ref()).expect("parse leaf");
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .expect("commonName")
            .as_str()
            .expect("commonName utf8");
        assert_eq!(cn, "api.example.com");

        let san = cert
            .subject_alternative_name()
            .expect("san parse")
            .expect("san present");
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName(value) if *value == "api.example.com")));
    }

    #[tokio::test]
    async fn leaf_for_ip_literal_carries_ip_san() {
        let authority = CertAuthority::in_memory().expect("authority");
        let issued = authority.get_cert("127.0.0.1").await.expect("leaf");

        let (_, cert) = parse_x509_certificate(issued.chain[0].as_ref()).expect("parse leaf");
        let san = cert
            .subject_alternative_name()
            .expect("san parse")
            .expect("san present");
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == [127, 0, 0, 1])));
    }

    #[tokio::test]
    async fn extra_alt_names_are_included_on_miss() {
        let authority = CertAuthority::in_memory().expect("authority");
        let issued = authority
            .get_cert_for(
                "example.com",
                &["www.example.com".to_string(), "10.0.0.1".to_string()],
            )
            .await
            .expect("leaf");

        let (_, cert) = parse_x509_certificate(issued.chain[0].as_ref()).expect("parse leaf");
        let san = cert
            .subject_alternative_name()
            .expect("san parse")
            .expect("san present");
        let names = &san.value.general_names;
        assert!(names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName(value) if *value == "www.example.com")));
        assert!(names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == [10, 0, 0, 1])));
    }

    #[tokio::test]
    async fn reloaded_authority_signs_leaves_verifiable_against_same_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = CertAuthority::load_or_create(dir.path()).expect("first authority");
        let root_pem = first.root_cert_pem().to_string();
        drop(first);

        let second = CertAuthority::load_or_create(dir.path()).expect("second authority");
        assert_eq!(second.root_cert_pem(), root_pem);

        let issued = second.get_cert("persisted.example.com").await.expect("leaf");
        let (_, leaf) = parse_x509_certificate(issued.chain[0].as_ref()).expect("parse leaf");
        let (_, root) = parse_x509_certificate(second.root_cert().as_ref()).expect("parse root");
        assert_eq!(leaf.issuer(), root.subject());
    }

    #[tokio::test]
    async fn server_config_presents_requested_alpn() {
        let authority = CertAuthority::in_memory().expect("authority");
        let issued = authority.get_cert("alpn.example.com").await.expect("leaf");
        let config = issued
            .server_config(vec![b"http/1.1".to_vec()])
            .expect("server config");
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
