use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};

use crate::CertError;

pub(crate) const ROOT_COMMON_NAME: &str = "mitmproxy";
pub(crate) const ROOT_ORGANIZATION: &str = "mitmproxy";
const ROOT_KEY_BITS: usize = 2048;
const ROOT_VALIDITY_DAYS: i64 = 10 * 365;

/// Combined key-then-cert PEM, the canonical on-disk form.
pub const COMBINED_FILE: &str = "mitmproxy-ca.pem";
/// Certificate-only copy written for import into client trust stores.
pub const CERT_EXPORT_FILE: &str = "mitmproxy-ca-cert.cer";

#[derive(Debug)]
pub(crate) struct RootMaterial {
    pub issuer: Issuer<'static, KeyPair>,
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
}

pub(crate) fn generate_root() -> Result<RootMaterial, CertError> {
    let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), ROOT_KEY_BITS)
        .map_err(|error| CertError::KeyGeneration(error.to_string()))?;
    let key_pem = rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|error| CertError::KeyGeneration(error.to_string()))?
        .to_string();
    let key = KeyPair::from_pem(&key_pem)?;

    let params = build_root_params();
    let cert = params.clone().self_signed(&key)?;
    let cert_pem = cert.pem();
    let cert_der = cert.der().clone();
    let issuer = Issuer::new(params, key);

    Ok(RootMaterial {
        issuer,
        cert_der,
        cert_pem,
        key_pem,
    })
}

fn build_root_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(1);
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    params.distinguished_name = dn;
    params
}

/// Loads the root from `dir` when the combined file exists, generates and
/// persists a fresh one when it does not. A present-but-unreadable store is
/// an error, never silently regenerated.
pub(crate) fn load_or_generate(dir: &Path) -> Result<RootMaterial, CertError> {
    let combined = dir.join(COMBINED_FILE);
    match fs::read(&combined) {
        Ok(bytes) => parse_combined(&bytes, &combined),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            let material = generate_root()?;
            persist_root(dir, &material)?;
            Ok(material)
        }
        Err(error) => Err(CertError::Store {
            path: combined,
            source: error,
        }),
    }
}

pub(crate) fn persist_root(dir: &Path, material: &RootMaterial) -> Result<(), CertError> {
    fs::create_dir_all(dir).map_err(|error| CertError::Store {
        path: dir.to_path_buf(),
        source: error,
    })?;

    let combined = dir.join(COMBINED_FILE);
    let mut body = material.key_pem.clone();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    body.push_str(&material.cert_pem);
    fs::write(&combined, body).map_err(|error| CertError::Store {
        path: combined,
        source: error,
    })?;

    let export = dir.join(CERT_EXPORT_FILE);
    fs::write(&export, &material.cert_pem).map_err(|error| CertError::Store {
        path: export,
        source: error,
    })
}

fn parse_combined(bytes: &[u8], path: &Path) -> Result<RootMaterial, CertError> {
    let mut key_pem: Option<String> = None;
    let mut cert_der: Option<CertificateDer<'static>> = None;

    let mut reader = io::BufReader::new(bytes);
    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|error| CertError::Store {
            path: path.to_path_buf(),
            source: error,
        })?;
        match item {
            rustls_pemfile::Item::Pkcs8Key(der) => {
                key_pem = Some(pkcs8_pem_from_rsa_der(der.secret_pkcs8_der(), path)?);
            }
            rustls_pemfile::Item::Pkcs1Key(der) => {
                // Legacy stores carry an "RSA PRIVATE KEY" block.
                let rsa_key = RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der())
                    .map_err(|error| CertError::InvalidMaterial(error.to_string()))?;
                let pem = rsa_key
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(|error| CertError::InvalidMaterial(error.to_string()))?
                    .to_string();
                key_pem = Some(pem);
            }
            rustls_pemfile::Item::Sec1Key(_) => {
                return Err(CertError::UnsupportedKey(
                    "EC private keys are not supported for the root".to_string(),
                ));
            }
            rustls_pemfile::Item::X509Certificate(der) => {
                cert_der = Some(der);
            }
            _ => {}
        }
    }

    let key_pem = key_pem.ok_or_else(|| {
        CertError::InvalidMaterial(format!("no private key block in {}", path.display()))
    })?;
    let cert_der = cert_der.ok_or_else(|| {
        CertError::InvalidMaterial(format!("no certificate block in {}", path.display()))
    })?;

    let key = KeyPair::from_pem(&key_pem)?;
    let cert_pem = pem_encode_certificate(&cert_der);
    let issuer = Issuer::from_ca_cert_der(&cert_der, key)
        .map_err(|error| CertError::InvalidMaterial(error.to_string()))?;

    Ok(RootMaterial {
        issuer,
        cert_der,
        cert_pem,
        key_pem,
    })
}

/// Round-trips a PKCS#8 key through the RSA parser so that non-RSA keys are
/// rejected with a typed error instead of failing later at signing time.
fn pkcs8_pem_from_rsa_der(der: &[u8], path: &Path) -> Result<String, CertError> {
    let rsa_key = RsaPrivateKey::from_pkcs8_der(der).map_err(|_| {
        CertError::UnsupportedKey(format!(
            "private key in {} is not an RSA key",
            path.display()
        ))
    })?;
    rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.to_string())
        .map_err(|error| CertError::InvalidMaterial(error.to_string()))
}

fn pem_encode_certificate(der: &CertificateDer<'_>) -> String {
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    out.push_str(&base64_line_fold(der.as_ref()));
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

fn base64_line_fold(bytes: &[u8]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 64 + 1);
    for line in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(line).expect("base64 output is ASCII"));
        out.push('\n');
    }
    out
}

pub(crate) fn store_paths(dir: &Path) -> (PathBuf, PathBuf) {
    (dir.join(COMBINED_FILE), dir.join(CERT_EXPORT_FILE))
}
