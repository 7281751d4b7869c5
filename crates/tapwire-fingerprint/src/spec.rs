use crate::hello::ClientHello;
use crate::Fingerprint;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
const EXT_ALPN: u16 = 0x0010;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;
const EXT_KEY_SHARE: u16 = 0x0033;

/// One extension of the outbound ClientHello. Key shares carry only the
/// group; the key content is generated at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionSpec {
    ServerName(String),
    SupportedCurves(Vec<u16>),
    KeyShares(Vec<u16>),
    EcPointFormats(Vec<u8>),
    SignatureAlgorithms(Vec<u16>),
    Alpn(Vec<String>),
    SupportedVersions(Vec<u16>),
}

impl ExtensionSpec {
    pub fn extension_type(&self) -> u16 {
        match self {
            Self::ServerName(_) => EXT_SERVER_NAME,
            Self::SupportedCurves(_) => EXT_SUPPORTED_GROUPS,
            Self::KeyShares(_) => EXT_KEY_SHARE,
            Self::EcPointFormats(_) => EXT_EC_POINT_FORMATS,
            Self::SignatureAlgorithms(_) => EXT_SIGNATURE_ALGORITHMS,
            Self::Alpn(_) => EXT_ALPN,
            Self::SupportedVersions(_) => EXT_SUPPORTED_VERSIONS,
        }
    }

    /// Serialized form: type(2) length(2) payload. Deterministic, so two
    /// specs can be compared byte for byte in tests and diagnostics.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut out = Vec::with_capacity(payload.len() + 4);
        out.extend_from_slice(&self.extension_type().to_be_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::ServerName(name) => {
                let mut payload = Vec::with_capacity(name.len() + 5);
                payload.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
                payload.push(0);
                payload.extend_from_slice(&(name.len() as u16).to_be_bytes());
                payload.extend_from_slice(name.as_bytes());
                payload
            }
            Self::SupportedCurves(curves) => encode_u16_list(curves),
            Self::KeyShares(groups) => {
                // Zero-length key entries; real key material is per-handshake.
                let mut entries = Vec::with_capacity(groups.len() * 4);
                for group in groups {
                    entries.extend_from_slice(&group.to_be_bytes());
                    entries.extend_from_slice(&0u16.to_be_bytes());
                }
                let mut payload = Vec::with_capacity(entries.len() + 2);
                payload.extend_from_slice(&(entries.len() as u16).to_be_bytes());
                payload.extend_from_slice(&entries);
                payload
            }
            Self::EcPointFormats(formats) => {
                let mut payload = Vec::with_capacity(formats.len() + 1);
                payload.push(formats.len() as u8);
                payload.extend_from_slice(formats);
                payload
            }
            Self::SignatureAlgorithms(schemes) => encode_u16_list(schemes),
            Self::Alpn(protocols) => {
                let mut list = Vec::new();
                for proto in protocols {
                    list.push(proto.len() as u8);
                    list.extend_from_slice(proto.as_bytes());
                }
                let mut payload = Vec::with_capacity(list.len() + 2);
                payload.extend_from_slice(&(list.len() as u16).to_be_bytes());
                payload.extend_from_slice(&list);
                payload
            }
            Self::SupportedVersions(versions) => {
                let mut payload = Vec::with_capacity(versions.len() * 2 + 1);
                payload.push((versions.len() * 2) as u8);
                for version in versions {
                    payload.extend_from_slice(&version.to_be_bytes());
                }
                payload
            }
        }
    }
}

fn encode_u16_list(values: &[u16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(values.len() * 2 + 2);
    payload.extend_from_slice(&((values.len() * 2) as u16).to_be_bytes());
    for value in values {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    payload
}

/// The concrete outbound ClientHello a profile maps to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientHelloSpec {
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<ExtensionSpec>,
}

impl ClientHelloSpec {
    /// Appends an SNI extension when none is present.
    pub fn ensure_sni(&mut self, server_name: &str) {
        let has_sni = self
            .extensions
            .iter()
            .any(|extension| matches!(extension, ExtensionSpec::ServerName(_)));
        if !has_sni && !server_name.is_empty() {
            self.extensions
                .push(ExtensionSpec::ServerName(server_name.to_string()));
        }
    }

    /// Serialized extension block, suitable for byte comparison.
    pub fn encode_extensions(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for extension in &self.extensions {
            out.extend_from_slice(&extension.encode());
        }
        out
    }

    pub fn alpn(&self) -> Option<&[String]> {
        self.extensions.iter().find_map(|extension| match extension {
            ExtensionSpec::Alpn(protocols) => Some(protocols.as_slice()),
            _ => None,
        })
    }

    pub fn supported_versions(&self) -> Option<&[u16]> {
        self.extensions.iter().find_map(|extension| match extension {
            ExtensionSpec::SupportedVersions(versions) => Some(versions.as_slice()),
            _ => None,
        })
    }

    pub fn supported_curves(&self) -> Option<&[u16]> {
        self.extensions.iter().find_map(|extension| match extension {
            ExtensionSpec::SupportedCurves(curves) => Some(curves.as_slice()),
            _ => None,
        })
    }
}

/// Profile fields in fixed order; SNI is appended separately so the same
/// profile works for any destination.
pub(crate) fn spec_from_fingerprint(fingerprint: &Fingerprint) -> ClientHelloSpec {
    let mut spec = ClientHelloSpec {
        cipher_suites: fingerprint.cipher_suites.clone(),
        compression_methods: vec![0],
        extensions: Vec::new(),
    };

    if !fingerprint.supported_curves.is_empty() {
        spec.extensions
            .push(ExtensionSpec::SupportedCurves(fingerprint.supported_curves.clone()));
        spec.extensions
            .push(ExtensionSpec::KeyShares(fingerprint.supported_curves.clone()));
    }
    if !fingerprint.ec_point_formats.is_empty() {
        spec.extensions
            .push(ExtensionSpec::EcPointFormats(fingerprint.ec_point_formats.clone()));
    }
    if !fingerprint.signature_schemes.is_empty() {
        spec.extensions.push(ExtensionSpec::SignatureAlgorithms(
            fingerprint.signature_schemes.clone(),
        ));
    }
    if !fingerprint.alpn.is_empty() {
        spec.extensions
            .push(ExtensionSpec::Alpn(fingerprint.alpn.clone()));
    }
    if !fingerprint.supported_versions.is_empty() {
        spec.extensions.push(ExtensionSpec::SupportedVersions(
            fingerprint.supported_versions.clone(),
        ));
    }
    spec
}

/// Mirror mode: the captured hello is copied field by field, SNI first,
/// preserving cipher order and injecting a key share per curve.
pub fn mirror_client_hello(hello: &ClientHello, server_name: &str) -> ClientHelloSpec {
    let mut spec = ClientHelloSpec {
        cipher_suites: hello.cipher_suites.clone(),
        compression_methods: vec![0],
        extensions: Vec::new(),
    };

    let sni = hello
        .server_name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| server_name.to_string());
    if !sni.is_empty() {
        spec.extensions.push(ExtensionSpec::ServerName(sni));
    }
    if !hello.supported_curves.is_empty() {
        spec.extensions
            .push(ExtensionSpec::SupportedCurves(hello.supported_curves.clone()));
        spec.extensions
            .push(ExtensionSpec::KeyShares(hello.supported_curves.clone()));
    }
    if !hello.ec_point_formats.is_empty() {
        spec.extensions
            .push(ExtensionSpec::EcPointFormats(hello.ec_point_formats.clone()));
    }
    if !hello.signature_schemes.is_empty() {
        spec.extensions
            .push(ExtensionSpec::SignatureAlgorithms(hello.signature_schemes.clone()));
    }
    if !hello.alpn.is_empty() {
        spec.extensions.push(ExtensionSpec::Alpn(hello.alpn.clone()));
    }
    if !hello.supported_versions.is_empty() {
        spec.extensions.push(ExtensionSpec::SupportedVersions(
            hello.supported_versions.clone(),
        ));
    }
    spec
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::{ClientHelloSpec, ExtensionSpec};

    /// Wraps a spec into a full handshake record with fixed random bytes.
    pub(crate) fn encode_hello_record(spec: &ClientHelloSpec, raw_suites: &[u16]) -> Vec<u8> {
        let extensions = spec.encode_extensions();

        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes());
        body.extend_from_slice(&[0x42; 32]);
        body.push(0); // empty session id
        body.extend_from_slice(&((raw_suites.len() * 2) as u16).to_be_bytes());
        for suite in raw_suites {
            body.extend_from_slice(&suite.to_be_bytes());
        }
        body.push(1);
        body.push(0); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::with_capacity(body.len() + 4);
        handshake.push(0x01);
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::with_capacity(handshake.len() + 5);
        record.extend_from_slice(&[0x16, 0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    pub(crate) fn build_test_client_hello() -> Vec<u8> {
        let spec = ClientHelloSpec {
            cipher_suites: vec![0x1301, 0x1302, 0xc02b],
            compression_methods: vec![0],
            extensions: vec![
                ExtensionSpec::ServerName("example.test".to_string()),
                ExtensionSpec::SupportedCurves(vec![29, 23]),
                ExtensionSpec::EcPointFormats(vec![0]),
                ExtensionSpec::SignatureAlgorithms(vec![0x0403, 0x0804]),
                ExtensionSpec::Alpn(vec!["h2".to_string(), "http/1.1".to_string()]),
                ExtensionSpec::SupportedVersions(vec![0x0304, 0x0303]),
            ],
        };
        encode_hello_record(&spec, &spec.cipher_suites)
    }

    pub(crate) fn build_test_client_hello_with_grease() -> Vec<u8> {
        let spec = ClientHelloSpec {
            cipher_suites: vec![0x1301],
            compression_methods: vec![0],
            extensions: vec![ExtensionSpec::SupportedCurves(vec![0x1a1a, 29])],
        };
        encode_hello_record(&spec, &[0x0a0a, 0x1301])
    }
}

#[cfg(test)]
mod tests {
    use super::{mirror_client_hello, ClientHelloSpec, ExtensionSpec};
    use crate::hello::parse_client_hello;
    use crate::Fingerprint;

    fn sample_fingerprint() -> Fingerprint {
        Fingerprint {
            name: "sample".to_string(),
            cipher_suites: vec![0x1301, 0x1302, 0xc02b],
            supported_versions: vec![0x0304, 0x0303],
            supported_curves: vec![29, 23],
            ec_point_formats: vec![0],
            signature_schemes: vec![0x0403, 0x0804],
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
        }
    }

    #[test]
    fn to_spec_injects_sni_for_destination() {
        let spec = sample_fingerprint().to_spec("upstream.test");
        let sni = spec.extensions.iter().find_map(|extension| match extension {
            ExtensionSpec::ServerName(name) => Some(name.clone()),
            _ => None,
        });
        assert_eq!(sni.as_deref(), Some("upstream.test"));
    }

    #[test]
    fn to_spec_is_deterministic() {
        let fingerprint = sample_fingerprint();
        let first = fingerprint.to_spec("upstream.test").encode_extensions();
        let second = fingerprint.to_spec("upstream.test").encode_extensions();
        assert_eq!(first, second);
    }

    #[test]
    fn key_share_entries_cover_every_curve() {
        let spec = sample_fingerprint().to_spec("upstream.test");
        let key_shares = spec.extensions.iter().find_map(|extension| match extension {
            ExtensionSpec::KeyShares(groups) => Some(groups.clone()),
            _ => None,
        });
        assert_eq!(key_shares, Some(vec![29, 23]));
    }

    #[test]
    fn mirror_preserves_field_order_and_copies_storage() {
        let record = super::tests_support::build_test_client_hello();
        let hello = parse_client_hello(&record).expect("parse");
        let spec = mirror_client_hello(&hello, "fallback.test");

        assert_eq!(spec.cipher_suites, hello.cipher_suites);
        match &spec.extensions[0] {
            ExtensionSpec::ServerName(name) => assert_eq!(name, "example.test"),
            other => panic!("first extension should be SNI, got {other:?}"),
        }
        assert_eq!(spec.alpn(), Some(&["h2".to_string(), "http/1.1".to_string()][..]));
        assert_eq!(spec.supported_versions(), Some(&[0x0304, 0x0303][..]));
    }

    #[test]
    fn mirrored_spec_round_trips_through_the_parser() {
        let record = super::tests_support::build_test_client_hello();
        let hello = parse_client_hello(&record).expect("parse original");

        let spec = mirror_client_hello(&hello, "");
        let re_encoded = super::tests_support::encode_hello_record(&spec, &spec.cipher_suites);
        let reparsed = parse_client_hello(&re_encoded).expect("parse mirrored");

        assert_eq!(reparsed.cipher_suites, hello.cipher_suites);
        assert_eq!(reparsed.supported_curves, hello.supported_curves);
        assert_eq!(reparsed.signature_schemes, hello.signature_schemes);
        assert_eq!(reparsed.alpn, hello.alpn);
        assert_eq!(reparsed.supported_versions, hello.supported_versions);
    }

    #[test]
    fn ensure_sni_is_idempotent() {
        let mut spec = ClientHelloSpec::default();
        spec.ensure_sni("a.test");
        spec.ensure_sni("b.test");
        let names: Vec<_> = spec
            .extensions
            .iter()
            .filter(|extension| matches!(extension, ExtensionSpec::ServerName(_)))
            .collect();
        assert_eq!(names.len(), 1);
    }
}
