use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tapwire_fingerprint::{parse_client_hello, ClientHello, ClientHelloSpec};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::buffered::BufferedConn;

const TLS12_WIRE: u16 = 0x0303;
const TLS13_WIRE: u16 = 0x0304;

/// Builds the upstream client config from a fingerprint spec: cipher-suite
/// order, named-group preference, and protocol versions are narrowed to
/// what the spec lists; anything rustls cannot express stays on the spec
/// for diagnostics only. ALPN is pinned to HTTP/1.1 because that is the
/// protocol the intercepted pipeline speaks.
pub(crate) fn upstream_client_config(
    spec: Option<&ClientHelloSpec>,
    insecure: bool,
) -> Result<Arc<ClientConfig>, rustls::Error> {
    let base = rustls::crypto::aws_lc_rs::default_provider();
    let provider = match spec {
        Some(spec) => narrowed_provider(base, spec),
        None => base,
    };

    let versions = spec
        .and_then(ClientHelloSpec::supported_versions)
        .map(|versions| {
            let mut selected = Vec::new();
            if versions.contains(&TLS13_WIRE) {
                selected.push(&rustls::version::TLS13);
            }
            if versions.contains(&TLS12_WIRE) {
                selected.push(&rustls::version::TLS12);
            }
            selected
        })
        .filter(|selected| !selected.is_empty())
        .unwrap_or_else(|| rustls::DEFAULT_VERSIONS.to_vec());

    let builder =
        ClientConfig::builder_with_provider(Arc::new(provider)).with_protocol_versions(&versions)?;

    let mut config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    let offers_http1 = spec
        .and_then(ClientHelloSpec::alpn)
        .map(|alpn| alpn.iter().any(|proto| proto == "http/1.1"))
        .unwrap_or(true);
    config.alpn_protocols = if offers_http1 {
        vec![b"http/1.1".to_vec()]
    } else {
        Vec::new()
    };

    Ok(Arc::new(config))
}

/// Keeps only the cipher suites and key-exchange groups the spec lists,
/// preserving the spec's order. Empty intersections fall back to the
/// provider defaults so a handshake always remains possible.
fn narrowed_provider(base: CryptoProvider, spec: &ClientHelloSpec) -> CryptoProvider {
    let mut cipher_suites = Vec::new();
    for wanted in &spec.cipher_suites {
        if let Some(suite) = base
            .cipher_suites
            .iter()
            .find(|suite| u16::from(suite.suite()) == *wanted)
        {
            cipher_suites.push(*suite);
        }
    }
    if cipher_suites.is_empty() {
        cipher_suites = base.cipher_suites.clone();
    }

    let mut kx_groups = Vec::new();
    if let Some(curves) = spec.supported_curves() {
        for wanted in curves {
            if let Some(group) = base
                .kx_groups
                .iter()
                .find(|group| u16::from(group.name()) == *wanted)
            {
                kx_groups.push(*group);
            }
        }
    }
    if kx_groups.is_empty() {
        kx_groups = base.kx_groups.clone();
    }

    CryptoProvider {
        cipher_suites,
        kx_groups,
        ..base
    }
}

pub(crate) async fn upstream_handshake(
    config: Arc<ClientConfig>,
    host: &str,
    stream: TcpStream,
) -> io::Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid upstream SNI name"))?;
    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|error| io::Error::other(format!("upstream TLS handshake failed: {error}")))
}

/// Reads the client's first TLS record off the buffered connection without
/// consuming it and parses the ClientHello. `Ok(None)` means the bytes are
/// not TLS (plaintext after CONNECT) or the record never completed.
pub(crate) async fn capture_client_hello<S>(
    conn: &mut BufferedConn<S>,
) -> io::Result<Option<ClientHello>>
where
    S: tokio::io::AsyncRead + Unpin,
{
    // Three bytes decide TLS-or-plaintext; the record length needs five.
    if !conn.fill_at_least(3).await? {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed before the TLS handshake",
        ));
    }
    if !tapwire_fingerprint::is_tls_record_header(&conn.read_buf[..3]) {
        return Ok(None);
    }
    if !conn.fill_at_least(5).await? {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed inside the TLS record header",
        ));
    }

    let record_len = u16::from_be_bytes([conn.read_buf[3], conn.read_buf[4]]) as usize;
    if !conn.fill_at_least(5 + record_len).await? {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed mid ClientHello",
        ));
    }

    match parse_client_hello(&conn.read_buf[..5 + record_len]) {
        Ok(hello) => Ok(Some(hello)),
        Err(error) => {
            debug!(%error, "ClientHello parse failed, proceeding without capture");
            Ok(Some(ClientHello::default()))
        }
    }
}

/// ALPN offer toward the client: the intersection of what the client
/// offered and what the proxy serves (HTTP/1.1).
pub(crate) fn client_alpn_offer(hello: Option<&ClientHello>) -> Vec<Vec<u8>> {
    let offered_http1 = hello
        .map(|hello| hello.alpn.iter().any(|proto| proto == "http/1.1"))
        .unwrap_or(false);
    if offered_http1 {
        vec![b"http/1.1".to_vec()]
    } else {
        Vec::new()
    }
}

/// Subject-alternative names of an upstream leaf, used to mint a matching
/// local leaf in the first attack.
pub(crate) fn certificate_alt_names(cert: &CertificateDer<'_>) -> Vec<String> {
    let Ok((_, parsed)) = x509_parser::parse_x509_certificate(cert.as_ref()) else {
        return Vec::new();
    };
    let Ok(Some(san)) = parsed.subject_alternative_name() else {
        return Vec::new();
    };

    let mut names = Vec::new();
    for name in &san.value.general_names {
        match name {
            x509_parser::extensions::GeneralName::DNSName(dns) => {
                names.push((*dns).to_string());
            }
            x509_parser::extensions::GeneralName::IPAddress(raw) => {
                if raw.len() == 4 {
                    names.push(std::net::Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]).to_string());
                } else if raw.len() == 16 {
                    let mut octets = [0_u8; 16];
                    octets.copy_from_slice(raw);
                    names.push(std::net::Ipv6Addr::from(octets).to_string());
                }
            }
            _ => {}
        }
    }
    names
}

#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
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
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use tapwire_fingerprint::{ClientHello, Fingerprint};

    use super::{client_alpn_offer, upstream_client_config};

    fn spec_fingerprint(alpn: Vec<String>) -> Fingerprint {
        Fingerprint {
            name: "test".to_string(),
            cipher_suites: vec![0x1301, 0x1302],
            supported_versions: vec![0x0304],
            supported_curves: vec![29, 23],
            ec_point_formats: vec![0],
            signature_schemes: vec![0x0403],
            alpn,
        }
    }

    #[test]
    fn config_narrows_to_spec_versions_and_pins_http1_alpn() {
        let fingerprint = spec_fingerprint(vec!["h2".to_string(), "http/1.1".to_string()]);
        let spec = fingerprint.to_spec("example.test");
        let config = upstream_client_config(Some(&spec), false).expect("config");
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn spec_without_http1_alpn_omits_the_offer() {
        let fingerprint = spec_fingerprint(vec!["h2".to_string()]);
        let spec = fingerprint.to_spec("example.test");
        let config = upstream_client_config(Some(&spec), false).expect("config");
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn default_config_offers_http1() {
        let config = upstream_client_config(None, true).expect("config");
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn client_alpn_offer_is_the_intersection() {
        let mut hello = ClientHello::default();
        assert!(client_alpn_offer(Some(&hello)).is_empty());

        hello.alpn = vec!["h2".to_string(), "http/1.1".to_string()];
        assert_eq!(client_alpn_offer(Some(&hello)), vec![b"http/1.1".to_vec()]);

        assert!(client_alpn_offer(None).is_empty());
    }
}
