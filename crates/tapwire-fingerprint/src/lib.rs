//! TLS client fingerprint profiles.
//!
//! A [`Fingerprint`] is a compact description of a ClientHello: cipher-suite
//! order, supported versions, named curves, EC point formats, signature
//! schemes, and ALPN. Profiles come from built-in presets, from JSON files
//! in the per-user profile directory, or from mirroring the ClientHello a
//! client actually presented. [`Fingerprint::to_spec`] turns a profile into
//! the outbound [`ClientHelloSpec`] used when dialing upstream.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod hello;
mod presets;
mod spec;
mod store;

pub use hello::{is_tls_record_header, parse_client_hello, ClientHello};
pub use presets::{preset, preset_names, random_preset};
pub use spec::{mirror_client_hello, ClientHelloSpec, ExtensionSpec};
pub use store::{list_profiles, load_profile, profile_dir, save_profile};

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("profile I/O failed for {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("profile JSON was invalid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("profile not found: {0}")]
    NotFound(String),
    #[error("ClientHello parse failed: {0}")]
    Parse(&'static str),
}

/// Invariant: every field is an owned copy; nothing aliases the captured
/// ClientHello it may have been built from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fingerprint {
    #[serde(default)]
    pub name: String,
    pub cipher_suites: Vec<u16>,
    pub supported_versions: Vec<u16>,
    pub supported_curves: Vec<u16>,
    #[serde(rename = "supported_points")]
    pub ec_point_formats: Vec<u8>,
    pub signature_schemes: Vec<u16>,
    #[serde(rename = "alpn_protocols")]
    pub alpn: Vec<String>,
}

impl Fingerprint {
    /// Copies the captured hello field by field.
    pub fn from_client_hello(name: &str, hello: &ClientHello) -> Self {
        Self {
            name: name.to_string(),
            cipher_suites: hello.cipher_suites.clone(),
            supported_versions: hello.supported_versions.clone(),
            supported_curves: hello.supported_curves.clone(),
            ec_point_formats: hello.ec_point_formats.clone(),
            signature_schemes: hello.signature_schemes.clone(),
            alpn: hello.alpn.clone(),
        }
    }

    /// Builds the outbound spec, injecting an SNI entry for `server_name`
    /// when the profile itself carries none.
    pub fn to_spec(&self, server_name: &str) -> ClientHelloSpec {
        let mut spec = spec::spec_from_fingerprint(self);
        spec.ensure_sni(server_name);
        spec
    }
}

/// How the upstream ClientHello is chosen for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emulation {
    /// No emulation configured; the stack's default hello is used.
    Default,
    /// Mirror the ClientHello the client presented.
    MirrorClient,
    /// A named preset or stored profile.
    Profile(Fingerprint),
}

/// Resolution ladder for a configured fingerprint name: built-in preset,
/// then filesystem path, then the per-user profile directory. Unresolvable
/// names fall back to the `chrome` preset with a warning.
pub fn resolve_emulation(name: &str) -> Emulation {
    if name.is_empty() {
        return Emulation::Default;
    }
    if name.eq_ignore_ascii_case("client") {
        return Emulation::MirrorClient;
    }
    if let Some(found) = presets::preset(name) {
        return Emulation::Profile(found);
    }
    match store::load_profile(name) {
        Ok(profile) => Emulation::Profile(profile),
        Err(error) => {
            tracing::warn!(profile = name, %error, "fingerprint profile unavailable, falling back to chrome");
            Emulation::Profile(presets::preset("chrome").expect("chrome preset exists"))
        }
    }
}
