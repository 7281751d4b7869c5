use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ProxyError;

pub const DEFAULT_STREAM_LARGE_BODIES: u64 = 5 * 1024 * 1024;

/// Proxy configuration. Every field is a key of the JSON document accepted
/// by [`Options::from_json_file`]; unset keys take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Listen address, `host:port` with an optional empty host (`:9080`).
    pub addr: String,
    /// Skip verification of upstream server certificates.
    pub ssl_insecure: bool,
    /// Hosts never intercepted (case-insensitive globs, checked first).
    pub ignore_hosts: Vec<String>,
    /// When non-empty, only matching hosts are intercepted.
    pub allow_hosts: Vec<String>,
    /// Root CA store directory; empty means `~/.mitmproxy`.
    pub cert_path: String,
    /// 0 = info, 1 = debug, 2 = debug with caller locations.
    pub debug: u8,
    /// Parent proxy URL (`http://…` or `socks5://…`), empty for direct.
    pub upstream: String,
    /// Connect upstream for certificate details before answering the
    /// client handshake (first attack) instead of lazily (lazy attack).
    pub upstream_cert: bool,
    /// Bodies above this byte count switch the flow to streaming.
    pub stream_large_bodies: u64,
    /// Structured log destination; empty logs to stdout.
    pub log_file: String,
    /// `user:pass`, `u1:p1|u2:p2`, or `any`.
    pub proxyauth: String,
    /// Outbound TLS profile name, path, or `client` for mirror mode.
    pub tls_fingerprint: String,
    /// Save the first observed ClientHello under this profile name.
    pub fingerprint_save: String,
    /// DNS resolver addresses (`ip` or `ip:port`); empty uses the system.
    pub dns_resolvers: Vec<String>,
    /// DNS retry count on failure.
    pub dns_retries: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            addr: ":9080".to_string(),
            ssl_insecure: false,
            ignore_hosts: Vec::new(),
            allow_hosts: Vec::new(),
            cert_path: String::new(),
            debug: 0,
            upstream: String::new(),
            upstream_cert: true,
            stream_large_bodies: DEFAULT_STREAM_LARGE_BODIES,
            log_file: String::new(),
            proxyauth: String::new(),
            tls_fingerprint: String::new(),
            fingerprint_save: String::new(),
            dns_resolvers: Vec::new(),
            dns_retries: 2,
        }
    }
}

impl Options {
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|error| {
            ProxyError::Config(format!("cannot read {}: {error}", path.display()))
        })?;
        serde_json::from_slice(&data).map_err(|error| {
            ProxyError::Config(format!("cannot parse {}: {error}", path.display()))
        })
    }

    pub(crate) fn listen_addr(&self) -> Result<SocketAddr, ProxyError> {
        let addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };
        addr.parse()
            .map_err(|_| ProxyError::Config(format!("invalid listen addr {:?}", self.addr)))
    }

    pub(crate) fn cert_dir(&self) -> PathBuf {
        if !self.cert_path.is_empty() {
            return PathBuf::from(&self.cert_path);
        }
        match std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
            Some(home) => PathBuf::from(home).join(".mitmproxy"),
            None => PathBuf::from(".mitmproxy"),
        }
    }
}

/// Parsed `proxyauth` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProxyAuth {
    Disabled,
    /// Accept any credentials as long as some are presented.
    Any,
    Credentials(Vec<(String, String)>),
}

impl ProxyAuth {
    pub(crate) fn parse(value: &str) -> Result<Self, ProxyError> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(Self::Disabled);
        }
        if value.eq_ignore_ascii_case("any") {
            return Ok(Self::Any);
        }

        let mut credentials = Vec::new();
        for pair in value.split('|') {
            let (user, pass) = pair.split_once(':').ok_or_else(|| {
                ProxyError::Config(format!("proxyauth entry {pair:?} is not user:pass"))
            })?;
            if user.is_empty() {
                return Err(ProxyError::Config(format!(
                    "proxyauth entry {pair:?} has an empty user"
                )));
            }
            credentials.push((user.to_string(), pass.to_string()));
        }
        Ok(Self::Credentials(credentials))
    }

    pub(crate) fn accepts(&self, user: &str, pass: &str) -> bool {
        match self {
            Self::Disabled => true,
            Self::Any => true,
            Self::Credentials(credentials) => credentials
                .iter()
                .any(|(expected_user, expected_pass)| expected_user == user && expected_pass == pass),
        }
    }
}

/// Case-insensitive glob match with `*` wildcards, checked against the
/// pattern list. Hosts are matched both bare and with their port.
pub(crate) fn match_host(host: &str, patterns: &[String]) -> bool {
    let host = host.to_ascii_lowercase();
    let bare = host.split(':').next().unwrap_or(&host).to_string();
    patterns.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        glob_match(&pattern, &host) || glob_match(&pattern, &bare)
    })
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_at(&pattern, &text)
}

fn glob_match_at(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            (0..=text.len()).any(|skip| glob_match_at(&pattern[1..], &text[skip..]))
        }
        Some(ch) => text.first() == Some(ch) && glob_match_at(&pattern[1..], &text[1..]),
    }
}
