use rand::seq::SliceRandom;
use rand::Rng;

use crate::Fingerprint;

const TLS13: u16 = 0x0304;
const TLS12: u16 = 0x0303;

const CURVE_X25519: u16 = 29;
const CURVE_P256: u16 = 23;
const CURVE_P384: u16 = 24;
const CURVE_P521: u16 = 25;
const FFDHE_2048: u16 = 256;
const FFDHE_3072: u16 = 257;

const SIG_ECDSA_P256_SHA256: u16 = 0x0403;
const SIG_ECDSA_P384_SHA384: u16 = 0x0503;
const SIG_ED25519: u16 = 0x0807;
const SIG_RSA_PSS_SHA256: u16 = 0x0804;
const SIG_RSA_PSS_SHA384: u16 = 0x0805;
const SIG_RSA_PSS_SHA512: u16 = 0x0806;
const SIG_RSA_PKCS1_SHA256: u16 = 0x0401;
const SIG_RSA_PKCS1_SHA384: u16 = 0x0501;
const SIG_RSA_PKCS1_SHA512: u16 = 0x0601;

const PRESET_NAMES: [&str; 9] = [
    "chrome", "firefox", "ios", "android", "edge", "safari", "360", "qq", "random",
];

pub fn preset_names() -> &'static [&'static str] {
    &PRESET_NAMES
}

/// Returns the preset for a built-in name, `None` otherwise. The name is
/// matched case-insensitively like the configuration surface expects.
pub fn preset(name: &str) -> Option<Fingerprint> {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "chrome" => Some(chrome()),
        "firefox" => Some(firefox()),
        "ios" => Some(ios()),
        "android" => Some(android()),
        "edge" => Some(edge()),
        "safari" => Some(safari()),
        "360" => Some(qihoo_360()),
        "qq" => Some(qq()),
        "random" => Some(random_preset()),
        _ => None,
    }
}

fn chrome() -> Fingerprint {
    Fingerprint {
        name: "chrome".to_string(),
        cipher_suites: vec![
            0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013,
            0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
        ],
        supported_versions: vec![TLS13, TLS12],
        supported_curves: vec![CURVE_X25519, CURVE_P256, CURVE_P384],
        ec_point_formats: vec![0],
        signature_schemes: vec![
            SIG_ECDSA_P256_SHA256,
            SIG_RSA_PSS_SHA256,
            SIG_RSA_PKCS1_SHA256,
            SIG_ECDSA_P384_SHA384,
            SIG_RSA_PSS_SHA384,
            SIG_RSA_PKCS1_SHA384,
            SIG_RSA_PSS_SHA512,
            SIG_RSA_PKCS1_SHA512,
        ],
        alpn: vec!["h2".to_string(), "http/1.1".to_string()],
    }
}

fn firefox() -> Fingerprint {
    Fingerprint {
        name: "firefox".to_string(),
        cipher_suites: vec![
            0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc00a,
            0xc009, 0xc013, 0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
        ],
        supported_versions: vec![TLS13, TLS12],
        supported_curves: vec![
            CURVE_X25519,
            CURVE_P256,
            CURVE_P384,
            CURVE_P521,
            FFDHE_2048,
            FFDHE_3072,
        ],
        ec_point_formats: vec![0],
        signature_schemes: vec![
            SIG_ECDSA_P256_SHA256,
            SIG_ECDSA_P384_SHA384,
            SIG_ED25519,
            SIG_RSA_PSS_SHA256,
            SIG_RSA_PSS_SHA384,
            SIG_RSA_PSS_SHA512,
            SIG_RSA_PKCS1_SHA256,
            SIG_RSA_PKCS1_SHA384,
            SIG_RSA_PKCS1_SHA512,
        ],
        alpn: vec!["h2".to_string(), "http/1.1".to_string()],
    }
}

fn ios() -> Fingerprint {
    Fingerprint {
        name: "ios".to_string(),
        ..apple_common()
    }
}

fn safari() -> Fingerprint {
    Fingerprint {
        name: "safari".to_string(),
        ..apple_common()
    }
}

fn apple_common() -> Fingerprint {
    Fingerprint {
        name: String::new(),
        cipher_suites: vec![
            0x1301, 0x1302, 0x1303, 0xc02c, 0xc02b, 0xcca9, 0xc030, 0xc02f, 0xcca8, 0xc00a,
            0xc009, 0xc014, 0xc013, 0x009d, 0x009c, 0x0035, 0x002f,
        ],
        supported_versions: vec![TLS13, TLS12],
        supported_curves: vec![CURVE_X25519, CURVE_P256, CURVE_P384, CURVE_P521],
        ec_point_formats: vec![0],
        signature_schemes: vec![
            SIG_ECDSA_P256_SHA256,
            SIG_RSA_PSS_SHA256,
            SIG_RSA_PKCS1_SHA256,
            SIG_ECDSA_P384_SHA384,
            SIG_RSA_PSS_SHA384,
            SIG_RSA_PKCS1_SHA384,
            SIG_RSA_PSS_SHA512,
            SIG_RSA_PKCS1_SHA512,
        ],
        alpn: vec!["h2".to_string(), "http/1.1".to_string()],
    }
}

fn android() -> Fingerprint {
    Fingerprint {
        name: "android".to_string(),
        cipher_suites: vec![
            0x1301, 0x1302, 0x1303, 0xc02b, 0xc02c, 0xcca9, 0xc02f, 0xc030, 0xcca8, 0x009c,
            0x009d, 0x002f, 0x0035,
        ],
        supported_versions: vec![TLS13, TLS12],
        supported_curves: vec![CURVE_X25519, CURVE_P256, CURVE_P384],
        ec_point_formats: vec![0],
        signature_schemes: vec![
            SIG_ECDSA_P256_SHA256,
            SIG_RSA_PSS_SHA256,
            SIG_RSA_PKCS1_SHA256,
            SIG_ECDSA_P384_SHA384,
            SIG_RSA_PSS_SHA384,
            SIG_RSA_PKCS1_SHA384,
        ],
        alpn: vec!["h2".to_string(), "http/1.1".to_string()],
    }
}

fn edge() -> Fingerprint {
    Fingerprint {
        name: "edge".to_string(),
        ..chrome()
    }
}

fn qihoo_360() -> Fingerprint {
    Fingerprint {
        name: "360".to_string(),
        cipher_suites: vec![
            0xc02b, 0xc02f, 0x009e, 0xcca9, 0xcca8, 0xccaa, 0xc02c, 0xc030, 0x009f, 0xc013,
            0xc014, 0x0033, 0x0039, 0x009c, 0x009d, 0x002f, 0x0035, 0x000a,
        ],
        supported_versions: vec![TLS12],
        supported_curves: vec![CURVE_X25519, CURVE_P256, CURVE_P384],
        ec_point_formats: vec![0],
        signature_schemes: vec![
            SIG_ECDSA_P256_SHA256,
            SIG_RSA_PSS_SHA256,
            SIG_RSA_PKCS1_SHA256,
            SIG_ECDSA_P384_SHA384,
            SIG_RSA_PSS_SHA384,
            SIG_RSA_PKCS1_SHA384,
            SIG_RSA_PKCS1_SHA512,
        ],
        alpn: vec!["http/1.1".to_string()],
    }
}

fn qq() -> Fingerprint {
    Fingerprint {
        name: "qq".to_string(),
        cipher_suites: vec![
            0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013,
            0xc014, 0x009c, 0x009d, 0x002f, 0x0035, 0x000a,
        ],
        supported_versions: vec![TLS13, TLS12],
        supported_curves: vec![CURVE_X25519, CURVE_P256, CURVE_P384],
        ec_point_formats: vec![0],
        signature_schemes: vec![
            SIG_ECDSA_P256_SHA256,
            SIG_RSA_PSS_SHA256,
            SIG_RSA_PKCS1_SHA256,
            SIG_ECDSA_P384_SHA384,
            SIG_RSA_PSS_SHA384,
            SIG_RSA_PKCS1_SHA384,
        ],
        alpn: vec!["h2".to_string(), "http/1.1".to_string()],
    }
}

/// A randomized profile: one of the browser presets with its TLS 1.2 suite
/// tail and curve order shuffled. TLS 1.3 suites stay in front so the
/// result remains a handshake a real server accepts.
pub fn random_preset() -> Fingerprint {
    let mut rng = rand::thread_rng();
    let base = match rng.gen_range(0..4) {
        0 => chrome(),
        1 => firefox(),
        2 => safari(),
        _ => android(),
    };

    let mut fingerprint = base;
    fingerprint.name = "random".to_string();

    let tls13_len = fingerprint
        .cipher_suites
        .iter()
        .take_while(|suite| (0x1301..=0x1303).contains(*suite))
        .count();
    fingerprint.cipher_suites[tls13_len..].shuffle(&mut rng);
    fingerprint.supported_curves.shuffle(&mut rng);
    fingerprint
}
