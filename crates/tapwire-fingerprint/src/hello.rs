use crate::FingerprintError;

/// GREASE values are dummy entries browsers inject to keep the ecosystem
/// tolerant; they are filtered out of captured fingerprints.
const GREASE_VALUES: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa,
    0xbaba, 0xcaca, 0xdada, 0xeaea, 0xfafa,
];

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
const EXT_ALPN: u16 = 0x0010;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

fn is_grease(value: u16) -> bool {
    GREASE_VALUES.contains(&value)
}

/// The fields of a captured ClientHello the proxy cares about, in
/// presentation order, GREASE filtered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientHello {
    pub version: u16,
    pub server_name: Option<String>,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
    pub supported_versions: Vec<u16>,
    pub supported_curves: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
    pub signature_schemes: Vec<u16>,
    pub alpn: Vec<String>,
}

/// True when `bytes` look like the start of a TLS handshake record
/// (`0x16 0x03 0x00..=0x03`). Used for the plaintext-or-TLS peek.
pub fn is_tls_record_header(bytes: &[u8]) -> bool {
    bytes.len() >= 3 && bytes[0] == 0x16 && bytes[1] == 0x03 && bytes[2] <= 0x03
}

/// Parses a ClientHello starting at the TLS record layer.
///
/// Record layout: content_type(1) record_version(2) record_len(2)
/// handshake_type(1) handshake_len(3) client_version(2) random(32)
/// session_id, cipher_suites, compression_methods, extensions.
pub fn parse_client_hello(data: &[u8]) -> Result<ClientHello, FingerprintError> {
    if data.len() < 11 {
        return Err(FingerprintError::Parse("record too short"));
    }
    if !is_tls_record_header(data) {
        return Err(FingerprintError::Parse("not a TLS handshake record"));
    }
    if data[5] != 0x01 {
        return Err(FingerprintError::Parse("not a ClientHello"));
    }

    let mut cursor = Cursor { data, pos: 9 };
    let mut hello = ClientHello {
        version: cursor.read_u16("client version")?,
        ..ClientHello::default()
    };

    cursor.skip(32, "random")?;
    let session_id_len = cursor.read_u8("session id length")? as usize;
    cursor.skip(session_id_len, "session id")?;

    let suites_len = cursor.read_u16("cipher suites length")? as usize;
    let suites_end = cursor.pos + suites_len;
    while cursor.pos + 1 < suites_end {
        let suite = cursor.read_u16("cipher suite")?;
        if !is_grease(suite) {
            hello.cipher_suites.push(suite);
        }
    }

    let compression_len = cursor.read_u8("compression methods length")? as usize;
    cursor.skip(compression_len, "compression methods")?;

    if cursor.pos >= data.len() {
        // Extension-less hellos are legal (ancient clients).
        return Ok(hello);
    }

    let extensions_len = cursor.read_u16("extensions length")? as usize;
    let extensions_end = cursor.pos + extensions_len;
    while cursor.pos + 4 <= extensions_end.min(data.len()) {
        let ext_type = cursor.read_u16("extension type")?;
        let ext_len = cursor.read_u16("extension length")? as usize;
        let body = cursor.take(ext_len, "extension body")?;
        if !is_grease(ext_type) {
            hello.extensions.push(ext_type);
        }
        parse_extension(&mut hello, ext_type, body)?;
    }

    Ok(hello)
}

fn parse_extension(
    hello: &mut ClientHello,
    ext_type: u16,
    body: &[u8],
) -> Result<(), FingerprintError> {
    match ext_type {
        EXT_SERVER_NAME => {
            // list_len(2) name_type(1) name_len(2) name
            if body.len() >= 5 && body[2] == 0 {
                let name_len = u16::from_be_bytes([body[3], body[4]]) as usize;
                if body.len() >= 5 + name_len {
                    hello.server_name = std::str::from_utf8(&body[5..5 + name_len])
                        .ok()
                        .map(ToOwned::to_owned);
                }
            }
        }
        EXT_SUPPORTED_GROUPS => {
            hello.supported_curves = parse_u16_list(body)?;
        }
        EXT_EC_POINT_FORMATS => {
            if !body.is_empty() {
                let len = body[0] as usize;
                if body.len() >= 1 + len {
                    hello.ec_point_formats = body[1..1 + len].to_vec();
                }
            }
        }
        EXT_SIGNATURE_ALGORITHMS => {
            hello.signature_schemes = parse_u16_list(body)?;
        }
        EXT_ALPN => {
            if body.len() >= 2 {
                let mut pos = 2;
                while pos < body.len() {
                    let len = body[pos] as usize;
                    pos += 1;
                    if len == 0 || pos + len > body.len() {
                        break;
                    }
                    if let Ok(proto) = std::str::from_utf8(&body[pos..pos + len]) {
                        hello.alpn.push(proto.to_string());
                    }
                    pos += len;
                }
            }
        }
        EXT_SUPPORTED_VERSIONS => {
            // len(1) then u16 entries
            if !body.is_empty() {
                let len = body[0] as usize;
                let mut pos = 1;
                while pos + 1 < 1 + len && pos + 1 < body.len() {
                    let version = u16::from_be_bytes([body[pos], body[pos + 1]]);
                    if !is_grease(version) {
                        hello.supported_versions.push(version);
                    }
                    pos += 2;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// A `len(2)` prefixed list of u16 entries, GREASE filtered.
fn parse_u16_list(body: &[u8]) -> Result<Vec<u16>, FingerprintError> {
    if body.len() < 2 {
        return Err(FingerprintError::Parse("truncated u16 list"));
    }
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let end = (2 + len).min(body.len());
    let mut out = Vec::with_capacity(len / 2);
    let mut pos = 2;
    while pos + 1 < end {
        let value = u16::from_be_bytes([body[pos], body[pos + 1]]);
        if !is_grease(value) {
            out.push(value);
        }
        pos += 2;
    }
    Ok(out)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_u8(&mut self, what: &'static str) -> Result<u8, FingerprintError> {
        if self.pos >= self.data.len() {
            return Err(FingerprintError::Parse(what));
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self, what: &'static str) -> Result<u16, FingerprintError> {
        if self.pos + 2 > self.data.len() {
            return Err(FingerprintError::Parse(what));
        }
        let value = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn skip(&mut self, count: usize, what: &'static str) -> Result<(), FingerprintError> {
        if self.pos + count > self.data.len() {
            return Err(FingerprintError::Parse(what));
        }
        self.pos += count;
        Ok(())
    }

    fn take(&mut self, count: usize, what: &'static str) -> Result<&'a [u8], FingerprintError> {
        if self.pos + count > self.data.len() {
            return Err(FingerprintError::Parse(what));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }
}
