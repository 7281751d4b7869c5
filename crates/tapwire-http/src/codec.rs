use std::io::{Read, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BodyCodecError {
    #[error("unknown content encoding: {0:?}")]
    UnknownEncoding(String),
    #[error("{coding} decode failed: {source}")]
    Decode {
        coding: &'static str,
        source: std::io::Error,
    },
    #[error("{coding} encode failed: {source}")]
    Encode {
        coding: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Br,
    Zstd,
}

impl ContentEncoding {
    /// Parses a `Content-Encoding` header value. Empty or absent means
    /// identity; anything unrecognized is a typed error so callers can keep
    /// the original body untouched.
    pub fn parse(value: &str) -> Result<Self, BodyCodecError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Self::Identity),
            "gzip" => Ok(Self::Gzip),
            "deflate" => Ok(Self::Deflate),
            "br" => Ok(Self::Br),
            "zstd" => Ok(Self::Zstd),
            other => Err(BodyCodecError::UnknownEncoding(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Br => "br",
            Self::Zstd => "zstd",
        }
    }
}

pub fn decode_body(encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>, BodyCodecError> {
    match ContentEncoding::parse(encoding.unwrap_or(""))? {
        ContentEncoding::Identity => Ok(body.to_vec()),
        ContentEncoding::Gzip => {
            let mut out = Vec::with_capacity(body.len() * 2);
            flate2::read::MultiGzDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|source| BodyCodecError::Decode {
                    coding: "gzip",
                    source,
                })?;
            Ok(out)
        }
        ContentEncoding::Deflate => decode_deflate(body),
        ContentEncoding::Br => {
            let mut out = Vec::with_capacity(body.len() * 2);
            brotli::Decompressor::new(body, 4096)
                .read_to_end(&mut out)
                .map_err(|source| BodyCodecError::Decode {
                    coding: "br",
                    source,
                })?;
            Ok(out)
        }
        ContentEncoding::Zstd => {
            zstd::stream::decode_all(body).map_err(|source| BodyCodecError::Decode {
                coding: "zstd",
                source,
            })
        }
    }
}

/// Servers disagree on whether `deflate` means a zlib stream or a raw
/// DEFLATE stream; accept the zlib form first, then the raw form.
fn decode_deflate(body: &[u8]) -> Result<Vec<u8>, BodyCodecError> {
    let mut out = Vec::with_capacity(body.len() * 2);
    if flate2::read::ZlibDecoder::new(body)
        .read_to_end(&mut out)
        .is_ok()
    {
        return Ok(out);
    }

    out.clear();
    flate2::read::DeflateDecoder::new(body)
        .read_to_end(&mut out)
        .map_err(|source| BodyCodecError::Decode {
            coding: "deflate",
            source,
        })?;
    Ok(out)
}

pub fn encode_body(encoding: ContentEncoding, body: &[u8]) -> Result<Vec<u8>, BodyCodecError> {
    match encoding {
        ContentEncoding::Identity => Ok(body.to_vec()),
        ContentEncoding::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(body)
                .and_then(|_| encoder.finish())
                .map_err(|source| BodyCodecError::Encode {
                    coding: "gzip",
                    source,
                })
        }
        ContentEncoding::Deflate => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(body)
                .and_then(|_| encoder.finish())
                .map_err(|source| BodyCodecError::Encode {
                    coding: "deflate",
                    source,
                })
        }
        ContentEncoding::Br => {
            let mut out = Vec::new();
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer
                .write_all(body)
                .and_then(|_| writer.flush())
                .map_err(|source| BodyCodecError::Encode {
                    coding: "br",
                    source,
                })?;
            drop(writer);
            Ok(out)
        }
        ContentEncoding::Zstd => {
            zstd::stream::encode_all(body, 0).map_err(|source| BodyCodecError::Encode {
                coding: "zstd",
                source,
            })
        }
    }
}

/// A content type is text iff its lowercased value contains one of the
/// markers below. An empty content type is not text.
pub fn is_text_content_type(content_type: &str) -> bool {
    const MARKERS: [&str; 5] = ["text", "json", "xml", "javascript", "html"];
    let lower = content_type.to_ascii_lowercase();
    !lower.is_empty() && MARKERS.iter().any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        decode_body, encode_body, is_text_content_type, BodyCodecError, ContentEncoding,
    };

    const CODINGS: [ContentEncoding; 5] = [
        ContentEncoding::Identity,
        ContentEncoding::Gzip,
        ContentEncoding::Deflate,
        ContentEncoding::Br,
        ContentEncoding::Zstd,
    ];

    #[test]
    fn round_trips_every_supported_coding() {
        let body = b"The quick brown fox jumps over the lazy dog".repeat(64);
        for coding in CODINGS {
            let encoded = encode_body(coding, &body).expect("encode");
            let decoded = decode_body(Some(coding.as_str()), &encoded).expect("decode");
            assert_eq!(decoded, body, "coding {}", coding.as_str());
        }
    }

    #[test]
    fn absent_and_identity_encodings_behave_identically() {
        let body = b"plain bytes";
        assert_eq!(decode_body(None, body).expect("absent"), body.to_vec());
        assert_eq!(
            decode_body(Some("identity"), body).expect("identity"),
            body.to_vec()
        );
        assert_eq!(decode_body(Some(""), body).expect("empty"), body.to_vec());
    }

    #[test]
    fn unknown_encoding_is_a_typed_error() {
        let error = decode_body(Some("snappy"), b"payload").expect_err("must fail");
        match error {
            BodyCodecError::UnknownEncoding(value) => assert_eq!(value, "snappy"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn encoding_header_is_trimmed_and_case_insensitive() {
        let body = b"hello".to_vec();
        let encoded = encode_body(ContentEncoding::Gzip, &body).expect("encode");
        assert_eq!(
            decode_body(Some("  GZip "), &encoded).expect("decode"),
            body
        );
    }

    #[test]
    fn raw_deflate_stream_is_accepted() {
        use std::io::Write;
        let body = b"raw deflate without zlib wrapper".repeat(8);
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&body).expect("write");
        let raw = encoder.finish().expect("finish");

        assert_eq!(decode_body(Some("deflate"), &raw).expect("decode"), body);
    }

    #[test]
    fn text_classification_matches_marker_list() {
        assert!(is_text_content_type("text/html; charset=utf-8"));
        assert!(is_text_content_type("application/JSON"));
        assert!(is_text_content_type("application/xhtml+xml"));
        assert!(is_text_content_type("application/x-javascript"));
        assert!(!is_text_content_type("image/png"));
        assert!(!is_text_content_type("application/octet-stream"));
        assert!(!is_text_content_type(""));
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary_bodies(body in proptest::collection::vec(any::<u8>(), 0..4096)) {
            for coding in CODINGS {
                let encoded = encode_body(coding, &body).expect("encode");
                let decoded = decode_body(Some(coding.as_str()), &encoded).expect("decode");
                prop_assert_eq!(&decoded, &body);
            }
        }
    }
}
