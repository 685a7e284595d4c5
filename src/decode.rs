//! Response body decoding for the accounting path.
//!
//! Upstream bodies arrive with a Content-Encoding header that may be
//! missing or wrong, so decoding is a chain: trust the header first, then
//! sniff the gzip magic, then try the remaining codecs in a fixed order,
//! accepting the first output that is plausibly JSON. A body no codec can
//! turn into JSON-looking text is opaque; the caller skips accounting and
//! delivers the original bytes untouched.

use std::io::Read;

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no decoder produced a json-like body")]
    Undecodable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Brotli,
    Deflate,
}

/// Codecs attempted after gzip sniffing fails, in order. Brotli before
/// deflate: raw deflate has no framing and will "succeed" on junk more
/// often, so it goes last.
const SNIFF_FALLBACK: [Codec; 2] = [Codec::Brotli, Codec::Deflate];

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

impl Codec {
    /// Maps a Content-Encoding header to a codec. Multi-valued headers
    /// ("br, gzip") resolve to the first recognized token.
    pub fn from_content_encoding(value: &str) -> Option<Self> {
        value.split(',').map(str::trim).find_map(|token| {
            match token.to_ascii_lowercase().as_str() {
                "gzip" | "x-gzip" => Some(Codec::Gzip),
                "br" => Some(Codec::Brotli),
                "deflate" => Some(Codec::Deflate),
                _ => None,
            }
        })
    }

    pub fn decode(&self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Codec::Gzip => {
                flate2::read::GzDecoder::new(input).read_to_end(&mut out)?;
            }
            Codec::Brotli => {
                brotli::Decompressor::new(input, 4096).read_to_end(&mut out)?;
            }
            Codec::Deflate => {
                // HTTP "deflate" is zlib-wrapped in practice but raw in the
                // wild; accept both.
                if flate2::read::ZlibDecoder::new(input)
                    .read_to_end(&mut out)
                    .is_err()
                {
                    out.clear();
                    flate2::read::DeflateDecoder::new(input).read_to_end(&mut out)?;
                }
            }
        }
        Ok(out)
    }
}

/// The accounting path only needs to recognize a JSON object or array; a
/// full parse happens later, once, on the winning candidate.
pub fn looks_like_json(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|byte| *byte == b'{' || *byte == b'[')
}

pub fn has_gzip_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC
}

#[derive(Clone, Debug)]
pub struct DecodedBody {
    pub bytes: Bytes,
    /// Codec that produced the JSON-looking text; None for plaintext.
    pub codec: Option<Codec>,
}

/// Decodes a fully buffered upstream body into JSON-looking text.
///
/// Order: declared Content-Encoding, then the raw bytes as-is, then gzip
/// magic sniffing, then the fixed fallback codecs. Every branch is gated
/// on [`looks_like_json`] so a decoder that "succeeds" on garbage does not
/// win.
pub fn decode_body(raw: &Bytes, content_encoding: Option<&str>) -> Result<DecodedBody, DecodeError> {
    if let Some(codec) = content_encoding.and_then(Codec::from_content_encoding) {
        if let Ok(decoded) = codec.decode(raw) {
            if looks_like_json(&decoded) {
                return Ok(DecodedBody {
                    bytes: Bytes::from(decoded),
                    codec: Some(codec),
                });
            }
        }
    }

    if looks_like_json(raw) {
        return Ok(DecodedBody {
            bytes: raw.clone(),
            codec: None,
        });
    }

    if has_gzip_magic(raw) {
        if let Ok(decoded) = Codec::Gzip.decode(raw) {
            if looks_like_json(&decoded) {
                return Ok(DecodedBody {
                    bytes: Bytes::from(decoded),
                    codec: Some(Codec::Gzip),
                });
            }
        }
    }

    for codec in SNIFF_FALLBACK {
        if let Ok(decoded) = codec.decode(raw) {
            if looks_like_json(&decoded) {
                return Ok(DecodedBody {
                    bytes: Bytes::from(decoded),
                    codec: Some(codec),
                });
            }
        }
    }

    Err(DecodeError::Undecodable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BODY: &str = r#"{"model":"gpt-4o-mini","usage":{"prompt_tokens":100,"completion_tokens":50}}"#;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).expect("gzip write");
        encoder.finish().expect("gzip finish")
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).expect("zlib write");
        encoder.finish().expect("zlib finish")
    }

    fn br(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(data).expect("brotli write");
        }
        out
    }

    #[test]
    fn decodes_with_correct_header() {
        for (encoding, encoded) in [
            ("gzip", gzip(BODY.as_bytes())),
            ("br", br(BODY.as_bytes())),
            ("deflate", zlib(BODY.as_bytes())),
        ] {
            let decoded =
                decode_body(&Bytes::from(encoded), Some(encoding)).expect("decoded");
            assert_eq!(decoded.bytes.as_ref(), BODY.as_bytes(), "codec {encoding}");
        }
    }

    #[test]
    fn plaintext_json_passes_through() {
        let decoded = decode_body(&Bytes::from_static(BODY.as_bytes()), None).expect("decoded");
        assert_eq!(decoded.bytes.as_ref(), BODY.as_bytes());
        assert!(decoded.codec.is_none());
    }

    #[test]
    fn sniffs_gzip_when_header_is_missing() {
        let decoded = decode_body(&Bytes::from(gzip(BODY.as_bytes())), None).expect("decoded");
        assert_eq!(decoded.codec, Some(Codec::Gzip));
        assert_eq!(decoded.bytes.as_ref(), BODY.as_bytes());
    }

    #[test]
    fn sniffs_gzip_when_header_is_wrong() {
        let decoded =
            decode_body(&Bytes::from(gzip(BODY.as_bytes())), Some("identity")).expect("decoded");
        assert_eq!(decoded.codec, Some(Codec::Gzip));
        assert_eq!(decoded.bytes.as_ref(), BODY.as_bytes());
    }

    #[test]
    fn falls_back_to_brotli_then_deflate() {
        let decoded = decode_body(&Bytes::from(br(BODY.as_bytes())), None).expect("decoded");
        assert_eq!(decoded.codec, Some(Codec::Brotli));

        let decoded = decode_body(&Bytes::from(zlib(BODY.as_bytes())), None).expect("decoded");
        assert_eq!(decoded.codec, Some(Codec::Deflate));
    }

    #[test]
    fn mislabeled_brotli_body_still_decodes() {
        // Header claims gzip, payload is brotli.
        let decoded =
            decode_body(&Bytes::from(br(BODY.as_bytes())), Some("gzip")).expect("decoded");
        assert_eq!(decoded.codec, Some(Codec::Brotli));
        assert_eq!(decoded.bytes.as_ref(), BODY.as_bytes());
    }

    #[test]
    fn raw_deflate_is_accepted() {
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(BODY.as_bytes()).expect("deflate write");
        let encoded = encoder.finish().expect("deflate finish");

        let decoded = decode_body(&Bytes::from(encoded), Some("deflate")).expect("decoded");
        assert_eq!(decoded.bytes.as_ref(), BODY.as_bytes());
    }

    #[test]
    fn opaque_body_is_an_error() {
        let err = decode_body(&Bytes::from_static(b"\x00\x01\x02binary"), None).unwrap_err();
        assert!(matches!(err, DecodeError::Undecodable));
    }

    #[test]
    fn non_json_plaintext_is_opaque() {
        let err = decode_body(&Bytes::from_static(b"hello world"), None).unwrap_err();
        assert!(matches!(err, DecodeError::Undecodable));
    }

    #[test]
    fn gzipped_non_json_is_opaque() {
        let err = decode_body(&Bytes::from(gzip(b"plain text")), Some("gzip")).unwrap_err();
        assert!(matches!(err, DecodeError::Undecodable));
    }

    #[test]
    fn json_shape_check_ignores_leading_whitespace() {
        assert!(looks_like_json(b"  \n\t{\"a\":1}"));
        assert!(looks_like_json(b"[1,2]"));
        assert!(!looks_like_json(b"  plain"));
        assert!(!looks_like_json(b""));
    }
}
