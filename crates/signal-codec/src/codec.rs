//! Encode/decode the opaque session-description blob exchanged during
//! handshake: JSON → optional gzip → base32 (or base64url) → prefixed string.

use std::io::{Read, Write};
use std::net::Ipv4Addr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use data_encoding::BASE32_NOPAD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::error::SignalCodecError;

const PREFIX_RAW_B64: &str = "SHR0:";
const PREFIX_GZ_B64: &str = "SHR1:";
const PREFIX_GZ_B32: &str = "SHR2:";
const PREFIX_RAW_B32: &str = "SHR3:";

/// `{type, description}` input to [`encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalDescriptor {
    pub kind: SignalKind,
    pub description: String,
}

/// The `c` field of the wire envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalCfg {
    pub stun: bool,
    pub file_unordered: bool,
    pub fast: bool,
}

#[derive(Serialize, Deserialize)]
struct WireCfg {
    stun: u8,
    #[serde(rename = "fileUnordered")]
    file_unordered: u8,
    fast: u8,
}

impl From<SignalCfg> for WireCfg {
    fn from(cfg: SignalCfg) -> Self {
        Self {
            stun: cfg.stun as u8,
            file_unordered: cfg.file_unordered as u8,
            fast: cfg.fast as u8,
        }
    }
}

impl From<WireCfg> for SignalCfg {
    fn from(w: WireCfg) -> Self {
        Self {
            stun: w.stun != 0,
            file_unordered: w.file_unordered != 0,
            fast: w.fast != 0,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    t: String,
    s: String,
    c: WireCfg,
}

/// Encode a descriptor and config into a prefixed signal string. Emits the
/// gzip+base32 prefix (`SHR2:`) when `compression_available && cfg`'s caller
/// has compression enabled, otherwise raw base32 (`SHR3:`). The encoder
/// never emits a base64url prefix; decoders still accept all four.
pub fn encode(desc: &SignalDescriptor, cfg: SignalCfg, use_compression: bool) -> String {
    let envelope = WireEnvelope {
        t: match desc.kind {
            SignalKind::Offer => "offer".to_string(),
            SignalKind::Answer => "answer".to_string(),
        },
        s: desc.description.clone(),
        c: cfg.into(),
    };
    let json = serde_json::to_vec(&envelope).expect("signal envelope always serializes");

    if use_compression {
        if let Ok(gz) = gzip_compress(&json) {
            return format!("{PREFIX_GZ_B32}{}", BASE32_NOPAD.encode(&gz));
        }
    }
    format!("{PREFIX_RAW_B32}{}", BASE32_NOPAD.encode(&json))
}

/// Decode a prefixed signal string produced by [`encode`] or by a peer
/// running any of the four supported prefix families.
pub fn decode(signal: &str) -> Result<(SignalDescriptor, SignalCfg), SignalCodecError> {
    let (prefix, body) = split_prefix(signal).ok_or(SignalCodecError::InvalidFormat)?;

    let bytes = match prefix {
        PREFIX_RAW_B64 => base64_decode(body)?,
        PREFIX_GZ_B64 => gzip_decompress(&base64_decode(body)?)?,
        PREFIX_GZ_B32 => gzip_decompress(&base32_decode(body)?)?,
        PREFIX_RAW_B32 => base32_decode(body)?,
        _ => return Err(SignalCodecError::InvalidFormat),
    };

    let envelope: WireEnvelope = serde_json::from_slice(&bytes)
        .map_err(|e| SignalCodecError::DecodeFailed(e.to_string()))?;

    let kind = match envelope.t.as_str() {
        "offer" => SignalKind::Offer,
        "answer" => SignalKind::Answer,
        other => return Err(SignalCodecError::DecodeFailed(format!("unknown type {other}"))),
    };

    Ok((
        SignalDescriptor {
            kind,
            description: envelope.s,
        },
        envelope.c.into(),
    ))
}

fn split_prefix(signal: &str) -> Option<(&str, &str)> {
    for prefix in [PREFIX_RAW_B64, PREFIX_GZ_B64, PREFIX_GZ_B32, PREFIX_RAW_B32] {
        if let Some(body) = signal.strip_prefix(prefix) {
            return Some((prefix, body));
        }
    }
    None
}

fn gzip_compress(bytes: &[u8]) -> Result<Vec<u8>, SignalCodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|_| SignalCodecError::DecompressionUnavailable)?;
    encoder
        .finish()
        .map_err(|_| SignalCodecError::DecompressionUnavailable)
}

fn gzip_decompress(bytes: &[u8]) -> Result<Vec<u8>, SignalCodecError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| SignalCodecError::DecompressionUnavailable)?;
    Ok(out)
}

fn base64_decode(body: &str) -> Result<Vec<u8>, SignalCodecError> {
    URL_SAFE_NO_PAD
        .decode(body.trim())
        .map_err(|e| SignalCodecError::DecodeFailed(e.to_string()))
}

/// Case-insensitive, whitespace-tolerant base32 decode.
fn base32_decode(body: &str) -> Result<Vec<u8>, SignalCodecError> {
    let cleaned: String = body
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect();
    BASE32_NOPAD
        .decode(cleaned.as_bytes())
        .map_err(|e| SignalCodecError::DecodeFailed(e.to_string()))
}

/// Rewrite `.local` host candidates in an SDP-like description to `ipv4`.
/// Scans `a=candidate:` lines whose 5th token ends in `.local` and whose
/// candidate type is `host`; no-op if no override is given.
pub fn rewrite_host_candidates(description: &str, ipv4: Option<Ipv4Addr>) -> String {
    let Some(ipv4) = ipv4 else {
        return description.to_string();
    };

    description
        .lines()
        .map(|line| rewrite_candidate_line(line, ipv4))
        .collect::<Vec<_>>()
        .join("\n")
}

fn rewrite_candidate_line(line: &str, ipv4: Ipv4Addr) -> String {
    if !line.starts_with("a=candidate:") {
        return line.to_string();
    }
    let mut tokens: Vec<&str> = line.split(' ').collect();
    if tokens.len() < 8 || tokens[7] != "host" {
        return line.to_string();
    }
    if !tokens[4].ends_with(".local") {
        return line.to_string();
    }
    let rewritten = ipv4.to_string();
    tokens[4] = &rewritten;
    tokens.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (SignalDescriptor, SignalCfg) {
        (
            SignalDescriptor {
                kind: SignalKind::Offer,
                description: "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n".to_string(),
            },
            SignalCfg {
                stun: true,
                file_unordered: false,
                fast: true,
            },
        )
    }

    #[test]
    fn encode_emits_gz_base32_when_compression_enabled() {
        let (desc, cfg) = sample();
        let encoded = encode(&desc, cfg, true);
        assert!(encoded.starts_with(PREFIX_GZ_B32));
    }

    #[test]
    fn encode_emits_raw_base32_when_compression_disabled() {
        let (desc, cfg) = sample();
        let encoded = encode(&desc, cfg, false);
        assert!(encoded.starts_with(PREFIX_RAW_B32));
    }

    #[test]
    fn decode_inverts_encode_for_all_four_prefixes() {
        let (desc, cfg) = sample();
        let json = serde_json::to_vec(&WireEnvelope {
            t: "offer".into(),
            s: desc.description.clone(),
            c: cfg.into(),
        })
        .unwrap();

        let raw_b64 = format!("{PREFIX_RAW_B64}{}", URL_SAFE_NO_PAD.encode(&json));
        let gz_b64 = format!(
            "{PREFIX_GZ_B64}{}",
            URL_SAFE_NO_PAD.encode(gzip_compress(&json).unwrap())
        );
        let gz_b32 = format!(
            "{PREFIX_GZ_B32}{}",
            BASE32_NOPAD.encode(&gzip_compress(&json).unwrap())
        );
        let raw_b32 = format!("{PREFIX_RAW_B32}{}", BASE32_NOPAD.encode(&json));

        for candidate in [raw_b64, gz_b64, gz_b32, raw_b32] {
            let (decoded_desc, decoded_cfg) = decode(&candidate).unwrap();
            assert_eq!(decoded_desc, desc);
            assert_eq!(decoded_cfg, cfg);
        }
    }

    #[test]
    fn base32_decode_is_case_insensitive_and_skips_whitespace() {
        let (desc, cfg) = sample();
        let encoded = encode(&desc, cfg, false);
        let body = encoded.strip_prefix(PREFIX_RAW_B32).unwrap();
        let mangled = format!("{PREFIX_RAW_B32}{}", body.to_lowercase().replace('a', "a \n"));
        let (decoded_desc, _) = decode(&mangled).unwrap();
        assert_eq!(decoded_desc, desc);
    }

    #[test]
    fn unknown_prefix_is_invalid_format() {
        assert!(matches!(
            decode("XXXX:abc"),
            Err(SignalCodecError::InvalidFormat)
        ));
    }

    #[test]
    fn rewrite_host_candidates_replaces_local_host_candidates() {
        let description = "a=candidate:1 1 UDP 2122260223 myhost.local 54321 typ host\nm=audio";
        let rewritten =
            rewrite_host_candidates(description, Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert!(rewritten.contains("192.168.1.20"));
        assert!(!rewritten.contains("myhost.local"));
    }

    #[test]
    fn rewrite_host_candidates_is_noop_without_override() {
        let description = "a=candidate:1 1 UDP 2122260223 myhost.local 54321 typ host";
        assert_eq!(rewrite_host_candidates(description, None), description);
    }
}
