//! Content identifiers for pieces and payloads.
//!
//! Both are CIDv1 rendered in lowercase base32 multibase (`b` prefix).

use crate::commp::Commitment;
use crate::error::{PieceError, Result};

const CID_VERSION: u64 = 1;
const CODEC_RAW: u64 = 0x55;
const CODEC_FIL_COMMITMENT_UNSEALED: u64 = 0xf101;
const MULTIHASH_SHA2_256: u64 = 0x12;
const MULTIHASH_SHA2_256_TRUNC254_PADDED: u64 = 0x1012;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Piece CID for a raw piece commitment (`baga6ea4seaq...`).
pub fn piece_cid(commitment: &Commitment) -> String {
    encode_cid(
        CODEC_FIL_COMMITMENT_UNSEALED,
        MULTIHASH_SHA2_256_TRUNC254_PADDED,
        commitment,
    )
}

/// Payload CID for a SHA-256 digest over raw bytes (`bafkrei...`).
pub fn payload_cid(sha256: &[u8; 32]) -> String {
    encode_cid(CODEC_RAW, MULTIHASH_SHA2_256, sha256)
}

/// Recover the raw commitment from a piece CID.
pub fn parse_piece_cid(cid: &str) -> Result<Commitment> {
    let body = cid
        .strip_prefix('b')
        .ok_or_else(|| PieceError::InvalidRequest(format!("unsupported multibase: {}", cid)))?;
    let bytes = base32_decode(body)
        .ok_or_else(|| PieceError::InvalidRequest(format!("invalid base32 in cid: {}", cid)))?;

    let mut expected = Vec::new();
    write_varint(&mut expected, CID_VERSION);
    write_varint(&mut expected, CODEC_FIL_COMMITMENT_UNSEALED);
    write_varint(&mut expected, MULTIHASH_SHA2_256_TRUNC254_PADDED);
    write_varint(&mut expected, 32);

    if bytes.len() != expected.len() + 32 || !bytes.starts_with(&expected) {
        return Err(PieceError::InvalidRequest(format!(
            "not a piece commitment cid: {}",
            cid
        )));
    }

    let mut commitment = [0u8; 32];
    commitment.copy_from_slice(&bytes[expected.len()..]);
    Ok(commitment)
}

fn encode_cid(codec: u64, multihash: u64, digest: &[u8; 32]) -> String {
    let mut bytes = Vec::with_capacity(40);
    write_varint(&mut bytes, CID_VERSION);
    write_varint(&mut bytes, codec);
    write_varint(&mut bytes, multihash);
    write_varint(&mut bytes, digest.len() as u64);
    bytes.extend_from_slice(digest);

    let mut out = String::with_capacity(1 + bytes.len() * 8 / 5 + 1);
    out.push('b');
    base32_encode(&bytes, &mut out);
    out
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn base32_encode(bytes: &[u8], out: &mut String) {
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for &byte in bytes {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }

    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
}

fn base32_decode(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for ch in text.bytes() {
        let value = BASE32_ALPHABET.iter().position(|&c| c == ch)? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commp::zero_commitment;

    #[test]
    fn test_piece_cid_prefix() {
        let cid = piece_cid(&zero_commitment(2));
        assert!(cid.starts_with("baga6ea4seaq"), "{}", cid);
    }

    #[test]
    fn test_payload_cid_prefix() {
        let cid = payload_cid(&[7u8; 32]);
        assert!(cid.starts_with("bafkrei"), "{}", cid);
    }

    #[test]
    fn test_parse_piece_cid() {
        let commitment = zero_commitment(10);
        let cid = piece_cid(&commitment);
        assert_eq!(parse_piece_cid(&cid).unwrap(), commitment);

        assert!(parse_piece_cid(&payload_cid(&[7u8; 32])).is_err());
        assert!(parse_piece_cid("zQm").is_err());
    }
}
