//! Streaming piece commitment (commP).
//!
//! Bytes are Fr32-expanded in 127-byte quads into 32-byte leaves and folded
//! into a binary SHA-256 Merkle tree whose nodes are truncated to 254 bits.
//! Leaves beyond the end of the payload are filled with zero subtrees, which
//! is also how an existing commitment is padded to a larger piece size.

use crate::error::{PieceError, Result};
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::sync::OnceLock;

pub const NODE_SIZE: u64 = 32;
pub const QUAD_PAYLOAD_SIZE: usize = 127;
pub const QUAD_PADDED_SIZE: usize = 128;
pub const MIN_PIECE_SIZE: u64 = 128;
pub const MIN_PAYLOAD_SIZE: u64 = 65;

const ZERO_LEVELS: usize = 64;

pub type Commitment = [u8; 32];

/// Result of finalizing a [`CommpWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommpDigest {
    pub raw: Commitment,
    pub piece_size: u64,
}

/// Write sink that accumulates a piece commitment over everything written to it.
pub struct CommpWriter {
    quad: [u8; QUAD_PAYLOAD_SIZE],
    quad_len: usize,
    bytes_written: u64,
    leaves: u64,
    layers: Vec<Option<Commitment>>,
}

impl Default for CommpWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommpWriter {
    pub fn new() -> Self {
        Self {
            quad: [0u8; QUAD_PAYLOAD_SIZE],
            quad_len: 0,
            bytes_written: 0,
            leaves: 0,
            layers: Vec::new(),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn finalize(mut self) -> Result<CommpDigest> {
        if self.bytes_written < MIN_PAYLOAD_SIZE {
            return Err(PieceError::PayloadTooSmall(self.bytes_written));
        }

        if self.quad_len > 0 {
            self.quad[self.quad_len..].fill(0);
            self.absorb_quad();
        }

        let padded_leaves = self.leaves.next_power_of_two();
        let root_level = padded_leaves.trailing_zeros() as usize;

        for level in 0..root_level {
            let pending = self.layers.get_mut(level).and_then(Option::take);
            if let Some(node) = pending {
                let parent = hash_pair(&node, &zero_commitment(level));
                self.push_node(level + 1, parent);
            }
        }

        let raw = self
            .layers
            .get_mut(root_level)
            .and_then(Option::take)
            .ok_or_else(|| PieceError::Internal("commitment tree has no root".to_string()))?;

        Ok(CommpDigest {
            raw,
            piece_size: padded_leaves * NODE_SIZE,
        })
    }

    fn absorb_quad(&mut self) {
        let expanded = fr32_expand(&self.quad);
        for leaf in expanded.chunks_exact(NODE_SIZE as usize) {
            let mut node = [0u8; 32];
            node.copy_from_slice(leaf);
            self.push_node(0, node);
        }
        self.leaves += (QUAD_PADDED_SIZE as u64) / NODE_SIZE;
        self.quad_len = 0;
    }

    fn push_node(&mut self, mut level: usize, mut node: Commitment) {
        loop {
            if self.layers.len() <= level {
                self.layers.resize(level + 1, None);
            }
            match self.layers[level].take() {
                Some(left) => {
                    node = hash_pair(&left, &node);
                    level += 1;
                }
                None => {
                    self.layers[level] = Some(node);
                    return;
                }
            }
        }
    }
}

impl Write for CommpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let take = (QUAD_PAYLOAD_SIZE - self.quad_len).min(rest.len());
            self.quad[self.quad_len..self.quad_len + take].copy_from_slice(&rest[..take]);
            self.quad_len += take;
            rest = &rest[take..];

            if self.quad_len == QUAD_PAYLOAD_SIZE {
                self.absorb_quad();
            }
        }

        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A piece size is a power of two of at least [`MIN_PIECE_SIZE`] bytes.
pub fn is_valid_piece_size(size: u64) -> bool {
    size >= MIN_PIECE_SIZE && size.is_power_of_two()
}

pub fn validate_piece_size(size: u64) -> Result<()> {
    if !is_valid_piece_size(size) {
        return Err(PieceError::InvalidPieceSize(format!(
            "{} is not a power of two of at least {} bytes",
            size, MIN_PIECE_SIZE
        )));
    }
    Ok(())
}

/// Pad a commitment computed for `from_size` up to `to_size`.
pub fn pad_commp(raw: &Commitment, from_size: u64, to_size: u64) -> Result<Commitment> {
    validate_piece_size(from_size)?;
    validate_piece_size(to_size)?;

    if to_size < from_size {
        return Err(PieceError::InvalidPieceSize(format!(
            "cannot pad a {} byte piece down to {} bytes",
            from_size, to_size
        )));
    }

    let from_level = (from_size / NODE_SIZE).trailing_zeros() as usize;
    let to_level = (to_size / NODE_SIZE).trailing_zeros() as usize;

    let mut node = *raw;
    for level in from_level..to_level {
        node = hash_pair(&node, &zero_commitment(level));
    }

    Ok(node)
}

/// Root of a subtree of `2^level` zero leaves.
pub fn zero_commitment(level: usize) -> Commitment {
    static TABLE: OnceLock<Vec<Commitment>> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        let mut table = Vec::with_capacity(ZERO_LEVELS);
        let mut node = [0u8; 32];
        for _ in 0..ZERO_LEVELS {
            table.push(node);
            node = hash_pair(&node, &node);
        }
        table
    });
    table[level.min(ZERO_LEVELS - 1)]
}

fn hash_pair(left: &Commitment, right: &Commitment) -> Commitment {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut out: Commitment = hasher.finalize().into();
    out[31] &= 0b0011_1111;
    out
}

// 127 bytes hold four 254-bit field elements; each one is shifted into its own
// 32-byte leaf with the top two bits cleared.
fn fr32_expand(input: &[u8; QUAD_PAYLOAD_SIZE]) -> [u8; QUAD_PADDED_SIZE] {
    let mut out = [0u8; QUAD_PADDED_SIZE];

    out[..32].copy_from_slice(&input[..32]);
    out[31] &= 0b0011_1111;

    for i in 32..64 {
        out[i] = (input[i] << 2) | (input[i - 1] >> 6);
    }
    out[63] &= 0b0011_1111;

    for i in 64..96 {
        out[i] = (input[i] << 4) | (input[i - 1] >> 4);
    }
    out[95] &= 0b0011_1111;

    for i in 96..127 {
        out[i] = (input[i] << 6) | (input[i - 1] >> 2);
    }
    out[127] = input[126] >> 2;

    out
}
