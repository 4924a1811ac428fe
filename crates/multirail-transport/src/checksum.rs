//! Checksum functions for control headers and fragment payloads.
//!
//! Two functions are supported, selected once at configuration time: a
//! simple additive checksum (wrapping sum of little-endian 32-bit words)
//! and CRC32. Sender and receiver must agree on the selection.

use serde::{Deserialize, Serialize};

/// Checksum function applied to control headers and payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChecksumKind {
    /// Wrapping sum of 32-bit little-endian words (trailing bytes zero-padded).
    #[default]
    Additive,
    /// CRC32 (IEEE).
    Crc32,
}

/// Computes the checksum of `data` using the given function.
pub fn compute(kind: ChecksumKind, data: &[u8]) -> u32 {
    match kind {
        ChecksumKind::Additive => additive(data),
        ChecksumKind::Crc32 => crc32fast::hash(data),
    }
}

/// Returns true if `data` checksums to `expected` under `kind`.
pub fn verify(kind: ChecksumKind, data: &[u8], expected: u32) -> bool {
    compute(kind, data) == expected
}

fn additive(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(4);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut tail = [0u8; 4];
        tail[..rem.len()].copy_from_slice(rem);
        sum = sum.wrapping_add(u32::from_le_bytes(tail));
    }
    sum
}
