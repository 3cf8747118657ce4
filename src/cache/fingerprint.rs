//! Content fingerprints for duplicate and near-duplicate detection.
//!
//! Two fingerprints are computed per document:
//!
//! - A SHA-256 digest of the raw bytes, used as the authoritative cache key
//!   for exact matches.
//! - A 64-bit simhash over 4-byte shingles, used for near-duplicate
//!   detection: similar byte streams produce simhashes with small Hamming
//!   distance. Similarity is `1 - hamming/64`, so the 0.95 acceptance
//!   threshold corresponds to a Hamming distance of at most 3 bits.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// How many consecutive bytes form one simhash shingle.
const SHINGLE_LEN: usize = 4;

/// An exact content fingerprint (hex-encoded SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Fingerprints raw content bytes.
    pub fn of(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        Fingerprint(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// FNV-1a, used as the per-shingle hash.
///
/// The constants are fixed by the algorithm, which keeps shingle hashes
/// stable across builds and across instances sharing one store.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut hash = OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Computes the 64-bit simhash of content.
///
/// Each overlapping 4-byte shingle votes on every bit position: +1 where its
/// hash has the bit set, -1 where it does not. The final hash sets the bits
/// with a positive tally. Content shorter than one shingle is hashed whole.
pub fn simhash(content: &[u8]) -> u64 {
    let mut tallies = [0i64; 64];

    let mut vote = |shingle: &[u8]| {
        let hash = fnv1a64(shingle);
        for (bit, tally) in tallies.iter_mut().enumerate() {
            if hash >> bit & 1 == 1 {
                *tally += 1;
            } else {
                *tally -= 1;
            }
        }
    };

    if content.len() < SHINGLE_LEN {
        vote(content);
    } else {
        for shingle in content.windows(SHINGLE_LEN) {
            vote(shingle);
        }
    }

    let mut hash = 0u64;
    for (bit, tally) in tallies.iter().enumerate() {
        if *tally > 0 {
            hash |= 1 << bit;
        }
    }
    hash
}

/// Similarity of two simhashes in `[0, 1]`: the fraction of agreeing bits.
pub fn similarity(a: u64, b: u64) -> f64 {
    let hamming = (a ^ b).count_ones();
    1.0 - f64::from(hamming) / 64.0
}
