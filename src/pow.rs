//! Hashcash-style proof of work
//!
//! `SHA-256(buffer_0 || ... || buffer_n || counter_be32)` must start with
//! `difficulty_bytes` zero bytes, and the following byte masked with
//! `trailing_mask` must be zero as well.

use std::fmt;

use sha2::{Digest, Sha256};

/// Zero bytes required by enrollment
pub const DIFFICULTY_BYTES: usize = 2;

/// Bits of the byte after the zero prefix that must also be zero
pub const TRAILING_MASK: u8 = 0b1111_0000;

const DIGEST_LEN: usize = 32;

/// An ordered set of buffers to be proven over
///
/// Buffers are absorbed as they are added, so verifying many counters only
/// hashes the counter suffix.
#[derive(Clone)]
pub struct ProofOfWork {
    prefix: Sha256,
    difficulty_bytes: usize,
    trailing_mask: u8,
}

/// The zero prefix leaves no byte of the digest for the trailing mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("difficulty of {0} bytes exceeds the digest length")]
pub struct DifficultyTooHigh(pub usize);

impl Default for ProofOfWork {
    fn default() -> Self {
        Self {
            prefix: Sha256::new(),
            difficulty_bytes: DIFFICULTY_BYTES,
            trailing_mask: TRAILING_MASK,
        }
    }
}

impl fmt::Debug for ProofOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProofOfWork")
            .field("difficulty_bytes", &self.difficulty_bytes)
            .field("trailing_mask", &format_args!("{:#04x}", self.trailing_mask))
            .finish_non_exhaustive()
    }
}

impl ProofOfWork {
    /// `difficulty_bytes` must be below the digest length (32)
    pub fn new(difficulty_bytes: usize, trailing_mask: u8) -> Result<Self, DifficultyTooHigh> {
        if difficulty_bytes >= DIGEST_LEN {
            return Err(DifficultyTooHigh(difficulty_bytes));
        }
        Ok(Self {
            prefix: Sha256::new(),
            difficulty_bytes,
            trailing_mask,
        })
    }

    pub fn add(&mut self, buffer: &[u8]) -> &mut Self {
        self.prefix.update(buffer);
        self
    }

    pub fn with(mut self, buffer: &[u8]) -> Self {
        self.add(buffer);
        self
    }

    pub fn verify(&self, counter: u32) -> bool {
        let digest = self.prefix.clone().chain_update(counter.to_be_bytes()).finalize();

        digest[..self.difficulty_bytes].iter().all(|b| *b == 0)
            && digest[self.difficulty_bytes] & self.trailing_mask == 0
    }

    /// Smallest counter below `limit` that satisfies the puzzle
    pub fn solve(&self, limit: u32) -> Option<u32> {
        (0..limit).find(|counter| self.verify(*counter))
    }
}
