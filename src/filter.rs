//! A single fixed-width bloom filter with SHA-256 based index derivation.

use sha2::{Digest, Sha256};

use crate::error::{NodeError, Result};

/// Fixed-width bloom filter with `k` independent hash functions.
///
/// `contains` never returns false for a key that was previously `add`ed
/// (one-sided error); it may return true for keys that were never added.
#[derive(Debug, Clone)]
pub struct BaseFilter {
    bits: Vec<bool>,
    m: usize,
    k: u32,
    msg_num: u64,
}

impl BaseFilter {
    /// `m` must be a positive power of two; `k` must be positive.
    pub fn new(m: usize, k: u32) -> Result<Self> {
        if m == 0 {
            return Err(NodeError::InvalidArgument(
                "bloom filter size cannot be zero".into(),
            ));
        }
        if m & (m - 1) != 0 {
            return Err(NodeError::InvalidArgument(
                "bloom filter size must be a power of 2".into(),
            ));
        }
        if k == 0 {
            return Err(NodeError::InvalidArgument(
                "the number of hash functions cannot be zero".into(),
            ));
        }
        Ok(Self {
            bits: vec![false; m],
            m,
            k,
            msg_num: 0,
        })
    }

    pub fn add(&mut self, key: &str) {
        for index in self.hash_indices(key) {
            self.bits[index] = true;
        }
        self.msg_num += 1;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.hash_indices(key).all(|index| self.bits[index])
    }

    pub fn msg_num(&self) -> u64 {
        self.msg_num
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    /// The `i`-th index is `SHA-256(key || "_" || i)` truncated to a
    /// host-width integer and reduced mod `m`. Using a fresh digest per
    /// index (rather than two-hash double hashing) keeps distinct `i`
    /// values from producing correlated index streams.
    fn hash_indices<'a>(&'a self, key: &'a str) -> impl Iterator<Item = usize> + 'a {
        (0..self.k).map(move |i| {
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            hasher.update(b"_");
            hasher.update(i.to_string().as_bytes());
            let digest = hasher.finalize();
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&digest[..8]);
            (u64::from_be_bytes(buf) as usize) % self.m
        })
    }
}
