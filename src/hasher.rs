// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};
use xxhash_rust::xxh3::xxh3_64;

/// Prefix/suffix aware key hashing policy
///
/// Produces the hash that a kvset's key filter is built with and that
/// point lookups probe it with, so that keys sharing the configured
/// prefix span land on the same hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyHasher {
    pfx_len: usize,
    sfx_len: usize,
}

impl KeyHasher {
    /// Creates a hashing policy for the given prefix and suffix lengths.
    #[must_use]
    pub fn new(pfx_len: usize, sfx_len: usize) -> Self {
        Self { pfx_len, sfx_len }
    }

    /// Hashes a key according to the policy.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if a suffix length is configured and the key is
    /// shorter than prefix plus suffix.
    pub fn hash(&self, key: &[u8]) -> Result<u64> {
        self.hash_with(key, None)
    }

    /// Hashes a key, reusing the caller's precomputed full-key hash when
    /// the hashed span turns out to cover the whole key.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if a suffix length is configured and the key is
    /// shorter than prefix plus suffix.
    pub fn hash_with(&self, key: &[u8], precomputed: Option<u64>) -> Result<u64> {
        let span = if self.sfx_len > 0 {
            if key.len() < self.pfx_len + self.sfx_len {
                return Err(Error::Invalid("key shorter than prefix plus suffix"));
            }
            key.len() - self.sfx_len
        } else if self.pfx_len > 0 {
            key.len().min(self.pfx_len)
        } else {
            key.len()
        };

        if span == key.len() {
            if let Some(hash) = precomputed {
                return Ok(hash);
            }
        }

        Ok(xxh3_64(key.get(..span).expect("span fits key")))
    }
}

#[cfg(test)]
mod tests {
    use super::KeyHasher;
    use test_log::test;
    use xxhash_rust::xxh3::xxh3_64;

    #[test]
    fn full_key_when_no_policy() {
        let hasher = KeyHasher::new(0, 0);
        assert_eq!(xxh3_64(b"hello"), hasher.hash(b"hello").unwrap());
    }

    #[test]
    fn short_key_hashes_fully() {
        let hasher = KeyHasher::new(4, 0);
        assert_eq!(xxh3_64(b"ab"), hasher.hash(b"ab").unwrap());
    }

    #[test]
    fn exact_length_reuses_precomputed() {
        let hasher = KeyHasher::new(4, 0);
        assert_eq!(42, hasher.hash_with(b"abcd", Some(42)).unwrap());
    }

    #[test]
    fn long_key_hashes_prefix() {
        let hasher = KeyHasher::new(4, 0);
        assert_eq!(xxh3_64(b"abcd"), hasher.hash(b"abcdef").unwrap());

        // A stale precomputed full-key hash must not be reused
        assert_eq!(xxh3_64(b"abcd"), hasher.hash_with(b"abcdef", Some(42)).unwrap());
    }

    #[test]
    fn suffix_strips_tail() {
        let hasher = KeyHasher::new(2, 2);
        assert_eq!(xxh3_64(b"abcd"), hasher.hash(b"abcdXY").unwrap());
    }

    #[test]
    fn suffix_rejects_short_key() {
        let hasher = KeyHasher::new(2, 2);
        assert!(hasher.hash(b"abc").is_err());
    }
}
