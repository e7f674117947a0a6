// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;
use std::cmp::Reverse;

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
#[allow(clippy::module_name_repetitions)]
pub type UserValue = Slice;

/// Sequence number - a monotonically increasing counter
///
/// A value with a higher sequence number shadows an item with the
/// same key and lower sequence number. This enables MVCC.
///
/// Stale items are lazily garbage-collected during compaction.
pub type SeqNo = u64;

/// Value type (regular value or tombstone)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum ValueType {
    /// Existing value
    Value,

    /// Deleted value
    Tombstone,

    /// Prefix deletion
    ///
    /// Shadows every key carrying the entry's key as a prefix.
    PrefixTombstone,
}

impl ValueType {
    /// Returns `true` if the type is a tombstone marker (point or prefix).
    #[must_use]
    pub fn is_tombstone(self) -> bool {
        self == Self::Tombstone || self == Self::PrefixTombstone
    }
}

/// Internal key, consisting of the user key plus MVCC metadata
#[derive(Clone, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct InternalKey {
    /// User key
    pub user_key: UserKey,

    /// Sequence number
    pub seqno: SeqNo,

    /// Entry type
    pub value_type: ValueType,
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{}",
            self.user_key,
            self.seqno,
            match self.value_type {
                ValueType::Value => "V",
                ValueType::Tombstone => "T",
                ValueType::PrefixTombstone => "P",
            },
        )
    }
}

impl InternalKey {
    /// Creates a new internal key.
    ///
    /// # Panics
    ///
    /// Panics if the key is empty or longer than 2^16 bytes.
    pub fn new<K: Into<UserKey>>(user_key: K, seqno: SeqNo, value_type: ValueType) -> Self {
        let user_key = user_key.into();

        assert!(!user_key.is_empty(), "key may not be empty");
        assert!(
            user_key.len() <= u16::MAX.into(),
            "keys can be 65535 bytes in length"
        );

        Self {
            user_key,
            seqno,
            value_type,
        }
    }

    /// Returns `true` if this key is any tombstone kind.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value_type.is_tombstone()
    }
}

// Keys are ordered by user key ascending, then by seqno descending,
// so the newest version of a key sorts first.
impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.user_key, Reverse(self.seqno)).cmp(&(&other.user_key, Reverse(other.seqno)))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Internal representation of KV pairs
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Eq, PartialEq)]
pub struct InternalValue {
    /// Internal key
    pub key: InternalKey,

    /// User-defined value - an arbitrary byte array
    pub value: UserValue,
}

impl InternalValue {
    /// Creates a new value from an internal key.
    pub fn new<V: Into<UserValue>>(key: InternalKey, value: V) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    /// Creates a new value.
    ///
    /// # Panics
    ///
    /// Panics if the key is empty or longer than 2^16 bytes.
    pub fn from_components<K: Into<UserKey>, V: Into<UserValue>>(
        user_key: K,
        value: V,
        seqno: SeqNo,
        value_type: ValueType,
    ) -> Self {
        let key = InternalKey::new(user_key, seqno, value_type);
        Self::new(key, value)
    }

    /// Creates a new tombstone.
    pub fn new_tombstone<K: Into<UserKey>>(key: K, seqno: SeqNo) -> Self {
        let key = InternalKey::new(key, seqno, ValueType::Tombstone);
        Self::new(key, Slice::empty())
    }

    /// Creates a new prefix tombstone.
    pub fn new_prefix_tombstone<K: Into<UserKey>>(prefix: K, seqno: SeqNo) -> Self {
        let key = InternalKey::new(prefix, seqno, ValueType::PrefixTombstone);
        Self::new(key, Slice::empty())
    }

    /// Returns `true` if the entry is any tombstone kind.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.key.is_tombstone()
    }
}

impl std::fmt::Debug for InternalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} => {:?}",
            self.key,
            if self.value.len() >= 64 {
                format!("[ ... {} bytes ]", self.value.len())
            } else {
                format!("{:?}", self.value)
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ordering() {
        let a = InternalKey::new("a", 2, ValueType::Value);
        let b = InternalKey::new("a", 1, ValueType::Value);
        let c = InternalKey::new("b", 9, ValueType::Value);

        // Same user key: newest version first
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    #[should_panic = "key may not be empty"]
    fn key_empty() {
        let _ = InternalKey::new("", 0, ValueType::Value);
    }
}
