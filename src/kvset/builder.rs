// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::KvsetStats;
use crate::{
    config::RuntimeParams,
    hasher::KeyHasher,
    hlog::Hlog,
    mblock::{BlockAllocator, Mbset, MblockId, PAGE_SIZE},
    value::{InternalValue, SeqNo, UserKey, ValueType},
    Result,
};
use std::sync::Arc;

// Per-entry header bytes accounted against the key stream
const KEY_OVERHEAD: u64 = 24;

/// Builder output: a fully assembled kvset awaiting open
///
/// Carries everything but the identity metadata (id, dgen, compc),
/// which the opener derives.
pub struct BuiltKvset {
    pub(crate) hblk: MblockId,
    pub(crate) kblks: Vec<MblockId>,
    pub(crate) vbsets: Vec<Arc<Mbset>>,
    // Set when the vblock sets were taken over from compaction inputs
    // (k-compact) rather than allocated by this build
    pub(crate) carried_vbsets: bool,
    pub(crate) entries: Vec<InternalValue>,
    pub(crate) stats: KvsetStats,
    pub(crate) hlog: Hlog,
    pub(crate) key_filter: Vec<u64>,
    pub(crate) min_key: UserKey,
    pub(crate) max_key: UserKey,
    pub(crate) seqno_min: SeqNo,
    pub(crate) seqno_max: SeqNo,
}

impl BuiltKvset {
    /// Returns the number of entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the number of key blocks.
    #[must_use]
    pub fn kblk_count(&self) -> usize {
        self.kblks.len()
    }

    /// Returns the number of value blocks.
    #[must_use]
    pub fn vblk_count(&self) -> usize {
        self.vbsets.iter().map(|set| set.len()).sum()
    }

    /// Returns every block id the build allocated or carried.
    #[must_use]
    pub fn block_ids(&self) -> Vec<MblockId> {
        let mut blocks = Vec::with_capacity(1 + self.kblks.len() + self.vblk_count());
        blocks.push(self.hblk);
        blocks.extend_from_slice(&self.kblks);
        for set in &self.vbsets {
            blocks.extend_from_slice(set.blocks());
        }
        blocks
    }

    /// Block ids newly allocated by this build (excludes carried vblock sets).
    pub(crate) fn owned_block_ids(&self) -> Vec<MblockId> {
        let mut blocks = Vec::with_capacity(1 + self.kblks.len());
        blocks.push(self.hblk);
        blocks.extend_from_slice(&self.kblks);
        for set in &self.vbsets {
            if !self.carried_vbsets {
                blocks.extend_from_slice(set.blocks());
            }
        }
        blocks
    }
}

/// Assembles a kvset from an ascending entry stream
///
/// Entries must arrive in internal-key order (key ascending, seqno
/// descending). Key blocks close after a configured number of keys,
/// value blocks after a configured payload size; both granularities
/// come from [`RuntimeParams`].
pub struct KvsetBuilder {
    hasher: KeyHasher,
    allocator: Arc<dyn BlockAllocator>,

    keys_per_kblock: usize,
    bytes_per_vblock: usize,

    // K-compact mode: values are carried in the inputs' vblock sets,
    // so no vblocks are written here
    keys_only: bool,

    entries: Vec<InternalValue>,
    hlog: Hlog,
    key_filter: Vec<u64>,
    stats: KvsetStats,

    kblks: Vec<MblockId>,
    vblks: Vec<MblockId>,
    kblock_keys: usize,
    kblock_bytes: u64,
    vblock_bytes: u64,

    seqno_min: SeqNo,
    seqno_max: SeqNo,
}

impl KvsetBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(
        hasher: KeyHasher,
        allocator: Arc<dyn BlockAllocator>,
        rparams: &RuntimeParams,
    ) -> Self {
        Self {
            hasher,
            allocator,
            keys_per_kblock: rparams.keys_per_kblock.max(1),
            bytes_per_vblock: rparams.bytes_per_vblock.max(1),
            keys_only: false,
            entries: Vec::new(),
            hlog: Hlog::default(),
            key_filter: Vec::new(),
            stats: KvsetStats::default(),
            kblks: Vec::new(),
            vblks: Vec::new(),
            kblock_keys: 0,
            kblock_bytes: 0,
            vblock_bytes: 0,
            seqno_min: SeqNo::MAX,
            seqno_max: 0,
        }
    }

    /// Switches the builder into keys-only mode (k-compact).
    #[must_use]
    pub(crate) fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    /// Appends one entry.
    ///
    /// # Errors
    ///
    /// Returns `NoSpace` if block allocation fails, or `Invalid` if the
    /// key violates the hashing policy.
    pub fn add(&mut self, item: InternalValue) -> Result<()> {
        debug_assert!(
            self.entries.last().is_none_or(|prev| prev.key <= item.key),
            "entries must arrive in internal-key order",
        );

        if self.kblock_keys == 0 || self.kblock_keys == self.keys_per_kblock {
            self.close_kblock();
            self.kblks.push(self.allocator.alloc()?);
        }

        let klen = item.key.user_key.len() as u64 + KEY_OVERHEAD;
        self.kblock_keys += 1;
        self.kblock_bytes += klen;
        self.stats.kwlen += klen;
        self.stats.nkeys += 1;

        match item.key.value_type {
            ValueType::Tombstone => self.stats.ntombs += 1,
            ValueType::PrefixTombstone => self.stats.nptombs += 1,
            ValueType::Value => {
                let vlen = item.value.len() as u64;
                if vlen > 0 && !self.keys_only {
                    if self.vblks.is_empty()
                        || self.vblock_bytes + vlen > self.bytes_per_vblock as u64
                    {
                        self.close_vblock();
                        self.vblks.push(self.allocator.alloc()?);
                    }
                    self.vblock_bytes += vlen;
                }
                self.stats.vwlen += vlen;
            }
        }

        self.hlog.add(&item.key.user_key);
        self.key_filter.push(self.hasher.hash(&item.key.user_key)?);

        self.seqno_min = self.seqno_min.min(item.key.seqno);
        self.seqno_max = self.seqno_max.max(item.key.seqno);

        self.entries.push(item);
        Ok(())
    }

    /// Finishes the build.
    ///
    /// Returns `None` if no entry was added (nothing was allocated).
    ///
    /// # Errors
    ///
    /// Returns `NoSpace` if the header block cannot be allocated.
    pub fn finish(mut self) -> Result<Option<BuiltKvset>> {
        if self.entries.is_empty() {
            return Ok(None);
        }

        self.close_kblock();
        self.close_vblock();

        let hblk = self.allocator.alloc()?;

        self.key_filter.sort_unstable();
        self.key_filter.dedup();

        let min_key = self
            .entries
            .first()
            .expect("entries are not empty")
            .key
            .user_key
            .clone();
        let max_key = self
            .entries
            .last()
            .expect("entries are not empty")
            .key
            .user_key
            .clone();

        let vbsets = if self.vblks.is_empty() {
            Vec::new()
        } else {
            vec![Arc::new(Mbset::new(
                std::mem::take(&mut self.vblks),
                self.allocator.clone(),
            ))]
        };

        Ok(Some(BuiltKvset {
            hblk,
            kblks: self.kblks,
            vbsets,
            carried_vbsets: false,
            entries: self.entries,
            stats: self.stats,
            hlog: self.hlog,
            key_filter: self.key_filter,
            min_key,
            max_key,
            seqno_min: self.seqno_min,
            seqno_max: self.seqno_max,
        }))
    }

    fn close_kblock(&mut self) {
        if self.kblock_bytes > 0 {
            self.stats.kalen += self.kblock_bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        }
        self.kblock_keys = 0;
        self.kblock_bytes = 0;
    }

    fn close_vblock(&mut self) {
        if self.vblock_bytes > 0 {
            self.stats.valen += self.vblock_bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        }
        self.vblock_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mblock::MemAllocator;
    use test_log::test;

    fn value(key: &str, seqno: SeqNo) -> InternalValue {
        InternalValue::from_components(key, "v", seqno, ValueType::Value)
    }

    #[test]
    fn empty_builder_yields_none() {
        let allocator = Arc::new(MemAllocator::default());
        let builder = KvsetBuilder::new(
            KeyHasher::default(),
            allocator.clone(),
            &RuntimeParams::default(),
        );

        assert!(builder.finish().unwrap().is_none());
        assert_eq!(0, allocator.deleted_count());
    }

    #[test]
    fn kblock_granularity() {
        let allocator = Arc::new(MemAllocator::default());
        let rparams = RuntimeParams {
            keys_per_kblock: 2,
            ..Default::default()
        };

        let mut builder = KvsetBuilder::new(KeyHasher::default(), allocator, &rparams);
        for key in ["a", "b", "c", "d", "e"] {
            builder.add(value(key, 1)).unwrap();
        }

        let built = builder.finish().unwrap().unwrap();
        assert_eq!(3, built.kblk_count());
        assert_eq!(1, built.vblk_count());
        assert_eq!(5, built.entry_count());
        assert_eq!(b"a", built.min_key.as_ref());
        assert_eq!(b"e", built.max_key.as_ref());
    }

    #[test]
    fn keys_only_allocates_no_vblocks() {
        let allocator = Arc::new(MemAllocator::default());
        let mut builder = KvsetBuilder::new(
            KeyHasher::default(),
            allocator,
            &RuntimeParams::default(),
        )
        .keys_only();

        builder.add(value("a", 1)).unwrap();
        builder.add(value("b", 1)).unwrap();

        let built = builder.finish().unwrap().unwrap();
        assert_eq!(0, built.vblk_count());
        assert!(built.stats.vwlen > 0);
        assert_eq!(0, built.stats.valen);
    }

    #[test]
    fn stats_track_tombstones() {
        let allocator = Arc::new(MemAllocator::default());
        let mut builder = KvsetBuilder::new(
            KeyHasher::default(),
            allocator,
            &RuntimeParams::default(),
        );

        builder.add(value("a", 2)).unwrap();
        builder.add(InternalValue::new_tombstone("b", 2)).unwrap();
        builder
            .add(InternalValue::new_prefix_tombstone("c", 2))
            .unwrap();

        let built = builder.finish().unwrap().unwrap();
        assert_eq!(3, built.stats.nkeys);
        assert_eq!(1, built.stats.ntombs);
        assert_eq!(1, built.stats.nptombs);
        assert_eq!((2, 2), (built.seqno_min, built.seqno_max));
    }
}
