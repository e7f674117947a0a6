// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod builder;

use crate::{
    binary_search::partition_point,
    hlog::Hlog,
    mblock::{BlockAllocator, Mbset, MblockId, PAGE_SIZE},
    value::{InternalValue, SeqNo, UserKey, UserValue, ValueType},
    KvsetId, Result,
};
use self::builder::BuiltKvset;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

/// Accumulated statistics of one kvset
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KvsetStats {
    /// Number of entries
    pub nkeys: u64,

    /// Number of point tombstones
    pub ntombs: u64,

    /// Number of prefix tombstones
    pub nptombs: u64,

    /// Logical key bytes written
    pub kwlen: u64,

    /// Key bytes allocated on media
    pub kalen: u64,

    /// Logical value bytes written
    pub vwlen: u64,

    /// Value bytes allocated on media
    pub valen: u64,
}

impl KvsetStats {
    /// Total allocated length, including the header block.
    #[must_use]
    pub fn alen(&self) -> u64 {
        PAGE_SIZE + self.kalen + self.valen
    }

    /// Total logical written length.
    #[must_use]
    pub fn wlen(&self) -> u64 {
        self.kwlen + self.vwlen
    }
}

/// Outcome of a kvset point lookup
#[derive(Debug, PartialEq, Eq)]
pub enum GetResult {
    /// A live value was found
    Found(UserValue),

    /// The key is deleted at this sequence number
    Tombstone,

    /// The kvset holds nothing visible for the key
    NotFound,
}

/// One step of a prefix probe against a single kvset
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeStep {
    /// Live keys carrying the prefix in this kvset
    pub hits: usize,

    /// A visible prefix tombstone was observed; older kvsets need not
    /// be consulted
    pub ptomb: bool,
}

/// An immutable, reference-counted key-value set
///
/// The unit the tree is built from: ingest appends one to the root,
/// compaction merges runs of them, spill relocates them to the leaves.
/// All metadata is fixed at open time; only the reservation stamp and
/// the delete marks ever change.
pub struct Kvset {
    id: KvsetId,
    dgen: u64,
    compc: u32,
    workid: AtomicU64,

    min_key: UserKey,
    max_key: UserKey,
    seqno_min: SeqNo,
    seqno_max: SeqNo,

    stats: KvsetStats,
    hlog: Hlog,

    // Sorted policy hashes of every key; the stand-in for the
    // kblock filter probe
    key_filter: Vec<u64>,

    hblk: MblockId,
    kblks: Vec<MblockId>,
    vbsets: Vec<Arc<Mbset>>,

    // Sorted by key ascending, then seqno descending
    entries: Vec<InternalValue>,

    delete_marked: AtomicBool,
    keep_vblocks: AtomicBool,
    evict_hint: AtomicBool,

    allocator: Arc<dyn BlockAllocator>,
}

/// Shared kvset reference
pub type KvsetHandle = Arc<Kvset>;

impl std::fmt::Debug for Kvset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Kvset#{}(dgen={}, compc={}, {} entries)",
            self.id,
            self.dgen,
            self.compc,
            self.entries.len(),
        )
    }
}

impl Kvset {
    /// Opens a kvset over builder output.
    #[must_use]
    pub fn open(
        id: KvsetId,
        dgen: u64,
        compc: u32,
        built: BuiltKvset,
        allocator: Arc<dyn BlockAllocator>,
    ) -> KvsetHandle {
        Arc::new(Self {
            id,
            dgen,
            compc,
            workid: AtomicU64::new(0),
            min_key: built.min_key,
            max_key: built.max_key,
            seqno_min: built.seqno_min,
            seqno_max: built.seqno_max,
            stats: built.stats,
            hlog: built.hlog,
            key_filter: built.key_filter,
            hblk: built.hblk,
            kblks: built.kblks,
            vbsets: built.vbsets,
            entries: built.entries,
            delete_marked: AtomicBool::new(false),
            keep_vblocks: AtomicBool::new(false),
            evict_hint: AtomicBool::new(false),
            allocator,
        })
    }

    /// Returns the kvset id.
    #[must_use]
    pub fn id(&self) -> KvsetId {
        self.id
    }

    /// Returns the data generation.
    #[must_use]
    pub fn dgen(&self) -> u64 {
        self.dgen
    }

    /// Returns the compaction counter.
    #[must_use]
    pub fn compc(&self) -> u32 {
        self.compc
    }

    /// Returns the current reservation stamp (0 = unreserved).
    #[must_use]
    pub fn workid(&self) -> u64 {
        self.workid.load(Ordering::Acquire)
    }

    /// Stakes the kvset for a compaction job.
    ///
    /// Returns `false` if another job already holds it.
    pub fn reserve(&self, workid: u64) -> bool {
        debug_assert_ne!(0, workid);
        self.workid
            .compare_exchange(0, workid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clears a reservation. Only the staking job may do this.
    pub fn release_reservation(&self, workid: u64) {
        let prev = self.workid.swap(0, Ordering::AcqRel);
        debug_assert!(prev == workid || prev == 0, "foreign reservation stamp");
    }

    /// Returns the smallest key.
    #[must_use]
    pub fn min_key(&self) -> &UserKey {
        &self.min_key
    }

    /// Returns the largest key.
    #[must_use]
    pub fn max_key(&self) -> &UserKey {
        &self.max_key
    }

    /// Returns the lowest contained sequence number.
    #[must_use]
    pub fn seqno_min(&self) -> SeqNo {
        self.seqno_min
    }

    /// Returns the highest contained sequence number.
    #[must_use]
    pub fn seqno_max(&self) -> SeqNo {
        self.seqno_max
    }

    /// Returns the accumulated statistics.
    #[must_use]
    pub fn stats(&self) -> &KvsetStats {
        &self.stats
    }

    /// Returns the key-uniqueness sketch.
    #[must_use]
    pub fn hlog(&self) -> &Hlog {
        &self.hlog
    }

    /// Returns the header block id.
    #[must_use]
    pub fn hblk(&self) -> MblockId {
        self.hblk
    }

    /// Returns the key block ids.
    #[must_use]
    pub fn kblks(&self) -> &[MblockId] {
        &self.kblks
    }

    /// Returns the value-block sets.
    #[must_use]
    pub fn vbsets(&self) -> &[Arc<Mbset>] {
        &self.vbsets
    }

    /// Returns all value block ids.
    #[must_use]
    pub fn vblocks(&self) -> Vec<MblockId> {
        self.vbsets
            .iter()
            .flat_map(|set| set.blocks().iter().copied())
            .collect()
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

    /// Returns every block id the kvset pins (header, key and value blocks).
    #[must_use]
    pub fn purge_blocks(&self) -> Vec<MblockId> {
        let mut blocks = Vec::with_capacity(1 + self.kblks.len() + self.vblk_count());
        blocks.push(self.hblk);
        blocks.extend_from_slice(&self.kblks);
        blocks.extend(self.vblocks());
        blocks
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Point lookup.
    ///
    /// `hash` is the policy hash of the key (see [`crate::KeyHasher`]);
    /// `pfx_len` enables the prefix-tombstone check for trees with a
    /// prefix length.
    #[must_use]
    pub fn get(&self, key: &[u8], hash: u64, seqno: SeqNo, pfx_len: usize) -> GetResult {
        if self.key_filter.binary_search(&hash).is_err() {
            return GetResult::NotFound;
        }

        let point = self.newest_visible(key, seqno);

        let ptomb = if pfx_len > 0 && key.len() >= pfx_len {
            let prefix = key.get(..pfx_len).expect("prefix fits key");
            self.newest_visible(prefix, seqno)
                .filter(|e| e.key.value_type == ValueType::PrefixTombstone)
        } else {
            None
        };

        match (point, ptomb) {
            (Some(point), Some(ptomb)) if ptomb.key.seqno > point.key.seqno => GetResult::Tombstone,
            (Some(point), _) => {
                if point.key.value_type == ValueType::Value {
                    GetResult::Found(point.value.clone())
                } else {
                    GetResult::Tombstone
                }
            }
            (None, Some(_)) => GetResult::Tombstone,
            (None, None) => GetResult::NotFound,
        }
    }

    /// Accumulates prefix-probe state for this kvset.
    #[must_use]
    pub fn probe_prefix(&self, prefix: &[u8], seqno: SeqNo) -> ProbeStep {
        let mut step = ProbeStep::default();

        let start = partition_point(&self.entries, |e| &*e.key.user_key < prefix);

        let mut current: Option<&UserKey> = None;

        for entry in self.entries.iter().skip(start) {
            if !entry.key.user_key.starts_with(prefix) {
                break;
            }
            if entry.key.seqno > seqno {
                continue;
            }

            // Entries are seqno-descending per key, so the first visible
            // entry of a key decides its fate in this kvset
            if current == Some(&entry.key.user_key) {
                continue;
            }
            current = Some(&entry.key.user_key);

            match entry.key.value_type {
                ValueType::Value => step.hits += 1,
                ValueType::Tombstone => {}
                ValueType::PrefixTombstone => {
                    if &*entry.key.user_key == prefix {
                        step.ptomb = true;
                        return step;
                    }
                }
            }
        }

        step
    }

    /// Creates an owning iterator over the entries.
    #[must_use]
    pub fn iter(self: &Arc<Self>) -> KvsetIter {
        KvsetIter {
            kvset: self.clone(),
            idx: 0,
        }
    }

    /// Marks the media blocks for deletion once the last reference drops.
    ///
    /// With `keep_vblocks`, only the header and key blocks are deleted;
    /// the value-block sets stay alive for a k-compact output that
    /// shares them.
    pub fn mark_for_delete(&self, keep_vblocks: bool) {
        self.delete_marked.store(true, Ordering::Release);
        self.keep_vblocks.store(keep_vblocks, Ordering::Release);

        if !keep_vblocks {
            for set in &self.vbsets {
                set.mark_for_delete();
            }
        }
    }

    /// Low-cost reclaim fallback: advise eviction of cached value pages.
    pub fn cache_evict_hint(&self) {
        self.evict_hint.store(true, Ordering::Release);
        log::debug!("kvset {} value pages advised for eviction", self.id);
    }

    /// Returns `true` if a cache-eviction hint was issued.
    #[must_use]
    pub fn evict_hinted(&self) -> bool {
        self.evict_hint.load(Ordering::Acquire)
    }

    // Newest entry for the exact key that is visible at `seqno`
    fn newest_visible(&self, key: &[u8], seqno: SeqNo) -> Option<&InternalValue> {
        let start = partition_point(&self.entries, |e| &*e.key.user_key < key);

        self.entries
            .iter()
            .skip(start)
            .take_while(|e| &*e.key.user_key == key)
            .find(|e| e.key.seqno <= seqno)
    }
}

impl Drop for Kvset {
    fn drop(&mut self) {
        if self.delete_marked.load(Ordering::Acquire) {
            let mut blocks = Vec::with_capacity(1 + self.kblks.len());
            blocks.push(self.hblk);
            blocks.extend_from_slice(&self.kblks);

            if let Err(e) = self.allocator.delete(&blocks) {
                log::error!("kvset {} block delete failed: {e}", self.id);
            }
        }
    }
}

/// Owning iterator over a kvset's entries, newest version of each key first
pub struct KvsetIter {
    kvset: KvsetHandle,
    idx: usize,
}

impl Iterator for KvsetIter {
    type Item = Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.kvset.entries.get(self.idx)?.clone();
        self.idx += 1;
        Some(Ok(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RuntimeParams, hasher::KeyHasher, mblock::MemAllocator, InternalValue,
    };
    use super::builder::KvsetBuilder;
    use test_log::test;

    fn build(entries: &[InternalValue], pfx_len: usize) -> KvsetHandle {
        let allocator = Arc::new(MemAllocator::default());
        let hasher = KeyHasher::new(pfx_len, 0);
        let mut builder =
            KvsetBuilder::new(hasher, allocator.clone(), &RuntimeParams::default());

        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| a.key.cmp(&b.key));

        for entry in sorted {
            builder.add(entry).unwrap();
        }

        let built = builder.finish().unwrap().expect("entries are not empty");
        Kvset::open(1, 1, 0, built, allocator)
    }

    fn hash_of(key: &[u8], pfx_len: usize) -> u64 {
        KeyHasher::new(pfx_len, 0).hash(key).unwrap()
    }

    #[test]
    fn get_visible_version() {
        let ks = build(
            &[
                InternalValue::from_components("a", "old", 1, ValueType::Value),
                InternalValue::from_components("a", "new", 5, ValueType::Value),
            ],
            0,
        );

        assert_eq!(
            GetResult::Found("new".into()),
            ks.get(b"a", hash_of(b"a", 0), 9, 0)
        );
        assert_eq!(
            GetResult::Found("old".into()),
            ks.get(b"a", hash_of(b"a", 0), 1, 0)
        );
        assert_eq!(GetResult::NotFound, ks.get(b"a", hash_of(b"a", 0), 0, 0));
        assert_eq!(GetResult::NotFound, ks.get(b"b", hash_of(b"b", 0), 9, 0));
    }

    #[test]
    fn get_sees_tombstone() {
        let ks = build(
            &[
                InternalValue::from_components("a", "x", 1, ValueType::Value),
                InternalValue::new_tombstone("a", 3),
            ],
            0,
        );

        assert_eq!(GetResult::Tombstone, ks.get(b"a", hash_of(b"a", 0), 5, 0));
        assert_eq!(
            GetResult::Found("x".into()),
            ks.get(b"a", hash_of(b"a", 0), 2, 0)
        );
    }

    #[test]
    fn get_prefix_tombstone_shadows() {
        let ks = build(
            &[
                InternalValue::from_components("abcd", "x", 1, ValueType::Value),
                InternalValue::new_prefix_tombstone("ab", 4),
            ],
            2,
        );

        assert_eq!(
            GetResult::Tombstone,
            ks.get(b"abcd", hash_of(b"abcd", 2), 5, 2)
        );
        assert_eq!(
            GetResult::Found("x".into()),
            ks.get(b"abcd", hash_of(b"abcd", 2), 2, 2)
        );
    }

    #[test]
    fn probe_counts_live_keys() {
        let ks = build(
            &[
                InternalValue::from_components("pa", "1", 1, ValueType::Value),
                InternalValue::from_components("pb", "2", 1, ValueType::Value),
                InternalValue::new_tombstone("pc", 2),
                InternalValue::from_components("q", "3", 1, ValueType::Value),
            ],
            0,
        );

        let step = ks.probe_prefix(b"p", 5);
        assert_eq!(2, step.hits);
        assert!(!step.ptomb);
    }

    #[test]
    fn probe_stops_at_ptomb() {
        let ks = build(
            &[
                InternalValue::new_prefix_tombstone("p", 9),
                InternalValue::from_components("pa", "1", 1, ValueType::Value),
            ],
            1,
        );

        let step = ks.probe_prefix(b"p", 9);
        assert!(step.ptomb);
    }

    #[test]
    fn reservation_is_exclusive() {
        let ks = build(
            &[InternalValue::from_components("a", "x", 1, ValueType::Value)],
            0,
        );

        assert!(ks.reserve(7));
        assert!(!ks.reserve(8));
        assert_eq!(7, ks.workid());

        ks.release_reservation(7);
        assert_eq!(0, ks.workid());
        assert!(ks.reserve(8));
    }

    #[test]
    fn drop_marked_deletes_blocks() {
        let allocator = Arc::new(MemAllocator::default());
        let hasher = KeyHasher::new(0, 0);
        let mut builder =
            KvsetBuilder::new(hasher, allocator.clone(), &RuntimeParams::default());

        builder
            .add(InternalValue::from_components("a", "x", 1, ValueType::Value))
            .unwrap();

        let built = builder.finish().unwrap().expect("not empty");
        let ks = Kvset::open(1, 1, 0, built, allocator.clone());

        let hblk = ks.hblk();
        let vblocks = ks.vblocks();

        ks.mark_for_delete(false);
        drop(ks);

        assert!(allocator.is_deleted(hblk));
        assert!(vblocks.iter().all(|&b| allocator.is_deleted(b)));
    }
}
