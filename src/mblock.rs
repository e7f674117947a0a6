// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};
use rustc_hash::FxHashSet;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

/// Handle of an on-media block
pub type MblockId = u64;

/// On-media block accounting granularity
pub const PAGE_SIZE: u64 = 4_096;

/// The on-media block allocator, consumed through a narrow interface
///
/// Blocks are minted with [`BlockAllocator::alloc`] by the kvset
/// builders, made durable with [`BlockAllocator::commit`] during the
/// compaction commit step and reclaimed with [`BlockAllocator::delete`]
/// once the last reference to a kvset marked for delete goes away.
pub trait BlockAllocator: Send + Sync {
    /// Mints a fresh, uncommitted block id.
    ///
    /// # Errors
    ///
    /// Returns `NoSpace` when the media is full.
    fn alloc(&self) -> Result<MblockId>;

    /// Makes a set of blocks durable.
    ///
    /// # Errors
    ///
    /// Returns `NoSpace` when the media is full.
    fn commit(&self, blocks: &[MblockId]) -> Result<()>;

    /// Deletes a set of blocks (committed or not).
    ///
    /// # Errors
    ///
    /// Returns an error if the media rejects the deletion.
    fn delete(&self, blocks: &[MblockId]) -> Result<()>;
}

/// A reference-counted group of value blocks
///
/// K-compact outputs share the value-block sets of their inputs instead
/// of rewriting them, so a vblock may outlive the kvset that created it.
/// The blocks are deleted when the last referencing kvset is gone and
/// the set was marked for delete.
pub struct Mbset {
    blocks: Vec<MblockId>,
    delete_on_drop: AtomicBool,
    allocator: Arc<dyn BlockAllocator>,
}

impl std::fmt::Debug for Mbset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mbset({:?})", self.blocks)
    }
}

impl Mbset {
    /// Creates a value-block set over the given blocks.
    #[must_use]
    pub fn new(blocks: Vec<MblockId>, allocator: Arc<dyn BlockAllocator>) -> Self {
        Self {
            blocks,
            delete_on_drop: AtomicBool::new(false),
            allocator,
        }
    }

    /// Returns the block ids.
    #[must_use]
    pub fn blocks(&self) -> &[MblockId] {
        &self.blocks
    }

    /// Returns the number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns `true` if the set holds no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Marks the blocks for deletion once the last reference is gone.
    pub fn mark_for_delete(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for Mbset {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) && !self.blocks.is_empty() {
            if let Err(e) = self.allocator.delete(&self.blocks) {
                log::error!("vblock set delete failed: {e}");
            }
        }
    }
}

/// In-memory block allocator used by tests and tooling
///
/// Tracks committed and deleted ids so callers can assert on block
/// lifecycle, and can be switched into a no-space mode to exercise
/// media-full handling.
pub struct MemAllocator {
    next: AtomicU64,
    committed: Mutex<FxHashSet<MblockId>>,
    deleted: Mutex<FxHashSet<MblockId>>,
    nospace: AtomicBool,
}

impl Default for MemAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
            committed: Mutex::new(FxHashSet::default()),
            deleted: Mutex::new(FxHashSet::default()),
            nospace: AtomicBool::new(false),
        }
    }
}

impl MemAllocator {
    /// Makes every following alloc/commit fail with `NoSpace`.
    pub fn set_nospace(&self, nospace: bool) {
        self.nospace.store(nospace, Ordering::Release);
    }

    /// Returns the number of committed, not yet deleted blocks.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let committed = self.committed.lock().expect("lock is poisoned");
        let deleted = self.deleted.lock().expect("lock is poisoned");
        committed.difference(&deleted).count()
    }

    /// Returns `true` if the block was committed.
    #[must_use]
    pub fn is_committed(&self, block: MblockId) -> bool {
        self.committed.lock().expect("lock is poisoned").contains(&block)
    }

    /// Returns `true` if the block was deleted.
    #[must_use]
    pub fn is_deleted(&self, block: MblockId) -> bool {
        self.deleted.lock().expect("lock is poisoned").contains(&block)
    }

    /// Returns the number of deleted blocks.
    #[must_use]
    pub fn deleted_count(&self) -> usize {
        self.deleted.lock().expect("lock is poisoned").len()
    }
}

impl BlockAllocator for MemAllocator {
    fn alloc(&self) -> Result<MblockId> {
        if self.nospace.load(Ordering::Acquire) {
            return Err(Error::NoSpace);
        }
        Ok(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn commit(&self, blocks: &[MblockId]) -> Result<()> {
        if self.nospace.load(Ordering::Acquire) {
            return Err(Error::NoSpace);
        }

        let mut committed = self.committed.lock().expect("lock is poisoned");
        committed.extend(blocks.iter().copied());

        Ok(())
    }

    fn delete(&self, blocks: &[MblockId]) -> Result<()> {
        let mut deleted = self.deleted.lock().expect("lock is poisoned");
        deleted.extend(blocks.iter().copied());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn mem_allocator_lifecycle() {
        let alloc = MemAllocator::default();

        let a = alloc.alloc().unwrap();
        let b = alloc.alloc().unwrap();
        assert_ne!(a, b);

        alloc.commit(&[a, b]).unwrap();
        assert_eq!(2, alloc.live_count());

        alloc.delete(&[a]).unwrap();
        assert_eq!(1, alloc.live_count());
        assert!(alloc.is_deleted(a));
        assert!(!alloc.is_deleted(b));
    }

    #[test]
    fn mem_allocator_nospace() {
        let alloc = MemAllocator::default();
        alloc.set_nospace(true);
        assert!(matches!(alloc.alloc(), Err(Error::NoSpace)));
        assert!(matches!(alloc.commit(&[1]), Err(Error::NoSpace)));
    }

    #[test]
    fn mbset_marked_deletes_on_drop() {
        let alloc = Arc::new(MemAllocator::default());
        let blocks = vec![alloc.alloc().unwrap(), alloc.alloc().unwrap()];

        let mbset = Arc::new(Mbset::new(blocks.clone(), alloc.clone()));
        let other = mbset.clone();
        mbset.mark_for_delete();

        drop(mbset);
        assert_eq!(0, alloc.deleted_count());

        drop(other);
        assert!(blocks.iter().all(|&b| alloc.is_deleted(b)));
    }

    #[test]
    fn mbset_unmarked_keeps_blocks() {
        let alloc = Arc::new(MemAllocator::default());
        let mbset = Mbset::new(vec![alloc.alloc().unwrap()], alloc.clone());
        drop(mbset);
        assert_eq!(0, alloc.deleted_count());
    }
}
