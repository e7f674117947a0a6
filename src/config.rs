// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    health::{Health, NoopHealth},
    journal::{Journal, MemJournal},
    mblock::{BlockAllocator, MemAllocator, PAGE_SIZE},
    Error, Result, Tree,
};
use std::sync::{Arc, Mutex};

/// Storage media class of a block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaClass {
    /// Bulk capacity media
    Capacity,

    /// Staging media
    Staging,

    /// Persistent memory
    Pmem,
}

/// Allocator-aware compacted-size estimator
///
/// Maps a logical write length to the length the allocator would
/// actually burn for it on a given media class. Pure configuration;
/// the sampling engine treats it as a black box.
#[derive(Clone, Debug)]
pub struct ClenEstimator {
    /// Allocation unit on capacity media
    pub capacity_unit: u64,

    /// Allocation unit on staging media
    pub staging_unit: u64,

    /// Allocation unit on pmem
    pub pmem_unit: u64,
}

impl Default for ClenEstimator {
    fn default() -> Self {
        Self {
            capacity_unit: 8 * PAGE_SIZE,
            staging_unit: 4 * PAGE_SIZE,
            pmem_unit: PAGE_SIZE,
        }
    }
}

impl ClenEstimator {
    /// Estimates the allocated length for a write length on a media class.
    #[must_use]
    pub fn estimate(&self, wlen: u64, mclass: MediaClass) -> u64 {
        let unit = match mclass {
            MediaClass::Capacity => self.capacity_unit,
            MediaClass::Staging => self.staging_unit,
            MediaClass::Pmem => self.pmem_unit,
        };

        wlen.div_ceil(unit) * unit
    }
}

/// Create-time tree parameters
#[derive(Clone, Debug)]
pub struct TreeParams {
    /// Number of children the root spills across
    pub fanout: usize,

    /// Key prefix length the hashing policy spans (0 = full key)
    pub pfx_len: usize,

    /// Key suffix length excluded from the hashed span
    pub sfx_len: usize,

    /// Append-mostly tree with time-bounded retention
    pub capped: bool,

    /// Per-node size threshold that drives split decisions and `pcap`
    pub node_size_max: u64,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            fanout: 16,
            pfx_len: 0,
            sfx_len: 0,
            capped: false,
            node_size_max: 8 * 1_024 * 1_024 * 1_024,
        }
    }
}

const FANOUT_MIN: usize = 2;
const FANOUT_MAX: usize = 1_024;
const PFX_LEN_MAX: usize = 32;
const SFX_LEN_MAX: usize = 32;

impl TreeParams {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(FANOUT_MIN..=FANOUT_MAX).contains(&self.fanout) {
            return Err(Error::Invalid("fanout out of range"));
        }
        if self.pfx_len > PFX_LEN_MAX {
            return Err(Error::Invalid("prefix length too large"));
        }
        if self.sfx_len > SFX_LEN_MAX {
            return Err(Error::Invalid("suffix length too large"));
        }
        if self.node_size_max == 0 {
            return Err(Error::Invalid("node size threshold may not be zero"));
        }
        Ok(())
    }
}

/// Runtime-adjustable parameters
#[derive(Clone, Debug)]
pub struct RuntimeParams {
    /// Spill seed boost: kblock count a spill output must exceed
    pub seed_boost_kblks: usize,

    /// Spill seed boost: vblock count a spill output must exceed
    pub seed_boost_vblks: usize,

    /// Compc boost applied to the first kvset of an empty spill destination
    pub seed_boost: u32,

    /// Media class key blocks land on
    pub kblock_mclass: MediaClass,

    /// Media class value blocks land on
    pub vblock_mclass: MediaClass,

    /// Compacted-size estimator
    pub estimator: ClenEstimator,

    /// Builder granularity: keys per key block
    pub keys_per_kblock: usize,

    /// Builder granularity: payload bytes per value block
    pub bytes_per_vblock: usize,

    /// Worker threads reserved for asynchronous teardown
    pub destroy_threads: usize,
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            seed_boost_kblks: 2,
            seed_boost_vblks: 32,
            seed_boost: 7,
            kblock_mclass: MediaClass::Capacity,
            vblock_mclass: MediaClass::Capacity,
            estimator: ClenEstimator::default(),
            keys_per_kblock: 256,
            bytes_per_vblock: 32 * 1_024,
            destroy_threads: 2,
        }
    }
}

/// Receives sampling deltas the compaction scheduler acts on
pub trait SchedulerHook: Send + Sync {
    /// Called after each root ingest with the raw-length deltas.
    fn notify_ingest(&self, dr_alen: i64, dr_wlen: i64);
}

/// Scheduler hook that ignores notifications
#[derive(Default)]
pub struct NoopScheduler;

impl SchedulerHook for NoopScheduler {
    fn notify_ingest(&self, _dr_alen: i64, _dr_wlen: i64) {}
}

/// Scheduler hook that records notifications, for tests
#[derive(Default)]
pub struct MemScheduler {
    ingests: Mutex<Vec<(i64, i64)>>,
}

impl MemScheduler {
    /// Returns the recorded `(Δr_alen, Δr_wlen)` pairs.
    #[must_use]
    pub fn ingests(&self) -> Vec<(i64, i64)> {
        self.ingests.lock().expect("lock is poisoned").clone()
    }
}

impl SchedulerHook for MemScheduler {
    fn notify_ingest(&self, dr_alen: i64, dr_wlen: i64) {
        self.ingests
            .lock()
            .expect("lock is poisoned")
            .push((dr_alen, dr_wlen));
    }
}

/// Tree configuration builder
pub struct Config {
    pub(crate) params: TreeParams,
    pub(crate) rparams: RuntimeParams,
    pub(crate) cnid: u64,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) allocator: Arc<dyn BlockAllocator>,
    pub(crate) health: Arc<dyn Health>,
    pub(crate) scheduler: Arc<dyn SchedulerHook>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(TreeParams::default())
    }
}

impl Config {
    /// Starts a configuration from create-time parameters.
    ///
    /// Journal, allocator, health and scheduler default to the in-memory
    /// implementations; production embedders attach their own.
    #[must_use]
    pub fn new(params: TreeParams) -> Self {
        Self {
            params,
            rparams: RuntimeParams::default(),
            cnid: 1,
            journal: Arc::new(MemJournal::new()),
            allocator: Arc::new(MemAllocator::default()),
            health: Arc::new(NoopHealth),
            scheduler: Arc::new(NoopScheduler),
        }
    }

    /// Sets the runtime parameters.
    #[must_use]
    pub fn runtime_params(mut self, rparams: RuntimeParams) -> Self {
        self.rparams = rparams;
        self
    }

    /// Sets the keyspace id recorded in journal transactions.
    #[must_use]
    pub fn cnid(mut self, cnid: u64) -> Self {
        self.cnid = cnid;
        self
    }

    /// Attaches the metadata journal.
    #[must_use]
    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = journal;
        self
    }

    /// Attaches the block allocator.
    #[must_use]
    pub fn allocator(mut self, allocator: Arc<dyn BlockAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Attaches the health channel.
    #[must_use]
    pub fn health(mut self, health: Arc<dyn Health>) -> Self {
        self.health = health;
        self
    }

    /// Attaches the scheduler hook.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn SchedulerHook>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Opens the tree.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if the create-time parameters are out of range.
    pub fn open(self) -> Result<Tree> {
        Tree::open(self)
    }
}
