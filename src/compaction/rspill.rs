// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Concurrent root spills: many jobs may build at once, but their
//! effects must land in submission order to preserve per-key ordering
//! for readers. Every spill owns a slot in the root's FIFO; whoever
//! finishes building drains the queue head-first, committing each ready
//! job in turn, and then waits for its own slot to be committed.

use super::{worker, CompactAction, CompactRequest, CompactionWork};
use crate::{
    tree::{node::NodeShared, Tree},
    Error, Result,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// One spill's slot in the root's in-flight FIFO
#[derive(Default)]
pub struct SpillSlot {
    /// The job itself; absent while the building worker holds it and
    /// after the committing worker consumed it
    pub(crate) work: std::sync::Mutex<Option<CompactionWork>>,

    /// The build phase finished (with or without error)
    pub(crate) done: AtomicBool,

    /// A worker is committing this job
    pub(crate) commit_in_progress: AtomicBool,

    /// Committed (or aborted) and removed from the FIFO
    pub(crate) finished: AtomicBool,

    /// Final error, if any
    pub(crate) err: std::sync::Mutex<Option<Error>>,
}

/// Handle of one in-flight spill, for staged execution
///
/// [`Tree::compact`] drives the stages itself; tests and embedders that
/// need to control interleaving use the staged API directly.
pub struct SpillHandle {
    pub(crate) slot: Arc<SpillSlot>,
    pub(crate) shared: Arc<NodeShared>,
}

impl Tree {
    /// Stage 1: stakes root kvsets and joins the in-flight FIFO.
    ///
    /// Returns `None` if the root has nothing eligible to spill.
    ///
    /// # Errors
    ///
    /// Returns `Shutdown` on cancellation, `Invalid` for a concurrent
    /// spill while the tree has no leaves yet.
    #[doc(hidden)]
    pub fn spill_begin(&self, req: &CompactRequest) -> Result<Option<SpillHandle>> {
        if req.action != CompactAction::Spill {
            return Err(Error::Invalid("not a spill request"));
        }

        let Some(mut work) = super::prepare::prepare(self, req)? else {
            return Ok(None);
        };

        let slot = work.rspill.take().expect("spill work carries its slot");
        let shared = work.shared.clone();

        *slot.work.lock().expect("lock is poisoned") = Some(work);

        Ok(Some(SpillHandle { slot, shared }))
    }

    /// Stage 2: runs the merge and builds the per-leaf outputs.
    ///
    /// Errors are recorded on the job and resolved during the ordered
    /// commit, so this never fails directly.
    #[doc(hidden)]
    pub fn spill_build(&self, handle: &SpillHandle) {
        let mut work = handle
            .slot
            .work
            .lock()
            .expect("lock is poisoned")
            .take()
            .expect("spill built twice");

        if let Err(e) = worker::build(self, &mut work) {
            if self.cancel.is_stopped() {
                work.canceled = true;
            }
            log::debug!("spill build failed: {e}");
            work.err = Some(e);
        }

        *handle.slot.work.lock().expect("lock is poisoned") = Some(work);
        handle.slot.done.store(true, Ordering::Release);
    }

    /// Stage 3: commits every ready job in submission order, then waits
    /// until this job's own commit happened (possibly on another worker).
    ///
    /// # Errors
    ///
    /// Returns this job's final error, `Shutdown` if the root was wedged
    /// by an earlier spill.
    #[doc(hidden)]
    pub fn spill_finish(&self, handle: SpillHandle) -> Result<()> {
        self.drain_spills(&handle.shared);

        let mut queue = handle.shared.rspills.lock().expect("lock is poisoned");
        while !handle.slot.finished.load(Ordering::Acquire) {
            queue = handle
                .shared
                .rspill_cv
                .wait(queue)
                .expect("lock is poisoned");
        }
        drop(queue);

        match handle.slot.err.lock().expect("lock is poisoned").take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Commits completed spills from the head of the FIFO until the head
    // is still building (or being committed elsewhere)
    fn drain_spills(&self, shared: &Arc<NodeShared>) {
        while let Some(slot) = get_completed_spill(shared) {
            let mut work = slot
                .work
                .lock()
                .expect("lock is poisoned")
                .take()
                .expect("completed spill carries its work");

            // An earlier failed spill wedged the root: short-circuit
            if shared.is_wedged() && work.err.is_none() {
                work.canceled = true;
                work.err = Some(Error::Shutdown);
            }

            let result = match work.err.take() {
                Some(e) => Err(e),
                None => worker::commit(self, &mut work),
            };

            let err = match result {
                Ok(()) => None,
                Err(e) => {
                    shared.wedged.store(true, Ordering::Release);
                    log::warn!(
                        "root spill failed, node {} wedged: {e}",
                        work.node_id,
                    );
                    worker::cleanup(self, &mut work, &e);
                    Some(e)
                }
            };

            *slot.err.lock().expect("lock is poisoned") = err;
            release_spill(shared, &slot);
        }
    }
}

// Atomically picks the queue head if it finished building and nobody
// is committing it yet
fn get_completed_spill(shared: &NodeShared) -> Option<Arc<SpillSlot>> {
    let queue = shared.rspills.lock().expect("lock is poisoned");

    let head = queue.front()?;
    if !head.done.load(Ordering::Acquire) || head.commit_in_progress.load(Ordering::Acquire) {
        return None;
    }

    head.commit_in_progress.store(true, Ordering::Release);
    Some(head.clone())
}

// Removes a committed job; it must still be the queue head
fn release_spill(shared: &NodeShared, slot: &Arc<SpillSlot>) {
    let mut queue = shared.rspills.lock().expect("lock is poisoned");

    let head = queue.front().expect("spill queue must not be empty");
    assert!(
        Arc::ptr_eq(head, slot),
        "spill queue head changed under a committing worker",
    );

    queue.pop_front();
    slot.finished.store(true, Ordering::Release);
    shared.rspill_cv.notify_all();
}
