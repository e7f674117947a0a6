// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::InternalValue;
use std::{cmp::Reverse, collections::BinaryHeap};

pub type BoxedIterator<'a> = Box<dyn Iterator<Item = crate::Result<InternalValue>> + 'a>;

#[derive(Eq, PartialEq)]
struct HeapItem(usize, InternalValue);

// Ordered by internal key, ties broken towards the newer source
// (lower index) so versions of a key surface newest first
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.1.key, self.0).cmp(&(&other.1.key, other.0))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges multiple kvset iterators into one key-ordered stream
///
/// Inputs must individually be in internal-key order; input 0 is
/// expected to be the newest kvset.
pub struct Merger<'a> {
    iterators: Vec<BoxedIterator<'a>>,
    heap: BinaryHeap<Reverse<HeapItem>>,

    initialized: bool,
}

impl<'a> Merger<'a> {
    #[must_use]
    pub fn new(iterators: Vec<BoxedIterator<'a>>) -> Self {
        let heap = BinaryHeap::with_capacity(iterators.len());

        Self {
            iterators,
            heap,
            initialized: false,
        }
    }

    #[allow(clippy::indexing_slicing)]
    fn initialize(&mut self) -> crate::Result<()> {
        for idx in 0..self.iterators.len() {
            if let Some(item) = self.iterators[idx].next() {
                let item = item?;
                self.heap.push(Reverse(HeapItem(idx, item)));
            }
        }
        self.initialized = true;
        Ok(())
    }
}

impl<'a> Iterator for Merger<'a> {
    type Item = crate::Result<InternalValue>;

    #[allow(clippy::indexing_slicing)]
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            fail_iter!(self.initialize());
        }

        let min_item = self.heap.pop()?.0;

        if let Some(next_item) = self.iterators[min_item.0].next() {
            let next_item = fail_iter!(next_item);
            self.heap.push(Reverse(HeapItem(min_item.0, next_item)));
        }

        Some(Ok(min_item.1))
    }
}
