// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, InternalValue, SeqNo, StopSignal};
use std::iter::Peekable;

/// MVCC-resolving wrapper around a merged compaction input stream
///
/// For every user key, the newest version always survives; older
/// versions survive only while their seqno exceeds the job horizon.
/// With tombstone drop enabled (the input window reaches the node's
/// oldest kvset, so nothing older can resurface), a key whose newest
/// surviving version is a tombstone vanishes entirely.
pub struct CompactionStream<I: Iterator<Item = crate::Result<InternalValue>>> {
    inner: Peekable<I>,
    horizon: SeqNo,
    drop_tombstones: bool,
    cancel: StopSignal,

    buffer: std::vec::IntoIter<InternalValue>,
}

impl<I: Iterator<Item = crate::Result<InternalValue>>> CompactionStream<I> {
    #[must_use]
    pub fn new(inner: I, horizon: SeqNo, drop_tombstones: bool, cancel: StopSignal) -> Self {
        Self {
            inner: inner.peekable(),
            horizon,
            drop_tombstones,
            cancel,
            buffer: Vec::new().into_iter(),
        }
    }

    // Pulls every version of the next user key and applies the
    // retention rules
    fn refill(&mut self) -> crate::Result<bool> {
        loop {
            if self.cancel.is_stopped() {
                return Err(Error::Shutdown);
            }

            let Some(first) = self.inner.next().transpose()? else {
                return Ok(false);
            };

            let mut kept = Vec::with_capacity(1);

            while let Some(peeked) = self.inner.peek() {
                let same_key = match peeked {
                    Ok(item) => item.key.user_key == first.key.user_key,
                    Err(_) => true, // surface the error below
                };
                if !same_key {
                    break;
                }

                let item = self.inner.next().expect("peeked item exists")?;
                if item.key.seqno > self.horizon {
                    kept.push(item);
                }
            }

            // A tombstone may only vanish once no reader below it remains
            let drop_all =
                self.drop_tombstones && first.is_tombstone() && first.key.seqno <= self.horizon;

            if drop_all {
                continue;
            }

            let mut versions = Vec::with_capacity(1 + kept.len());
            versions.push(first);
            versions.extend(kept);

            self.buffer = versions.into_iter();
            return Ok(true);
        }
    }
}

impl<I: Iterator<Item = crate::Result<InternalValue>>> Iterator for CompactionStream<I> {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.next() {
                return Some(Ok(item));
            }

            match self.refill() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueType;
    use test_log::test;

    fn value(key: &str, seqno: u64) -> InternalValue {
        InternalValue::from_components(key, "v", seqno, ValueType::Value)
    }

    fn run(
        items: Vec<InternalValue>,
        horizon: SeqNo,
        drop_tombstones: bool,
    ) -> Vec<InternalValue> {
        CompactionStream::new(
            items.into_iter().map(Ok),
            horizon,
            drop_tombstones,
            StopSignal::default(),
        )
        .collect::<crate::Result<Vec<_>>>()
        .unwrap()
    }

    #[test]
    fn newest_version_always_survives() {
        let out = run(vec![value("a", 5), value("a", 3), value("a", 1)], 9, false);
        assert_eq!(1, out.len());
        assert_eq!(5, out.first().unwrap().key.seqno);
    }

    #[test]
    fn versions_above_horizon_survive() {
        let out = run(vec![value("a", 5), value("a", 3), value("a", 1)], 2, false);
        let seqnos = out.iter().map(|v| v.key.seqno).collect::<Vec<_>>();
        assert_eq!(vec![5, 3], seqnos);
    }

    #[test]
    fn tombstone_drop_removes_key() {
        let out = run(
            vec![
                InternalValue::new_tombstone("a", 9),
                value("a", 5),
                value("b", 1),
            ],
            u64::MAX,
            true,
        );

        assert_eq!(1, out.len());
        assert_eq!(b"b", out.first().unwrap().key.user_key.as_ref());
    }

    #[test]
    fn tombstone_kept_without_drop() {
        let out = run(
            vec![InternalValue::new_tombstone("a", 9), value("a", 5)],
            u64::MAX,
            false,
        );

        assert_eq!(1, out.len());
        assert!(out.first().unwrap().is_tombstone());
    }

    #[test]
    fn cancellation_surfaces_as_shutdown() {
        let cancel = StopSignal::default();
        cancel.send();

        let mut stream = CompactionStream::new(
            vec![Ok(value("a", 1))].into_iter(),
            0,
            false,
            cancel,
        );

        assert!(matches!(stream.next(), Some(Err(Error::Shutdown))));
    }
}
