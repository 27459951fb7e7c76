//! Segment bookkeeping for uploads and downloads
//!
//! A [`SegmentMap`] tracks which segments of a file are present (download
//! side) or acknowledged (upload side). It is internally synchronized so the
//! poll loop, timers and background tasks can share it behind an `Arc`.

use bitvec::prelude::*;
use std::sync::Mutex;

use crate::{lock, Error, Result, CHANNEL_COUNT};

/// Result of [`SegmentMap::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Position newly marked, map not yet full
    Added,
    /// Position newly marked and it was the last one. Returned exactly once.
    Filled,
    /// Position was already marked
    Duplicate,
    /// Map was already full; nothing changed
    AlreadyFilled,
}

impl AddOutcome {
    /// Whether this call changed the map
    pub fn is_new(&self) -> bool {
        matches!(self, AddOutcome::Added | AddOutcome::Filled)
    }
}

#[derive(Debug)]
struct Inner {
    bits: BitVec,
    count: u32,
    filled: bool,
}

#[derive(Debug)]
pub struct SegmentMap {
    len: u32,
    inner: Mutex<Inner>,
}

impl SegmentMap {
    /// Create an empty map of `len` positions. A zero-length map starts filled.
    pub fn new(len: u32) -> Self {
        Self {
            len,
            inner: Mutex::new(Inner {
                bits: bitvec![0; len as usize],
                count: 0,
                filled: len == 0,
            }),
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark a position. Out-of-range positions are rejected.
    pub fn add(&self, position: u32) -> Result<AddOutcome> {
        self.check(position)?;

        let mut inner = lock(&self.inner);
        if inner.filled {
            return Ok(AddOutcome::AlreadyFilled);
        }
        if inner.bits[position as usize] {
            return Ok(AddOutcome::Duplicate);
        }

        inner.bits.set(position as usize, true);
        inner.count += 1;
        if inner.count == self.len {
            inner.filled = true;
            return Ok(AddOutcome::Filled);
        }
        Ok(AddOutcome::Added)
    }

    /// Whether a position is marked
    pub fn contains(&self, position: u32) -> Result<bool> {
        self.check(position)?;
        Ok(lock(&self.inner).bits[position as usize])
    }

    pub fn is_filled(&self) -> bool {
        lock(&self.inner).filled
    }

    pub fn filled_count(&self) -> u32 {
        lock(&self.inner).count
    }

    /// Fraction of marked positions in `[0, 1]`
    pub fn progress(&self) -> f64 {
        if self.len == 0 {
            return 1.0;
        }
        self.filled_count() as f64 / self.len as f64
    }

    /// Find an unmarked position, preferring those on the hinted channel.
    ///
    /// Positions `hint, hint + CHANNEL_COUNT, ...` are tried first so callers
    /// working different channels pick different segments; then a linear scan.
    pub fn free_position(&self, channel_hint: u8) -> Option<u32> {
        let inner = lock(&self.inner);
        if inner.filled {
            return None;
        }

        let step = CHANNEL_COUNT as usize;
        let preferred = (channel_hint as usize % step..self.len as usize).step_by(step);
        preferred
            .chain(0..self.len as usize)
            .find(|&p| !inner.bits[p])
            .map(|p| p as u32)
    }

    /// All unmarked positions in ascending order
    pub fn missing(&self) -> Vec<u32> {
        lock(&self.inner)
            .bits
            .iter_zeros()
            .map(|p| p as u32)
            .collect()
    }

    fn check(&self, position: u32) -> Result<()> {
        if position >= self.len {
            return Err(Error::InvalidSegmentIndex {
                index: position,
                total: self.len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fill_in_any_order_fires_once() {
        let map = SegmentMap::new(5);
        let mut filled_events = 0;

        for position in [3, 1, 1, 4, 0, 3, 2, 2, 0] {
            if map.add(position).unwrap() == AddOutcome::Filled {
                filled_events += 1;
            }
        }

        assert_eq!(filled_events, 1);
        assert!(map.is_filled());
        assert_eq!(map.progress(), 1.0);
        assert_eq!(map.filled_count(), 5);
        assert_eq!(map.add(1).unwrap(), AddOutcome::AlreadyFilled);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let map = SegmentMap::new(4);
        assert_eq!(map.add(2).unwrap(), AddOutcome::Added);
        assert_eq!(map.add(2).unwrap(), AddOutcome::Duplicate);
        assert_eq!(map.filled_count(), 1);
        assert!((map.progress() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let map = SegmentMap::new(3);
        assert!(matches!(
            map.add(3),
            Err(Error::InvalidSegmentIndex { index: 3, total: 3 })
        ));
        assert!(map.contains(7).is_err());
        assert_eq!(map.filled_count(), 0);
    }

    #[test]
    fn test_missing_positions() {
        let map = SegmentMap::new(6);
        map.add(0).unwrap();
        map.add(4).unwrap();
        assert_eq!(map.missing(), vec![1, 2, 3, 5]);
    }

    #[test]
    fn test_free_position_prefers_channel() {
        let map = SegmentMap::new(20);
        assert_eq!(map.free_position(0), Some(0));
        assert_eq!(map.free_position(3), Some(3));

        map.add(3).unwrap();
        assert_eq!(map.free_position(3), Some(11));

        map.add(11).unwrap();
        map.add(19).unwrap();
        // channel 3 exhausted, fall back to linear scan
        assert_eq!(map.free_position(3), Some(0));
    }

    #[test]
    fn test_free_position_none_when_filled() {
        let map = SegmentMap::new(2);
        map.add(0).unwrap();
        assert_eq!(map.free_position(5), Some(1));
        map.add(1).unwrap();
        assert_eq!(map.free_position(0), None);
    }

    #[test]
    fn test_zero_length_map_starts_filled() {
        let map = SegmentMap::new(0);
        assert!(map.is_filled());
        assert!(map.is_empty());
        assert_eq!(map.progress(), 1.0);
        assert!(map.add(0).is_err());
    }

    #[test]
    fn test_concurrent_adds_fill_once() {
        let map = Arc::new(SegmentMap::new(64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    (0..64)
                        .filter(|&p| map.add(p).unwrap() == AddOutcome::Filled)
                        .count()
                })
            })
            .collect();

        let fills: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(fills, 1);
        assert_eq!(map.filled_count(), 64);
    }
}
