//! Regions: a hash range crossed with a key range
//!
//! Every key hashes into `[0, HASH_SPACE)`. The hash space is split evenly into
//! `CPU_SHARDING_FACTOR` subspaces; a contract never spans two of them, nor two
//! user shards (key ranges).

use super::key::{KeyRange, RightBound};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const HASH_SPACE: u64 = 1 << 63;
pub const CPU_SHARDING_FACTOR: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Region {
    pub beg: u64,
    pub end: u64,
    pub inner: KeyRange,
}

impl Region {
    pub fn new(beg: u64, end: u64, inner: KeyRange) -> Self {
        Self { beg, end, inner }
    }

    pub fn universe() -> Self {
        Self::from_key_range(KeyRange::universe())
    }

    /// The full hash range over `inner`
    pub fn from_key_range(inner: KeyRange) -> Self {
        Self {
            beg: 0,
            end: HASH_SPACE,
            inner,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.beg >= self.end || self.inner.is_empty()
    }

    pub fn intersection(&self, other: &Region) -> Region {
        Region {
            beg: self.beg.max(other.beg),
            end: self.end.min(other.end),
            inner: self.inner.intersection(&other.inner),
        }
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        !self.intersection(other).is_empty()
    }

    pub fn is_superset(&self, other: &Region) -> bool {
        other.is_empty()
            || (self.beg <= other.beg
                && other.end <= self.end
                && self.inner.is_superset(&other.inner))
    }

    /// The parts of `self` not covered by `other`, as at most four disjoint boxes.
    pub fn subtract(&self, other: &Region) -> Vec<Region> {
        let cut = self.intersection(other);
        if cut.is_empty() {
            return if self.is_empty() { Vec::new() } else { vec![self.clone()] };
        }
        let mut pieces = Vec::with_capacity(4);
        if self.beg < cut.beg {
            pieces.push(Region::new(self.beg, cut.beg, self.inner.clone()));
        }
        if cut.end < self.end {
            pieces.push(Region::new(cut.end, self.end, self.inner.clone()));
        }
        if self.inner.left < cut.inner.left {
            pieces.push(Region::new(
                cut.beg,
                cut.end,
                KeyRange::new(self.inner.left.clone(), RightBound::Key(cut.inner.left.clone())),
            ));
        }
        if let RightBound::Key(cut_right) = &cut.inner.right {
            if cut.inner.right < self.inner.right {
                pieces.push(Region::new(
                    cut.beg,
                    cut.end,
                    KeyRange::new(cut_right.clone(), self.inner.right.clone()),
                ));
            }
        }
        pieces
    }

    /// Union of two boxes with the same hash range whose key ranges touch.
    pub fn merge_along_keys(&self, other: &Region) -> Option<Region> {
        if self.beg != other.beg || self.end != other.end {
            return None;
        }
        if self.inner.abuts(&other.inner) {
            return Some(Region::new(
                self.beg,
                self.end,
                KeyRange::new(self.inner.left.clone(), other.inner.right.clone()),
            ));
        }
        if other.inner.abuts(&self.inner) {
            return Some(Region::new(
                self.beg,
                self.end,
                KeyRange::new(other.inner.left.clone(), self.inner.right.clone()),
            ));
        }
        None
    }

    /// Union of two boxes with the same key range whose hash ranges touch.
    pub fn merge_along_hash(&self, other: &Region) -> Option<Region> {
        if self.inner != other.inner {
            return None;
        }
        if self.end == other.beg {
            return Some(Region::new(self.beg, other.end, self.inner.clone()));
        }
        if other.end == self.beg {
            return Some(Region::new(other.beg, self.end, self.inner.clone()));
        }
        None
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{hash [{:#x}, {:#x}), keys {}}}", self.beg, self.end, self.inner)
    }
}

/// The `index`-th CPU shard: a slice of the hash space over every key.
pub fn cpu_sharding_subspace(index: usize) -> Region {
    debug_assert!(index < CPU_SHARDING_FACTOR);
    let width = HASH_SPACE / CPU_SHARDING_FACTOR as u64;
    let beg = width * index as u64;
    let end = if index + 1 == CPU_SHARDING_FACTOR {
        HASH_SPACE
    } else {
        beg + width
    };
    Region::new(beg, end, KeyRange::universe())
}
