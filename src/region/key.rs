//! Keys and key ranges

use serde::{Deserialize, Serialize};
use std::fmt;

/// A key in the table's key space. The empty key is the smallest key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct StoreKey(pub Vec<u8>);

impl StoreKey {
    pub fn min() -> Self {
        StoreKey(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        StoreKey(s.as_bytes().to_vec())
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "-inf");
        }
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Exclusive right bound of a key range. `Unbounded` sorts after every key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RightBound {
    Key(StoreKey),
    Unbounded,
}

impl RightBound {
    /// Is `key` strictly below this bound?
    pub fn is_above(&self, key: &StoreKey) -> bool {
        match self {
            RightBound::Key(bound) => key < bound,
            RightBound::Unbounded => true,
        }
    }
}

impl fmt::Display for RightBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RightBound::Key(key) => write!(f, "{}", key),
            RightBound::Unbounded => write!(f, "+inf"),
        }
    }
}

/// Half-open key range `[left, right)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub left: StoreKey,
    pub right: RightBound,
}

impl KeyRange {
    pub fn new(left: StoreKey, right: RightBound) -> Self {
        Self { left, right }
    }

    pub fn universe() -> Self {
        Self {
            left: StoreKey::min(),
            right: RightBound::Unbounded,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.right.is_above(&self.left)
    }

    pub fn intersection(&self, other: &KeyRange) -> KeyRange {
        KeyRange {
            left: self.left.clone().max(other.left.clone()),
            right: self.right.clone().min(other.right.clone()),
        }
    }

    pub fn is_superset(&self, other: &KeyRange) -> bool {
        other.is_empty() || (self.left <= other.left && other.right <= self.right)
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !self.intersection(other).is_empty()
    }

    /// `self` ends exactly where `other` begins
    pub fn abuts(&self, other: &KeyRange) -> bool {
        self.right == RightBound::Key(other.left.clone())
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.left, self.right)
    }
}
