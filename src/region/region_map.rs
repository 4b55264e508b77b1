//! Region-keyed maps
//!
//! A `RegionMap<V>` is a set of disjoint `(Region, V)` boxes. Writes that
//! partially overlap an entry fragment it; `coalesce` merges adjacent boxes
//! holding equal values. Contracts, branch registrations and version maps all
//! use this one primitive.

use super::hash_region::Region;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMap<V> {
    entries: Vec<(Region, V)>,
}

impl<V> Default for RegionMap<V> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<V> RegionMap<V> {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// A map holding `value` over all of `region`
    pub fn new(region: Region, value: V) -> Self {
        let mut entries = Vec::with_capacity(1);
        if !region.is_empty() {
            entries.push((region, value));
        }
        Self { entries }
    }

    /// Build from fragments the caller knows to be disjoint. Empty boxes are dropped.
    pub fn from_fragments(fragments: impl IntoIterator<Item = (Region, V)>) -> Self {
        let entries: Vec<(Region, V)> = fragments
            .into_iter()
            .filter(|(region, _)| !region.is_empty())
            .collect();
        debug_assert!(
            entries
                .iter()
                .enumerate()
                .all(|(i, (a, _))| entries[i + 1..].iter().all(|(b, _)| !a.overlaps(b))),
            "region map fragments overlap"
        );
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Region, &V)> {
        self.entries.iter().map(|(region, value)| (region, value))
    }

    pub fn into_entries(self) -> Vec<(Region, V)> {
        self.entries
    }

    /// Call `f` for every non-empty intersection of an entry with `region`.
    pub fn visit(&self, region: &Region, mut f: impl FnMut(&Region, &V)) {
        for (entry_region, value) in &self.entries {
            let cut = entry_region.intersection(region);
            if !cut.is_empty() {
                f(&cut, value);
            }
        }
    }

    /// Does the map hold a value for every point of `region`?
    pub fn covers(&self, region: &Region) -> bool {
        let mut remaining = vec![region.clone()];
        for (entry_region, _) in &self.entries {
            remaining = remaining
                .iter()
                .flat_map(|piece| piece.subtract(entry_region))
                .collect();
            if remaining.is_empty() {
                return true;
            }
        }
        remaining.is_empty()
    }

    pub fn map<W>(&self, mut f: impl FnMut(&V) -> W) -> RegionMap<W> {
        RegionMap {
            entries: self
                .entries
                .iter()
                .map(|(region, value)| (region.clone(), f(value)))
                .collect(),
        }
    }
}

impl<V: Clone> RegionMap<V> {
    /// The restriction of this map to `region`
    pub fn mask(&self, region: &Region) -> RegionMap<V> {
        let mut entries = Vec::new();
        self.visit(region, |cut, value| entries.push((cut.clone(), value.clone())));
        RegionMap { entries }
    }

    /// Overwrite `region` with `value`, fragmenting whatever was there.
    pub fn update(&mut self, region: &Region, value: V) {
        if region.is_empty() {
            return;
        }
        let mut entries = Vec::with_capacity(self.entries.len() + 4);
        for (entry_region, old) in self.entries.drain(..) {
            if entry_region.overlaps(region) {
                for piece in entry_region.subtract(region) {
                    entries.push((piece, old.clone()));
                }
            } else {
                entries.push((entry_region, old));
            }
        }
        entries.push((region.clone(), value));
        self.entries = entries;
    }

    /// Overwrite with every entry of `other`.
    pub fn update_from(&mut self, other: &RegionMap<V>) {
        for (region, value) in other.iter() {
            self.update(region, value.clone());
        }
    }

    /// Call `f` on mutable values restricted to `region`, splitting entries that
    /// straddle its boundary so the rest of the map is unaffected.
    pub fn visit_mut(&mut self, region: &Region, mut f: impl FnMut(&Region, &mut V)) {
        let mut entries = Vec::with_capacity(self.entries.len() + 4);
        for (entry_region, value) in self.entries.drain(..) {
            let cut = entry_region.intersection(region);
            if cut.is_empty() {
                entries.push((entry_region, value));
                continue;
            }
            for piece in entry_region.subtract(region) {
                entries.push((piece, value.clone()));
            }
            let mut inner = value;
            f(&cut, &mut inner);
            entries.push((cut, inner));
        }
        self.entries = entries;
    }
}

impl<V: Clone + PartialEq> RegionMap<V> {
    /// Merge adjacent boxes with equal values until nothing more merges.
    ///
    /// Key-adjacent merges run before hash-adjacent ones, and entries are kept
    /// sorted, so equal inputs coalesce to the same layout.
    pub fn coalesce(&mut self) {
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
        loop {
            let along_keys = self.merge_pass(Region::merge_along_keys);
            let along_hash = self.merge_pass(Region::merge_along_hash);
            if !along_keys && !along_hash {
                break;
            }
        }
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
    }

    fn merge_pass(&mut self, merge: fn(&Region, &Region) -> Option<Region>) -> bool {
        let mut merged_any = false;
        let mut i = 0;
        while i < self.entries.len() {
            let mut j = i + 1;
            while j < self.entries.len() {
                if self.entries[i].1 == self.entries[j].1 {
                    if let Some(union) = merge(&self.entries[i].0, &self.entries[j].0) {
                        self.entries[i].0 = union;
                        self.entries.remove(j);
                        merged_any = true;
                        j = i + 1;
                        continue;
                    }
                }
                j += 1;
            }
            i += 1;
        }
        merged_any
    }

    /// The single value over `region`, if the map is constant there.
    pub fn constant_over(&self, region: &Region) -> Option<&V> {
        let mut found: Option<&V> = None;
        for (entry_region, value) in &self.entries {
            if !entry_region.overlaps(region) {
                continue;
            }
            match found {
                Some(existing) if existing != value => return None,
                _ => found = Some(value),
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{cpu_sharding_subspace, KeyRange, RightBound, CPU_SHARDING_FACTOR};

    fn keys(l: &str, r: Option<&str>) -> Region {
        Region::from_key_range(KeyRange::new(
            l.into(),
            r.map_or(RightBound::Unbounded, |r| RightBound::Key(r.into())),
        ))
    }

    #[test]
    fn test_update_fragments_and_covers() {
        let mut map = RegionMap::new(Region::universe(), 0);
        map.update(&keys("g", Some("m")), 1);
        assert_eq!(map.len(), 3);
        assert!(map.covers(&Region::universe()));
        assert_eq!(map.constant_over(&keys("h", Some("i"))), Some(&1));
        assert_eq!(map.constant_over(&keys("", Some("g"))), Some(&0));
        assert_eq!(map.constant_over(&keys("a", Some("h"))), None);
    }

    #[test]
    fn test_coalesce_restores_single_entry() {
        let mut map = RegionMap::new(Region::universe(), 7);
        map.update(&keys("g", Some("m")), 7);
        for i in 0..CPU_SHARDING_FACTOR {
            map.visit_mut(&cpu_sharding_subspace(i), |_, _| {});
        }
        assert!(map.len() > 1);
        map.coalesce();
        assert_eq!(map.len(), 1);
        assert_eq!(map.iter().next().unwrap().0, &Region::universe());
    }

    #[test]
    fn test_coalesce_keeps_distinct_values() {
        let mut map = RegionMap::new(keys("", Some("m")), 'a');
        map.update(&keys("m", None), 'b');
        map.coalesce();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_visit_mut_only_touches_region() {
        let mut map = RegionMap::new(Region::universe(), Vec::<u8>::new());
        map.visit_mut(&keys("m", None), |_, v| v.push(1));
        assert_eq!(map.constant_over(&keys("", Some("m"))), Some(&Vec::new()));
        assert_eq!(map.constant_over(&keys("m", None)), Some(&vec![1]));
        assert!(map.covers(&Region::universe()));
    }

    #[test]
    fn test_mask_and_visit() {
        let mut map = RegionMap::new(Region::universe(), 0);
        map.update(&keys("m", None), 1);
        let masked = map.mask(&keys("k", Some("p")));
        assert_eq!(masked.len(), 2);
        assert!(masked.covers(&keys("k", Some("p"))));
        assert!(!masked.covers(&keys("a", Some("p"))));

        let mut seen = Vec::new();
        map.visit(&keys("a", Some("b")), |_, v| seen.push(*v));
        assert_eq!(seen, vec![0]);
    }

    #[test]
    fn test_new_with_empty_region() {
        let map = RegionMap::new(keys("m", Some("m")), 1);
        assert!(map.is_empty());
    }
}
