//! Branch history: an arena of birth certificates and the ancestry walks over it
//!
//! A branch starts at `initial_timestamp` from the versions in `origin`, which may
//! differ per sub-region. Walking `origin` back from any branch ends at the nil
//! branch, the universal root.

use super::ids::{BranchId, StateTimestamp, Version};
use crate::common::{Error, Result};
use crate::region::{Region, RegionMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchBirthCertificate {
    pub region: Region,
    pub initial_timestamp: StateTimestamp,
    pub origin: RegionMap<Version>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchHistory {
    pub branches: BTreeMap<BranchId, BranchBirthCertificate>,
}

impl BranchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, branch: BranchId, certificate: BranchBirthCertificate) {
        self.branches.insert(branch, certificate);
    }

    pub fn contains(&self, branch: &BranchId) -> bool {
        self.branches.contains_key(branch)
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Copy in every branch of `other` we don't have yet.
    pub fn import(&mut self, other: &BranchHistory) {
        for (branch, certificate) in &other.branches {
            self.branches
                .entry(*branch)
                .or_insert_with(|| certificate.clone());
        }
    }
}

/// Read access to some branch history
pub trait BranchHistoryReader {
    fn get_branch(&self, branch: &BranchId) -> Result<&BranchBirthCertificate>;
}

impl BranchHistoryReader for BranchHistory {
    fn get_branch(&self, branch: &BranchId) -> Result<&BranchBirthCertificate> {
        self.branches
            .get(branch)
            .ok_or(Error::IncompleteBranchHistory(*branch))
    }
}

/// Looks branches up in `first`, then `second`.
pub struct BranchHistoryCombiner<'a> {
    first: &'a dyn BranchHistoryReader,
    second: &'a dyn BranchHistoryReader,
}

impl<'a> BranchHistoryCombiner<'a> {
    pub fn new(first: &'a dyn BranchHistoryReader, second: &'a dyn BranchHistoryReader) -> Self {
        Self { first, second }
    }
}

impl BranchHistoryReader for BranchHistoryCombiner<'_> {
    fn get_branch(&self, branch: &BranchId) -> Result<&BranchBirthCertificate> {
        match self.first.get_branch(branch) {
            Ok(certificate) => Ok(certificate),
            Err(_) => self.second.get_branch(branch),
        }
    }
}

fn certificate_for<'r>(
    reader: &'r dyn BranchHistoryReader,
    branch: &BranchId,
    region: &Region,
) -> Result<&'r BranchBirthCertificate> {
    let certificate = reader.get_branch(branch)?;
    if !certificate.region.is_superset(region) || !certificate.origin.covers(region) {
        return Err(Error::BranchRegionMismatch {
            branch: *branch,
            region: region.to_string(),
        });
    }
    Ok(certificate)
}

/// For each sub-region, the branches on `version`'s ancestry and the latest
/// timestamp of each that the ancestry passes through.
fn collect_ancestry(
    reader: &dyn BranchHistoryReader,
    version: Version,
    region: &Region,
    mut path: BTreeMap<BranchId, StateTimestamp>,
    out: &mut Vec<(Region, BTreeMap<BranchId, StateTimestamp>)>,
) -> Result<()> {
    if path.contains_key(&version.branch) {
        return Err(Error::BranchCycle(version.branch));
    }
    path.insert(version.branch, version.timestamp);
    if version.branch.is_nil() {
        out.push((region.clone(), path));
        return Ok(());
    }
    let certificate = certificate_for(reader, &version.branch, region)?;
    for (sub_region, origin) in certificate.origin.mask(region).iter() {
        collect_ancestry(reader, *origin, sub_region, path.clone(), out)?;
    }
    Ok(())
}

/// Walk `version` back until it meets `path`.
fn walk_to_path(
    reader: &dyn BranchHistoryReader,
    version: Version,
    region: &Region,
    path: &BTreeMap<BranchId, StateTimestamp>,
    visiting: &mut Vec<BranchId>,
    out: &mut Vec<(Region, Version)>,
) -> Result<()> {
    // `path` always ends at the nil branch, so every walk stops here eventually.
    if let Some(limit) = path.get(&version.branch) {
        let timestamp = version.timestamp.min(*limit);
        out.push((region.clone(), Version::new(version.branch, timestamp)));
        return Ok(());
    }
    if visiting.contains(&version.branch) {
        return Err(Error::BranchCycle(version.branch));
    }
    let certificate = certificate_for(reader, &version.branch, region)?;
    visiting.push(version.branch);
    for (sub_region, origin) in certificate.origin.mask(region).iter() {
        walk_to_path(reader, *origin, sub_region, path, visiting, out)?;
    }
    visiting.pop();
    Ok(())
}

/// The latest versions that are ancestors of both `version` and the tip of
/// `branch`, over `region`.
pub fn version_find_branch_common(
    reader: &dyn BranchHistoryReader,
    version: Version,
    branch: BranchId,
    region: &Region,
) -> Result<RegionMap<Version>> {
    if version.branch == branch {
        return Ok(RegionMap::new(region.clone(), version));
    }

    let mut paths = Vec::new();
    collect_ancestry(
        reader,
        Version::new(branch, StateTimestamp::max()),
        region,
        BTreeMap::new(),
        &mut paths,
    )?;

    let mut common = Vec::new();
    let mut visiting = Vec::new();
    for (sub_region, path) in &paths {
        walk_to_path(reader, version, sub_region, path, &mut visiting, &mut common)?;
    }
    let mut result = RegionMap::from_fragments(common);
    result.coalesce();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{KeyRange, RightBound};

    fn half(left: bool) -> Region {
        if left {
            Region::from_key_range(KeyRange::new("".into(), RightBound::Key("m".into())))
        } else {
            Region::from_key_range(KeyRange::new("m".into(), RightBound::Unbounded))
        }
    }

    fn certificate(origin: Version, at: u64) -> BranchBirthCertificate {
        BranchBirthCertificate {
            region: Region::universe(),
            initial_timestamp: StateTimestamp(at),
            origin: RegionMap::new(Region::universe(), origin),
        }
    }

    /// root -> b1 -> { b2 @ b1:5, b3 @ b1:3 }
    fn sample_history() -> (BranchHistory, BranchId, BranchId, BranchId) {
        let (b1, b2, b3) = (BranchId::generate(), BranchId::generate(), BranchId::generate());
        let mut history = BranchHistory::new();
        history.insert(b1, certificate(Version::zero(), 0));
        history.insert(b2, certificate(Version::new(b1, StateTimestamp(5)), 5));
        history.insert(b3, certificate(Version::new(b1, StateTimestamp(3)), 3));
        (history, b1, b2, b3)
    }

    fn single(map: &RegionMap<Version>) -> Version {
        assert_eq!(map.len(), 1, "expected one fragment: {:?}", map);
        *map.iter().next().unwrap().1
    }

    #[test]
    fn test_same_branch() {
        let (history, _, b2, _) = sample_history();
        let v = Version::new(b2, StateTimestamp(8));
        let common = version_find_branch_common(&history, v, b2, &Region::universe()).unwrap();
        assert_eq!(single(&common), v);
    }

    #[test]
    fn test_ancestor_branch_is_capped_at_fork() {
        let (history, b1, b2, _) = sample_history();
        let ahead = Version::new(b1, StateTimestamp(7));
        let common = version_find_branch_common(&history, ahead, b2, &Region::universe()).unwrap();
        assert_eq!(single(&common), Version::new(b1, StateTimestamp(5)));

        let behind = Version::new(b1, StateTimestamp(2));
        let common = version_find_branch_common(&history, behind, b2, &Region::universe()).unwrap();
        assert_eq!(single(&common), behind);
    }

    #[test]
    fn test_sibling_branches_meet_at_parent() {
        let (history, b1, b2, b3) = sample_history();
        let v = Version::new(b3, StateTimestamp(10));
        let common = version_find_branch_common(&history, v, b2, &Region::universe()).unwrap();
        assert_eq!(single(&common), Version::new(b1, StateTimestamp(3)));
    }

    #[test]
    fn test_unrelated_root_version() {
        let (history, _, b2, _) = sample_history();
        let common =
            version_find_branch_common(&history, Version::zero(), b2, &Region::universe()).unwrap();
        assert_eq!(single(&common), Version::zero());
    }

    #[test]
    fn test_origin_fragments_by_region() {
        let (mut history, b1, _, _) = sample_history();
        let split = BranchId::generate();
        let mut origin = RegionMap::new(half(true), Version::new(b1, StateTimestamp(4)));
        origin.update(&half(false), Version::new(b1, StateTimestamp(6)));
        history.insert(
            split,
            BranchBirthCertificate {
                region: Region::universe(),
                initial_timestamp: StateTimestamp(6),
                origin,
            },
        );
        let v = Version::new(b1, StateTimestamp(9));
        let common = version_find_branch_common(&history, v, split, &Region::universe()).unwrap();
        assert_eq!(common.len(), 2);
        assert_eq!(
            common.constant_over(&half(true)),
            Some(&Version::new(b1, StateTimestamp(4)))
        );
        assert_eq!(
            common.constant_over(&half(false)),
            Some(&Version::new(b1, StateTimestamp(6)))
        );
    }

    #[test]
    fn test_missing_branch_is_an_error() {
        let (history, _, b2, _) = sample_history();
        let stranger = Version::new(BranchId::generate(), StateTimestamp(4));
        let err =
            version_find_branch_common(&history, stranger, b2, &Region::universe()).unwrap_err();
        assert!(matches!(err, Error::IncompleteBranchHistory(_)));
    }

    #[test]
    fn test_combiner_reads_both() {
        let (history, b1, _, _) = sample_history();
        let extra_id = BranchId::generate();
        let mut extra = BranchHistory::new();
        extra.insert(extra_id, certificate(Version::new(b1, StateTimestamp(1)), 1));
        let combined = BranchHistoryCombiner::new(&extra, &history);
        assert!(combined.get_branch(&extra_id).is_ok());
        assert!(combined.get_branch(&b1).is_ok());
        assert!(combined.get_branch(&BranchId::generate()).is_err());
    }

    #[test]
    fn test_cycle_detected() {
        let (a, b) = (BranchId::generate(), BranchId::generate());
        let mut history = BranchHistory::new();
        history.insert(a, certificate(Version::new(b, StateTimestamp(1)), 1));
        history.insert(b, certificate(Version::new(a, StateTimestamp(1)), 1));
        let target = BranchId::generate();
        history.insert(target, certificate(Version::zero(), 0));
        let err = version_find_branch_common(
            &history,
            Version::new(a, StateTimestamp(2)),
            target,
            &Region::universe(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BranchCycle(_)));
    }
}
