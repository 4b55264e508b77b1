//! Deciding which branches the Raft state still needs
//!
//! Every branch in the Raft history starts out as a removal candidate. The
//! contract pass marks branches live as it walks each region; whatever is left
//! unmarked at the end is removed. Branches copied in from executors' history
//! extracts are collected separately and added.

use super::branch::{BranchBirthCertificate, BranchHistory, BranchHistoryReader};
use super::ids::BranchId;
use crate::common::Result;
use crate::region::Region;
use std::collections::BTreeSet;

pub struct BranchGc<'a> {
    raft_history: &'a BranchHistory,
    candidates: BTreeSet<BranchId>,
    added: BranchHistory,
    walked: BTreeSet<(BranchId, Region)>,
}

impl<'a> BranchGc<'a> {
    pub fn new(raft_history: &'a BranchHistory) -> Self {
        Self {
            raft_history,
            candidates: raft_history.branches.keys().copied().collect(),
            added: BranchHistory::new(),
            walked: BTreeSet::new(),
        }
    }

    pub fn mark_live(&mut self, branch: &BranchId) {
        self.candidates.remove(branch);
    }

    fn certificate(&self, branch: &BranchId) -> Option<&BranchBirthCertificate> {
        self.added
            .branches
            .get(branch)
            .or_else(|| self.raft_history.branches.get(branch))
    }

    /// Keep `branch` and its whole ancestry over `region`.
    ///
    /// Ancestry the history no longer holds was pruned on purpose by an earlier
    /// pass, so the walk simply stops there.
    pub fn mark_all_ancestors_live(&mut self, branch: BranchId, region: &Region) {
        let mut stack = vec![(branch, region.clone())];
        while let Some((branch, region)) = stack.pop() {
            if branch.is_nil() || !self.walked.insert((branch, region.clone())) {
                continue;
            }
            self.mark_live(&branch);
            let Some(certificate) = self.certificate(&branch) else {
                continue;
            };
            for (sub_region, origin) in certificate.origin.mask(&region).iter() {
                stack.push((origin.branch, sub_region.clone()));
            }
        }
    }

    /// Copy `branch` and its ancestry over `region` from `source` until a branch
    /// the Raft history already knows is reached; that base branch is kept.
    ///
    /// Fails with `IncompleteBranchHistory` if `source` lacks a branch the walk
    /// needs. Whatever was copied before the gap stays copied.
    pub fn mark_ancestors_since_base_live(
        &mut self,
        branch: BranchId,
        region: &Region,
        source: &BranchHistory,
    ) -> Result<()> {
        let mut copied = BTreeSet::new();
        let mut stack = vec![(branch, region.clone())];
        while let Some((branch, region)) = stack.pop() {
            if branch.is_nil() {
                continue;
            }
            if self.raft_history.contains(&branch) {
                self.mark_live(&branch);
                continue;
            }
            if !copied.insert((branch, region.clone())) {
                continue;
            }
            let certificate = source.get_branch(&branch)?;
            for (sub_region, origin) in certificate.origin.mask(&region).iter() {
                stack.push((origin.branch, sub_region.clone()));
            }
            if !self.added.contains(&branch) {
                self.added.insert(branch, certificate.clone());
            }
        }
        Ok(())
    }

    /// Branches to remove from and to add to the Raft history.
    pub fn finish(self) -> (BTreeSet<BranchId>, BranchHistory) {
        (self.candidates, self.added)
    }
}
