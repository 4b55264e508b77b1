//! Splitting one replica's ack into fragments that are homogeneous per sub-region

use super::branch::{version_find_branch_common, BranchHistoryCombiner, BranchHistoryReader};
use super::ids::{BranchId, Version};
use super::types::{ContractAck, ContractAckFrag};
use crate::common::{Error, Result};
use crate::region::{Region, RegionMap};

/// Fragment `ack` over `region`.
///
/// The result covers every part of `region` the ack's version map describes (all
/// of it when the ack has no version). With `compute_common_ancestor`, each
/// fragment also carries the timestamp at which the replica's version and the
/// region's current branch last coincide. Missing ancestry is an error.
pub fn break_ack_into_fragments(
    region: &Region,
    ack: &ContractAck,
    current_branches: &RegionMap<BranchId>,
    raft_history: &dyn BranchHistoryReader,
    compute_common_ancestor: bool,
) -> Result<RegionMap<ContractAckFrag>> {
    fragment(
        region,
        ack,
        current_branches,
        raft_history,
        compute_common_ancestor,
        &mut |err, _| Err(err),
    )
}

/// Like [`break_ack_into_fragments`], but a piece whose ancestry cannot be
/// resolved is treated as descending only from the universal root. Every such
/// recovery is logged and pushed onto `diagnostics`.
pub fn break_ack_into_fragments_recovering(
    region: &Region,
    ack: &ContractAck,
    current_branches: &RegionMap<BranchId>,
    raft_history: &dyn BranchHistoryReader,
    compute_common_ancestor: bool,
    diagnostics: &mut Vec<Error>,
) -> RegionMap<ContractAckFrag> {
    let recovered = fragment(
        region,
        ack,
        current_branches,
        raft_history,
        compute_common_ancestor,
        &mut |err, piece| {
            tracing::error!(
                region = %piece,
                error = %err,
                "branch history incomplete, assuming the universal root as common ancestor"
            );
            diagnostics.push(err);
            Ok(RegionMap::new(piece.clone(), Version::zero()))
        },
    );
    // The fallback never fails, so neither does `fragment`.
    recovered.unwrap_or_default()
}

fn fragment(
    region: &Region,
    ack: &ContractAck,
    current_branches: &RegionMap<BranchId>,
    raft_history: &dyn BranchHistoryReader,
    compute_common_ancestor: bool,
    on_missing: &mut dyn FnMut(Error, &Region) -> Result<RegionMap<Version>>,
) -> Result<RegionMap<ContractAckFrag>> {
    let Some(version_map) = &ack.version else {
        return Ok(RegionMap::new(
            region.clone(),
            ContractAckFrag {
                state: ack.state,
                version: None,
                common_ancestor: None,
                branch: ack.branch,
            },
        ));
    };

    let reader = BranchHistoryCombiner::new(&ack.branch_history, raft_history);
    let mut fragments = Vec::new();
    for (version_region, version) in version_map.mask(region).iter() {
        let make = |common_ancestor| ContractAckFrag {
            state: ack.state,
            version: Some(*version),
            common_ancestor,
            branch: ack.branch,
        };
        if !compute_common_ancestor {
            fragments.push((version_region.clone(), make(None)));
            continue;
        }
        for (branch_region, current) in current_branches.mask(version_region).iter() {
            let common =
                match version_find_branch_common(&reader, *version, *current, branch_region) {
                    Ok(common) => common,
                    Err(err) => on_missing(err, branch_region)?,
                };
            for (common_region, common_version) in common.iter() {
                fragments.push((common_region.clone(), make(Some(common_version.timestamp))));
            }
        }
    }
    let mut result = RegionMap::from_fragments(fragments);
    result.coalesce();
    Ok(result)
}
