use crate::geometry::{mirror, side, Side, NUM_SIBLING};
use crate::hierarchy::Hierarchy;
use crate::patch::PatchId;




/**
 * Which canonical order a plan's transfer lists use. The classical
 * variant orders patches lexicographically by corner; the load-balance
 * variant orders by the space-filling-curve key. Either way the two
 * endpoint ranks of a pair derive the identical pairing without any
 * negotiation, because the keys of a real patch and of its remote
 * mirror agree.
 */
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PlanOrder {
    Corner,
    LoadBalance,
}




/**
 * Per-level transfer lists: for every one of the 26 sibling directions
 * the real patches whose ghost slab must be published (`send_pid`) and
 * the buffer patches that receive the matching remote slab
 * (`recv_pid`); for the six face directions additionally the
 * coarse-fine flux surface lists, which carry buffer patches whose
 * locally-accumulated registers ship to the owner (`send_fid`) and the
 * real patches whose registers accumulate the remote sums (`recv_fid`).
 */
#[derive(Debug)]
pub struct LevelPlan {
    pub send_pid: [Vec<PatchId>; NUM_SIBLING],
    pub recv_pid: [Vec<PatchId>; NUM_SIBLING],
    pub send_fid: [Vec<PatchId>; 6],
    pub recv_fid: [Vec<PatchId>; 6],
}


impl Default for LevelPlan {
    fn default() -> Self {
        Self {
            send_pid: std::array::from_fn(|_| Vec::new()),
            recv_pid: std::array::from_fn(|_| Vec::new()),
            send_fid: std::array::from_fn(|_| Vec::new()),
            recv_fid: std::array::from_fn(|_| Vec::new()),
        }
    }
}




/**
 * Whether patch `id` touches this rank's sub-box boundary on the given
 * side of the given axis.
 */
pub fn touches_side(hier: &Hierarchy, lv: usize, id: PatchId, axis: usize, which: Side) -> bool {
    let corner = hier.patch(lv, id).corner;
    let span = hier.decomp.patch_scale(lv);
    match which {
        Side::Minus => corner[axis] == hier.decomp.my_box_low()[axis],
        Side::Plus => corner[axis] + span == hier.decomp.my_box_high()[axis],
        Side::Mid => true,
    }
}


/**
 * The real patches adjacent to the rank boundary in direction `dir`:
 * those touching the sub-box edge on every non-planar axis of the
 * direction. These are exactly the patches the neighbor rank mirrors
 * as its halo in the opposite direction.
 */
pub fn border_reals(hier: &Hierarchy, lv: usize, dir: usize) -> Vec<PatchId> {
    hier.real_ids(lv)
        .iter()
        .copied()
        .filter(|&id| (0..3).all(|a| touches_side(hier, lv, id, a, side(dir, a))))
        .collect()
}


fn sort_ids(hier: &Hierarchy, lv: usize, ids: &mut [PatchId], order: PlanOrder) {
    match order {
        PlanOrder::Corner => ids.sort_by_key(|&id| hier.patch(lv, id).corner),
        PlanOrder::LoadBalance => ids.sort_by_key(|&id| hier.patch(lv, id).lb_idx),
    }
}




/**
 * Build the transfer lists of one level. Both halves of every opposite
 * pair are planned from the same classification, so the engine can ship
 * them with a single symmetric transfer. Directions that stay on this
 * rank (single-rank periodic wrap) get empty lists: their sibling links
 * resolve to local real patches directly and no transfer is needed.
 */
pub fn record_exchange_ids(hier: &Hierarchy, lv: usize, order: PlanOrder) -> LevelPlan {
    let mut plan = LevelPlan::default();
    let me = hier.decomp.my_rank();

    for dir in 0..NUM_SIBLING {
        match hier.decomp.sibling_rank(dir) {
            None => continue,
            Some(rank) if rank == me => continue,
            Some(_) => {}
        }

        let mut send = border_reals(hier, lv, dir);
        sort_ids(hier, lv, &mut send, order);
        plan.send_pid[dir] = send;

        let mut recv: Vec<PatchId> = hier
            .buffer_ids(lv)
            .iter()
            .copied()
            .filter(|&id| {
                hier.decomp
                    .direction_of_corner(hier.patch(lv, id).corner)
                    == Some(dir)
            })
            .collect();
        sort_ids(hier, lv, &mut recv, order);
        plan.recv_pid[dir] = recv;
    }

    // the coarse-fine flux surface spans face directions only
    for face in 0..6 {
        let mut send: Vec<PatchId> = plan.recv_pid[face]
            .iter()
            .copied()
            .filter(|&id| hier.patch(lv, id).flux[mirror(face)].is_some())
            .collect();
        sort_ids(hier, lv, &mut send, order);
        plan.send_fid[face] = send;

        let mut recv: Vec<PatchId> = plan.send_pid[face]
            .iter()
            .copied()
            .filter(|&id| hier.patch(lv, id).flux[face].is_some())
            .collect();
        sort_ids(hier, lv, &mut recv, order);
        plan.recv_fid[face] = recv;
    }

    plan
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn single_rank_plans_are_empty() {
        let config = RuntimeConfig {
            n_root: [2, 2, 2],
            max_level: 1,
            ..RuntimeConfig::default()
        };
        let mut hierarchy = Hierarchy::new(config, 0);
        hierarchy.build_root();

        let plan = record_exchange_ids(&hierarchy, 0, PlanOrder::Corner);
        for dir in 0..NUM_SIBLING {
            assert!(plan.send_pid[dir].is_empty());
            assert!(plan.recv_pid[dir].is_empty());
        }
    }

    #[test]
    fn border_classification_on_two_ranks() {
        let config = RuntimeConfig {
            n_root: [4, 2, 2],
            max_level: 1,
            rank_dims: [2, 1, 1],
            ..RuntimeConfig::default()
        };
        let mut hierarchy = Hierarchy::new(config, 0);
        hierarchy.build_root();

        // rank 0 owns a 2x2x2 block of root patches: one x-layer of
        // four touches each x boundary
        let low = border_reals(&hierarchy, 0, 0);
        let high = border_reals(&hierarchy, 0, 1);
        assert_eq!(low.len(), 4);
        assert_eq!(high.len(), 4);
        assert!(low.iter().all(|id| !high.contains(id)));
    }
}
