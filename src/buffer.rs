use serde::{Deserialize, Serialize};

use crate::exchange::{wire_tag, KIND_STRUCT};
use crate::geometry::{mirror, side, Side, PAIR_ORDER};
use crate::hierarchy::{Hierarchy, PatchClass};
use crate::message::comm::Communicator;
use crate::patch::Son;
use crate::plan::{border_reals, record_exchange_ids, PlanOrder};




#[derive(Serialize, Deserialize)]
struct BorderRecord {
    corner: [i64; 3],
    has_son: bool,
}




/**
 * Rebuild the sibling halo of one level: drop every buffer patch,
 * exchange the border-patch structure (corner and refinement flag) with
 * the 26 neighbor ranks, recreate the buffer patches that mirror the
 * remote reals, relink the sibling tables, re-derive the flux
 * registers, and record fresh exchange plans (both the classical and
 * the load-balance variant).
 *
 * This runs after root construction and after every (de)refinement
 * pass; between those events the halo structure is immutable and only
 * its cell data changes, through the buffer exchange engine.
 */
pub fn sync_buffers<C: Communicator + ?Sized>(hier: &mut Hierarchy, comm: &C, lv: usize) {
    let me = hier.decomp.my_rank();
    hier.clear_buffers(lv);

    for s in (0..PAIR_ORDER.len()).step_by(2) {
        let dirs = [PAIR_ORDER[s], PAIR_ORDER[s + 1]];
        let peer: [Option<usize>; 2] = std::array::from_fn(|t| {
            hier.decomp
                .sibling_rank(dirs[t])
                .filter(|&rank| rank != me)
        });
        if peer == [None, None] {
            continue;
        }

        let mut send = [Vec::new(), Vec::new()];
        for t in 0..2 {
            if peer[t].is_some() {
                let records: Vec<BorderRecord> = border_reals(hier, lv, dirs[t])
                    .into_iter()
                    .map(|id| {
                        let patch = hier.patch(lv, id);
                        BorderRecord {
                            corner: patch.corner,
                            has_son: patch.son.exists(),
                        }
                    })
                    .collect();
                send[t] = rmp_serde::to_vec(&records).expect("border records encode");
            }
        }

        let recv = comm.exchange_paired(
            peer,
            [
                wire_tag(KIND_STRUCT, lv, mirror(dirs[0])),
                wire_tag(KIND_STRUCT, lv, mirror(dirs[1])),
            ],
            [
                wire_tag(KIND_STRUCT, lv, dirs[0]),
                wire_tag(KIND_STRUCT, lv, dirs[1]),
            ],
            send,
        );

        for t in 0..2 {
            let rank = match peer[t] {
                Some(rank) => rank,
                None => continue,
            };
            let records: Vec<BorderRecord> =
                rmp_serde::from_slice(&recv[t]).expect("border records decode");

            for record in records {
                let corner = halo_corner(hier, lv, record.corner, dirs[t]);
                let id = hier.allocate_patch(lv, corner, PatchClass::SibBuffer);
                hier.patch_mut(lv, id).son = if record.has_son {
                    Son::Remote(rank)
                } else {
                    Son::None
                };
            }
        }
    }

    hier.link_all(lv);
    hier.refresh_flux_registers(lv);

    hier.plans[lv] = record_exchange_ids(hier, lv, PlanOrder::Corner);
    hier.plans_lb[lv] = record_exchange_ids(hier, lv, PlanOrder::LoadBalance);
}




/**
 * Place a remote border patch into this rank's halo frame for direction
 * `dir`. On a planar axis the coordinate carries over unchanged (the
 * two ranks share that extent); on a normal axis the patch must sit
 * flush against the sub-box, one patch outside it, which also resolves
 * any periodic wrap without consulting the wrapped coordinate at all.
 */
fn halo_corner(hier: &Hierarchy, lv: usize, corner: [i64; 3], dir: usize) -> [i64; 3] {
    let span = hier.decomp.patch_scale(lv);
    let low = hier.decomp.my_box_low();
    let high = hier.decomp.my_box_high();

    let mut unwrapped = [0i64; 3];
    for a in 0..3 {
        unwrapped[a] = match side(dir, a) {
            Side::Mid => corner[a],
            Side::Minus => low[a] - span,
            Side::Plus => high[a],
        };
    }
    unwrapped
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::geometry::NUM_SIBLING;
    use crate::message::local::local_group;
    use std::thread;

    fn two_rank_config() -> RuntimeConfig {
        RuntimeConfig {
            n_root: [4, 2, 2],
            max_level: 1,
            rank_dims: [2, 1, 1],
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn halo_mirrors_the_neighbor_border() {
        let group = local_group(2);
        let workers: Vec<_> = group
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                thread::spawn(move || {
                    let mut hierarchy = Hierarchy::new(two_rank_config(), rank);
                    hierarchy.build_root();
                    sync_buffers(&mut hierarchy, &comm, 0);
                    hierarchy.verify_invariants().unwrap();
                    (
                        hierarchy.n_real(0),
                        hierarchy.buffer_ids(0).len(),
                        hierarchy.all_ids(0).len(),
                    )
                })
            })
            .collect();

        for worker in workers {
            let (n_real, n_buffer, n_total) = worker.join().unwrap();
            assert_eq!(n_real, 8);
            // each rank is two patches deep in x; the neighbor's border
            // is one layer of 4 patches per x-side, and the periodic
            // wrap makes both sides remote: face + edge + corner images
            assert!(n_buffer > 0);
            assert_eq!(n_total, n_real + n_buffer);
        }
    }

    #[test]
    fn plans_pair_up_across_ranks() {
        let group = local_group(2);
        let workers: Vec<_> = group
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                thread::spawn(move || {
                    let mut hierarchy = Hierarchy::new(two_rank_config(), rank);
                    hierarchy.build_root();
                    sync_buffers(&mut hierarchy, &comm, 0);

                    let counts: Vec<(usize, usize)> = (0..NUM_SIBLING)
                        .map(|d| {
                            (
                                hierarchy.plans[0].send_pid[d].len(),
                                hierarchy.plans[0].recv_pid[d].len(),
                            )
                        })
                        .collect();
                    counts
                })
            })
            .collect();

        let counts: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        for d in 0..NUM_SIBLING {
            // rank 0's send list toward d must match rank 1's recv list
            // in the mirror direction, and vice versa
            assert_eq!(counts[0][d].0, counts[1][mirror(d)].1);
            assert_eq!(counts[1][d].0, counts[0][mirror(d)].1);
        }
    }
}
