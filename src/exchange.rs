use log::warn;

use crate::error::{AmrError, Result};
use crate::geometry::{loop_width, mirror, slab_origin, PAIR_ORDER};
use crate::hierarchy::Hierarchy;
use crate::message::comm::Communicator;
use crate::message::util::{bytes_to_reals, reals_to_bytes};
use crate::patch::{
    PatchId, Real, Sandglass, NCOMP_TOTAL, NFLUX, PATCH_SIZE, _FLUX_TOTAL, _POTE, _TOTAL,
};
use crate::plan::LevelPlan;




/**
 * What a buffer exchange is for. Each mode selects its own transfer
 * lists and payload rules: the DATA modes fill ghost slabs of buffer
 * patches from the owning rank, the POT modes do the same for the
 * potential only, and COARSE_FINE_FLUX ships face-sized flux registers
 * from buffer patches to the real coarse patch they mirror, summing
 * into the destination register.
 */
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BufferMode {
    DataGeneral,
    DataAfterRefine,
    DataAfterFixup,
    PotForPoisson,
    PotAfterRefine,
    CoarseFineFlux,
}


impl BufferMode {
    pub fn name(&self) -> &'static str {
        match self {
            BufferMode::DataGeneral => "DATA_GENERAL",
            BufferMode::DataAfterRefine => "DATA_AFTER_REFINE",
            BufferMode::DataAfterFixup => "DATA_AFTER_FIXUP",
            BufferMode::PotForPoisson => "POT_FOR_POISSON",
            BufferMode::PotAfterRefine => "POT_AFTER_REFINE",
            BufferMode::CoarseFineFlux => "COARSE_FINE_FLUX",
        }
    }

    fn is_data(&self) -> bool {
        matches!(
            self,
            BufferMode::DataGeneral | BufferMode::DataAfterRefine | BufferMode::DataAfterFixup
        )
    }

    fn is_pot(&self) -> bool {
        matches!(self, BufferMode::PotForPoisson | BufferMode::PotAfterRefine)
    }
}




/// Selects the planner variant: the classical static-partition plan or
/// its load-balance drop-in replacement.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UseLb {
    No,
    Yes,
}




// Message tag namespaces. Structure synchronization and every exchange
// mode get disjoint tags so that ranks which have already moved on to
// the next phase cannot confuse a late message from the previous one.
pub(crate) const KIND_STRUCT: u8 = 0;

pub(crate) fn wire_tag(kind: u8, lv: usize, dir: usize) -> u32 {
    ((kind as u32) << 16) | ((lv as u32) << 8) | dir as u32
}

fn mode_kind(mode: BufferMode) -> u8 {
    match mode {
        BufferMode::DataGeneral => 1,
        BufferMode::DataAfterRefine => 2,
        BufferMode::DataAfterFixup => 3,
        BufferMode::PotForPoisson => 4,
        BufferMode::PotAfterRefine => 5,
        BufferMode::CoarseFineFlux => 6,
    }
}




/**
 * Fill the ghost data of the buffer patches at level `lv`, or exchange
 * the buffer fluxes for the fix-up operation.
 *
 * `tvar` selects the variables: in the DATA modes any combination of
 * fluid components, passive scalars and the potential bit; in the POT
 * modes exactly the potential bit; in COARSE_FINE_FLUX the flux
 * component bits. `para_buf` is the ghost width in [0, PATCH_SIZE]
 * (unused for the flux surface, which is always a full face).
 *
 * The engine walks the 26 directions as 13 opposite pairs; each pair
 * costs one symmetric paired transfer per neighbor rank. Packed
 * payloads hold the selected fluid variables in index order, then the
 * potential, each as a (k,j,i)-major slab per patch; there is no
 * framing, because both endpoints size every message from their
 * planner lists alone.
 */
pub fn get_buffer_data<C: Communicator + ?Sized>(
    hier: &mut Hierarchy,
    comm: &C,
    lv: usize,
    flu_sg: Sandglass,
    pot_sg: Sandglass,
    mode: BufferMode,
    tvar: u32,
    para_buf: usize,
    use_lb: UseLb,
) -> Result<()> {
    if lv >= hier.num_levels() {
        return Err(AmrError::Precondition {
            name: "lv",
            value: lv as i64,
        });
    }

    let mut exchange_flu = tvar & _TOTAL != 0;
    let mut exchange_pot = tvar & _POTE != 0;

    if mode == BufferMode::DataAfterFixup {
        // the potential plays no part in the flux fix-up
        exchange_pot = false;
    }

    if exchange_flu && mode != BufferMode::CoarseFineFlux && flu_sg > 1 {
        return Err(AmrError::Precondition {
            name: "flu_sg",
            value: flu_sg as i64,
        });
    }
    if exchange_pot && mode != BufferMode::CoarseFineFlux && pot_sg > 1 {
        return Err(AmrError::Precondition {
            name: "pot_sg",
            value: pot_sg as i64,
        });
    }

    if mode.is_data() && tvar & (_TOTAL | _POTE) == 0 {
        return Err(AmrError::IncompatibleMask {
            mode: mode.name(),
            mask: tvar,
        });
    }
    if mode.is_pot() {
        if tvar & _POTE == 0 || tvar & !_POTE != 0 {
            return Err(AmrError::IncompatibleMask {
                mode: mode.name(),
                mask: tvar,
            });
        }
        exchange_flu = false;
        exchange_pot = true;
    }
    if (mode.is_data() || mode.is_pot()) && para_buf > PATCH_SIZE {
        return Err(AmrError::Precondition {
            name: "para_buf",
            value: para_buf as i64,
        });
    }
    if exchange_pot && !hier.config.gravity_type.has_self() {
        return Err(AmrError::Precondition {
            name: "gravity_type",
            value: 0,
        });
    }

    if mode == BufferMode::CoarseFineFlux {
        if tvar & _FLUX_TOTAL == 0 {
            return Err(AmrError::IncompatibleMask {
                mode: mode.name(),
                mask: tvar,
            });
        }
        if !hier.with_flux {
            warn!("mode COARSE_FINE_FLUX is useless since no flux is required");
            return Ok(());
        }
    }

    // target variable index list: flux components for the flux surface,
    // cell-centered components otherwise, potential always last
    let n_max = if mode == BufferMode::CoarseFineFlux {
        NFLUX
    } else {
        NCOMP_TOTAL
    };
    let flu_list: Vec<usize> = if exchange_flu || mode == BufferMode::CoarseFineFlux {
        (0..n_max).filter(|v| tvar & (1 << v) != 0).collect()
    } else {
        Vec::new()
    };
    let n_var_tot = flu_list.len() + exchange_pot as usize;

    if n_var_tot == 0 {
        warn!("no target variable is found in mode {}", mode.name());
        return Ok(());
    }

    let max_sib = if mode == BufferMode::CoarseFineFlux { 6 } else { 26 };
    let kind = mode_kind(mode);
    let me = hier.decomp.my_rank();

    let plan = std::mem::take(match use_lb {
        UseLb::Yes => &mut hier.plans_lb[lv],
        UseLb::No => &mut hier.plans[lv],
    });

    let result = exchange_pairs(
        hier, comm, lv, &plan, flu_sg, pot_sg, mode, &flu_list, exchange_pot, para_buf, max_sib,
        kind, me,
    );

    *match use_lb {
        UseLb::Yes => &mut hier.plans_lb[lv],
        UseLb::No => &mut hier.plans[lv],
    } = plan;

    result
}




#[allow(clippy::too_many_arguments)]
fn exchange_pairs<C: Communicator + ?Sized>(
    hier: &mut Hierarchy,
    comm: &C,
    lv: usize,
    plan: &LevelPlan,
    flu_sg: Sandglass,
    pot_sg: Sandglass,
    mode: BufferMode,
    flu_list: &[usize],
    exchange_pot: bool,
    para_buf: usize,
    max_sib: usize,
    kind: u8,
    me: usize,
) -> Result<()> {
    let n_var_tot = flu_list.len() + exchange_pot as usize;

    for s in (0..max_sib).step_by(2) {
        let dirs = [PAIR_ORDER[s], PAIR_ORDER[s + 1]];
        let peer = [
            hier.decomp.sibling_rank(dirs[0]),
            hier.decomp.sibling_rank(dirs[1]),
        ];
        if peer == [None, None] || (peer == [Some(me), Some(me)] && plan_is_empty(plan, dirs, mode))
        {
            continue;
        }

        // 1. pack the send buffers, one per endpoint
        let mut send = [Vec::new(), Vec::new()];
        for t in 0..2 {
            send[t] = if mode == BufferMode::CoarseFineFlux {
                pack_flux(hier, lv, &plan.send_fid[dirs[t]], dirs[t], flu_list)
            } else {
                pack_data(
                    hier,
                    lv,
                    &plan.send_pid[dirs[t]],
                    dirs[t],
                    dirs[t],
                    para_buf,
                    flu_sg,
                    pot_sg,
                    flu_list,
                    exchange_pot,
                )
            };
        }

        // 2. the paired transfer; a message is tagged with the direction
        // the *receiver* sees it arrive from, which is the mirror of the
        // direction it was sent toward
        let [send_0, send_1] = send;
        let recv = comm.exchange_paired(
            peer,
            [
                wire_tag(kind, lv, mirror(dirs[0])),
                wire_tag(kind, lv, mirror(dirs[1])),
            ],
            [wire_tag(kind, lv, dirs[0]), wire_tag(kind, lv, dirs[1])],
            [reals_to_bytes(&send_0), reals_to_bytes(&send_1)],
        );

        // 3. unpack into buffer-patch cells (or accumulate registers),
        // using the opposite endpoint's slab origin
        for t in 0..2 {
            if peer[t].is_none() {
                continue;
            }
            let values = bytes_to_reals(&recv[t]);
            let expected = if mode == BufferMode::CoarseFineFlux {
                plan.recv_fid[dirs[t]].len() * PATCH_SIZE * PATCH_SIZE * flu_list.len()
            } else {
                plan.recv_pid[dirs[t]].len() * slab_len(dirs[t], para_buf) * n_var_tot
            };
            if values.len() != expected {
                return Err(AmrError::Transport(format!(
                    "mode {} dir {}: received {} reals, expected {}",
                    mode.name(),
                    dirs[t],
                    values.len(),
                    expected
                )));
            }

            if mode == BufferMode::CoarseFineFlux {
                unpack_flux(hier, lv, &plan.recv_fid[dirs[t]], dirs[t], flu_list, &values);
            } else {
                unpack_data(
                    hier,
                    lv,
                    &plan.recv_pid[dirs[t]],
                    dirs[t],
                    dirs[1 - t],
                    para_buf,
                    flu_sg,
                    pot_sg,
                    flu_list,
                    exchange_pot,
                    &values,
                );
            }
        }
    }
    Ok(())
}


fn plan_is_empty(plan: &LevelPlan, dirs: [usize; 2], mode: BufferMode) -> bool {
    if mode == BufferMode::CoarseFineFlux {
        dirs.iter()
            .all(|&d| plan.send_fid[d].is_empty() && plan.recv_fid[d].is_empty())
    } else {
        dirs.iter()
            .all(|&d| plan.send_pid[d].is_empty() && plan.recv_pid[d].is_empty())
    }
}


fn slab_len(dir: usize, ghost: usize) -> usize {
    loop_width(dir, ghost, 0) * loop_width(dir, ghost, 1) * loop_width(dir, ghost, 2)
}




// ----------------------------------------------------------------------------
// pack / unpack kernels. The slab of a patch is traversed in canonical
// (k,j,i)-major order; `width_dir` fixes the extents and `origin_dir`
// the displacement, which differ between the two endpoints of a pair.


#[allow(clippy::too_many_arguments)]
fn pack_data(
    hier: &Hierarchy,
    lv: usize,
    ids: &[PatchId],
    width_dir: usize,
    origin_dir: usize,
    ghost: usize,
    flu_sg: Sandglass,
    pot_sg: Sandglass,
    flu_list: &[usize],
    exchange_pot: bool,
) -> Vec<Real> {
    let w: [usize; 3] = std::array::from_fn(|a| loop_width(width_dir, ghost, a));
    let o: [usize; 3] = std::array::from_fn(|a| slab_origin(origin_dir, ghost, a));
    let mut buffer = Vec::with_capacity(ids.len() * w[0] * w[1] * w[2]);

    for &id in ids {
        let patch = hier.patch(lv, id);

        if !flu_list.is_empty() {
            let cube = patch.fluid[flu_sg]
                .as_deref()
                .expect("send patch carries fluid data");
            for &v in flu_list {
                for k in o[2]..o[2] + w[2] {
                    for j in o[1]..o[1] + w[1] {
                        for i in o[0]..o[0] + w[0] {
                            buffer.push(cube[v][k][j][i]);
                        }
                    }
                }
            }
        }

        if exchange_pot {
            let cube = patch.pot[pot_sg]
                .as_deref()
                .expect("send patch carries potential data");
            for k in o[2]..o[2] + w[2] {
                for j in o[1]..o[1] + w[1] {
                    for i in o[0]..o[0] + w[0] {
                        buffer.push(cube[k][j][i]);
                    }
                }
            }
        }
    }
    buffer
}


#[allow(clippy::too_many_arguments)]
fn unpack_data(
    hier: &mut Hierarchy,
    lv: usize,
    ids: &[PatchId],
    width_dir: usize,
    origin_dir: usize,
    ghost: usize,
    flu_sg: Sandglass,
    pot_sg: Sandglass,
    flu_list: &[usize],
    exchange_pot: bool,
    values: &[Real],
) {
    let w: [usize; 3] = std::array::from_fn(|a| loop_width(width_dir, ghost, a));
    let o: [usize; 3] = std::array::from_fn(|a| slab_origin(origin_dir, ghost, a));
    let mut counter = 0;

    for &id in ids {
        let patch = hier.patch_mut(lv, id);

        if !flu_list.is_empty() {
            let cube = patch.fluid[flu_sg]
                .as_deref_mut()
                .expect("buffer patch carries fluid data");
            for &v in flu_list {
                for k in o[2]..o[2] + w[2] {
                    for j in o[1]..o[1] + w[1] {
                        for i in o[0]..o[0] + w[0] {
                            cube[v][k][j][i] = values[counter];
                            counter += 1;
                        }
                    }
                }
            }
        }

        if exchange_pot {
            let cube = patch.pot[pot_sg]
                .as_deref_mut()
                .expect("buffer patch carries potential data");
            for k in o[2]..o[2] + w[2] {
                for j in o[1]..o[1] + w[1] {
                    for i in o[0]..o[0] + w[0] {
                        cube[k][j][i] = values[counter];
                        counter += 1;
                    }
                }
            }
        }
    }
}


fn pack_flux(
    hier: &Hierarchy,
    lv: usize,
    ids: &[PatchId],
    dir: usize,
    flu_list: &[usize],
) -> Vec<Real> {
    let mut buffer = Vec::with_capacity(ids.len() * PATCH_SIZE * PATCH_SIZE * flu_list.len());

    for &id in ids {
        let plane = hier.patch(lv, id).flux[mirror(dir)]
            .as_deref()
            .expect("planned flux sender carries a register");
        for &v in flu_list {
            for m in 0..PATCH_SIZE {
                for n in 0..PATCH_SIZE {
                    buffer.push(plane[v][m][n]);
                }
            }
        }
    }
    buffer
}


/// The flux surface accumulates rather than assigns: several fine faces
/// (local sons and remote contributions alike) sum into one coarse
/// register.
fn unpack_flux(
    hier: &mut Hierarchy,
    lv: usize,
    ids: &[PatchId],
    dir: usize,
    flu_list: &[usize],
    values: &[Real],
) {
    let mut counter = 0;

    for &id in ids {
        let plane = hier.patch_mut(lv, id).flux[dir]
            .as_deref_mut()
            .expect("planned flux receiver carries a register");
        for &v in flu_list {
            for m in 0..PATCH_SIZE {
                for n in 0..PATCH_SIZE {
                    plane[v][m][n] += values[counter];
                    counter += 1;
                }
            }
        }
    }
}
