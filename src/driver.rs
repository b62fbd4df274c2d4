use rayon::prelude::*;

use crate::error::Result;
use crate::exchange::{get_buffer_data, BufferMode, UseLb};
use crate::fixup::fix_up;
use crate::geometry::{child_index, mirror, side, Side, NUM_SIBLING};
use crate::hierarchy::Hierarchy;
use crate::message::comm::Communicator;
use crate::patch::{
    FluidCube, PatchId, PotCube, Real, SibLink, Son, NCOMP_TOTAL, NFLUX, PATCH_SIZE, _FLUX_TOTAL,
    _POTE, _TOTAL,
};




/**
 * A per-patch input block for the fluid integrator: the patch's own
 * cells plus `ghost` layers gathered from its same-level neighbors.
 * Cells beyond an unallocated or domain-boundary direction fall back to
 * the nearest interior value (the collaborating solver owns anything
 * smarter, e.g. coarse-fine interpolation).
 */
pub struct FluidInput {
    pub ghost: usize,
    data: Vec<Real>,
}


impl FluidInput {
    pub fn extent(&self) -> usize {
        PATCH_SIZE + 2 * self.ghost
    }

    /// Value of component `v` at block-local (k, j, i), ghost included.
    pub fn at(&self, v: usize, k: usize, j: usize, i: usize) -> Real {
        let n = self.extent();
        self.data[((v * n + k) * n + j) * n + i]
    }
}




/// Face fluxes produced by one patch update: `[face][component][m][n]`,
/// positive along the +axis direction of each face's normal.
pub type SolverFluxes = [[[[Real; PATCH_SIZE]; PATCH_SIZE]; NFLUX]; 6];




/**
 * The fluid integrator contract: consume an input block with
 * `ghost_width()` halo layers, write the advanced state, and report the
 * fluxes through the six patch faces so the core can maintain its
 * coarse-fine registers. The solver never touches the hierarchy.
 */
pub trait FluidSolver: Sync {
    fn ghost_width(&self) -> usize;

    fn advance(
        &self,
        input: &FluidInput,
        dh: f64,
        dt: f64,
        output: &mut FluidCube,
        fluxes: &mut SolverFluxes,
    );
}




/**
 * The elliptic solver contract: relax the potential of one patch from
 * the gas density and the ghost potential published by the
 * POT_FOR_POISSON exchange.
 */
pub trait PoissonSolver: Sync {
    fn ghost_width(&self) -> usize;

    fn relax(&self, density: &FluidInput, pot_in: &PotCube, dh: f64, pot_out: &mut PotCube);
}




// ============================================================================
// input preparation


/**
 * Assemble the input block of one real patch from the active sandglass:
 * interior cells from the patch itself, ghost cells from whichever
 * sibling (real or buffer) holds them.
 */
pub fn prepare_input(hier: &Hierarchy, lv: usize, id: PatchId, ghost: usize) -> FluidInput {
    assert!(ghost <= PATCH_SIZE, "ghost width beyond one patch");
    let sg = hier.flu_sg[lv];
    let patch = hier.patch(lv, id);
    let own = patch.fluid[sg].as_deref().expect("real patch carries fluid data");
    let n = PATCH_SIZE + 2 * ghost;
    let mut data = vec![0.0; NCOMP_TOTAL * n * n * n];

    let mut write = |v: usize, k: usize, j: usize, i: usize, value: Real| {
        data[((v * n + k) * n + j) * n + i] = value;
    };

    for v in 0..NCOMP_TOTAL {
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let rel = [
                        i as i64 - ghost as i64,
                        j as i64 - ghost as i64,
                        k as i64 - ghost as i64,
                    ];
                    let inside = rel.iter().all(|&r| (0..PATCH_SIZE as i64).contains(&r));

                    let value = if inside {
                        own[v][rel[2] as usize][rel[1] as usize][rel[0] as usize]
                    } else {
                        ghost_value(hier, lv, patch, sg, v, rel)
                    };
                    write(v, k, j, i, value);
                }
            }
        }
    }

    FluidInput { ghost, data }
}


fn ghost_value(
    hier: &Hierarchy,
    lv: usize,
    patch: &crate::patch::Patch,
    sg: usize,
    v: usize,
    rel: [i64; 3],
) -> Real {
    let sides: [Side; 3] = std::array::from_fn(|a| {
        if rel[a] < 0 {
            Side::Minus
        } else if rel[a] >= PATCH_SIZE as i64 {
            Side::Plus
        } else {
            Side::Mid
        }
    });
    let dir = (0..NUM_SIBLING)
        .find(|&d| (0..3).all(|a| side(d, a) == sides[a]))
        .expect("off-patch cell lies in some direction");

    if let SibLink::Patch(sib) = patch.sibling[dir] {
        if let Some(cube) = hier.patch(lv, sib).fluid[sg].as_deref() {
            let wrap = |r: i64| r.rem_euclid(PATCH_SIZE as i64) as usize;
            return cube[v][wrap(rel[2])][wrap(rel[1])][wrap(rel[0])];
        }
    }

    // nearest interior value
    let clamp = |r: i64| r.clamp(0, PATCH_SIZE as i64 - 1) as usize;
    patch.fluid[sg].as_deref().expect("checked above")[v][clamp(rel[2])][clamp(rel[1])]
        [clamp(rel[0])]
}




// ============================================================================
// flux register deposits


/**
 * Deposit a coarse patch's own face flux into its register with weight
 * -1: the register then holds the fine-minus-coarse mismatch once the
 * fine side has contributed.
 */
fn deposit_coarse_fluxes(hier: &mut Hierarchy, lv: usize, id: PatchId, fluxes: &SolverFluxes) {
    for face in 0..6 {
        if hier.patch(lv, id).flux[face].is_some() {
            let patch = hier.patch_mut(lv, id);
            for v in 0..NFLUX {
                patch.accumulate_flux(face, v, &fluxes[face][v], -1.0);
            }
        }
    }
}


/**
 * Deposit a fine patch's boundary-face fluxes onto the register of the
 * coarse neighbor across each coarse-fine face. Four fine sub-faces
 * average onto each coarse face cell (weight 1/4), and each sub-step
 * carries half the coarse interval (weight `dt_ratio`), so two uniform
 * sub-steps sum to exactly the coarse flux.
 */
fn deposit_fine_fluxes(
    hier: &mut Hierarchy,
    lv: usize,
    id: PatchId,
    fluxes: &SolverFluxes,
    dt_ratio: Real,
) {
    if lv == 0 {
        return;
    }
    let (father, corner) = {
        let patch = hier.patch(lv, id);
        match patch.father {
            Some(father) => (father, patch.corner),
            None => return,
        }
    };
    let child = child_index([
        corner[0] / hier.decomp.patch_scale(lv),
        corner[1] / hier.decomp.patch_scale(lv),
        corner[2] / hier.decomp.patch_scale(lv),
    ]);
    let offset = crate::geometry::child_offset(child);

    for face in 0..6 {
        // a coarse-fine face of a fine patch has no same-level neighbor
        if hier.patch(lv, id).sibling[face] != SibLink::Unallocated {
            continue;
        }
        let coarse = match hier.patch(lv - 1, father).sibling[face] {
            SibLink::Patch(coarse) => coarse,
            _ => continue,
        };
        if hier.patch(lv - 1, coarse).flux[mirror(face)].is_none() {
            continue;
        }

        // the quadrant of the coarse register this fine face covers
        let (oa, ob) = match face / 2 {
            0 => (offset[2], offset[1]),
            1 => (offset[2], offset[0]),
            _ => (offset[1], offset[0]),
        };
        let half = (PATCH_SIZE / 2) as i64;

        let coarse_patch = hier.patch_mut(lv - 1, coarse);
        for v in 0..NFLUX {
            let mut quadrant = [[0.0; PATCH_SIZE]; PATCH_SIZE];
            for m in 0..PATCH_SIZE {
                for n in 0..PATCH_SIZE {
                    let cm = (oa * half) as usize + m / 2;
                    let cn = (ob * half) as usize + n / 2;
                    quadrant[cm][cn] += 0.25 * fluxes[face][v][m][n];
                }
            }
            coarse_patch.accumulate_flux(mirror(face), v, &quadrant, dt_ratio);
        }
    }
}




// ============================================================================
// level advance


/**
 * Advance one level by `dt`, recursively sub-stepping the finer levels,
 * with the step ordering the conservation machinery depends on:
 * GENERAL exchange, integrate, two half-steps of the finer level,
 * COARSE_FINE_FLUX exchange, fix-up, AFTER_FIXUP exchange. Collective:
 * every rank must call this with the same level and time step.
 */
pub fn advance_level<C: Communicator + ?Sized, S: FluidSolver>(
    hier: &mut Hierarchy,
    comm: &C,
    solver: &S,
    lv: usize,
    dt: f64,
) -> Result<()> {
    let ghost = solver.ghost_width();
    let flu_sg = hier.flu_sg[lv];
    get_buffer_data(
        hier,
        comm,
        lv,
        flu_sg,
        hier.pot_sg[lv],
        BufferMode::DataGeneral,
        _TOTAL,
        ghost,
        UseLb::No,
    )?;

    integrate(hier, solver, lv, dt);
    hier.flip_flu_sg(lv);
    hier.time[lv] += dt;
    hier.step[lv] += 1;

    let finer_exists = lv < hier.max_level() && level_exists_globally(hier, comm, lv + 1);
    if finer_exists {
        advance_level(hier, comm, solver, lv + 1, 0.5 * dt)?;
        advance_level(hier, comm, solver, lv + 1, 0.5 * dt)?;

        if hier.with_flux {
            get_buffer_data(
                hier,
                comm,
                lv,
                0,
                0,
                BufferMode::CoarseFineFlux,
                _FLUX_TOTAL,
                0,
                UseLb::No,
            )?;
        }
        fix_up(hier, lv, dt)?;
        get_buffer_data(
            hier,
            comm,
            lv,
            hier.flu_sg[lv],
            0,
            BufferMode::DataAfterFixup,
            _TOTAL,
            ghost,
            UseLb::No,
        )?;
    }
    Ok(())
}


fn level_exists_globally<C: Communicator + ?Sized>(
    hier: &Hierarchy,
    comm: &C,
    lv: usize,
) -> bool {
    let mine = (hier.n_real(lv) as u64).to_le_bytes().to_vec();
    let total = comm.all_reduce(
        |a, b| {
            let a = u64::from_le_bytes(a.try_into().unwrap());
            let b = u64::from_le_bytes(b.try_into().unwrap());
            (a + b).to_le_bytes().to_vec()
        },
        mine,
    );
    u64::from_le_bytes(total.try_into().unwrap()) > 0
}


/**
 * Integrate every real patch of one level: gather inputs and run the
 * solver across patches in parallel, then commit the outputs and the
 * flux-register deposits. The inactive sandglass receives the result;
 * the caller flips it.
 */
fn integrate<S: FluidSolver>(hier: &mut Hierarchy, solver: &S, lv: usize, dt: f64) {
    let ghost = solver.ghost_width();
    let dh = hier.config.cell_size(lv);
    let ids: Vec<PatchId> = hier.real_ids(lv).to_vec();

    let results: Vec<(PatchId, Box<FluidCube>, Box<SolverFluxes>)> = {
        let hier = &*hier;
        ids.par_iter()
            .map(|&id| {
                let input = prepare_input(hier, lv, id, ghost);
                let mut output = crate::patch::new_fluid_cube();
                let mut fluxes: Box<SolverFluxes> =
                    Box::new([[[[0.0; PATCH_SIZE]; PATCH_SIZE]; NFLUX]; 6]);
                solver.advance(&input, dh, dt, &mut output, &mut fluxes);
                (id, output, fluxes)
            })
            .collect()
    };

    let out_sg = 1 - hier.flu_sg[lv];
    for (id, output, fluxes) in results {
        *hier.patch_mut(lv, id).fluid[out_sg]
            .as_deref_mut()
            .expect("real patch carries fluid data") = *output;

        if hier.with_flux {
            deposit_coarse_fluxes(hier, lv, id, &fluxes);
            deposit_fine_fluxes(hier, lv, id, &fluxes, 0.5);
        }
    }
}




/**
 * One potential update on a level: publish the potential ghost zones
 * for the elliptic solver, relax every real patch, and flip the
 * potential sandglass. Run after refinement with `after_refine` so the
 * exchange uses the post-refine transfer lists.
 */
pub fn update_potential<C: Communicator + ?Sized, P: PoissonSolver>(
    hier: &mut Hierarchy,
    comm: &C,
    solver: &P,
    lv: usize,
    after_refine: bool,
) -> Result<()> {
    let mode = if after_refine {
        BufferMode::PotAfterRefine
    } else {
        BufferMode::PotForPoisson
    };
    let pot_sg = hier.pot_sg[lv];
    get_buffer_data(
        hier,
        comm,
        lv,
        0,
        pot_sg,
        mode,
        _POTE,
        solver.ghost_width(),
        UseLb::No,
    )?;

    let dh = hier.config.cell_size(lv);
    let ids: Vec<PatchId> = hier.real_ids(lv).to_vec();
    let ghost = solver.ghost_width();

    let results: Vec<(PatchId, Box<PotCube>)> = {
        let hier = &*hier;
        ids.par_iter()
            .map(|&id| {
                let density = prepare_input(hier, lv, id, ghost);
                let pot_in = hier.patch(lv, id).pot[pot_sg]
                    .as_deref()
                    .expect("gravity run carries potential data");
                let mut pot_out = Box::new([[[0.0; PATCH_SIZE]; PATCH_SIZE]; PATCH_SIZE]);
                solver.relax(&density, pot_in, dh, &mut pot_out);
                (id, pot_out)
            })
            .collect()
    };

    let out_sg = 1 - pot_sg;
    for (id, pot_out) in results {
        *hier.patch_mut(lv, id).pot[out_sg]
            .as_deref_mut()
            .expect("gravity run carries potential data") = *pot_out;
    }
    hier.flip_pot_sg(lv);
    Ok(())
}




/**
 * A leaf sweep of the conserved totals, `sum(field * cell volume)` over
 * every real leaf cell on this rank. The conservation tests reduce this
 * across ranks around a fix-up cycle.
 */
pub fn conserved_totals(hier: &Hierarchy) -> [Real; NCOMP_TOTAL] {
    let mut totals = [0.0; NCOMP_TOTAL];
    for lv in 0..hier.num_levels() {
        let dv = hier.config.cell_size(lv).powi(3);
        let sg = hier.flu_sg[lv];
        for &id in hier.real_ids(lv) {
            let patch = hier.patch(lv, id);
            if patch.son != Son::None {
                continue;
            }
            let cube = patch.fluid[sg].as_deref().expect("real patch carries fluid data");
            for (v, total) in totals.iter_mut().enumerate() {
                let mut sum = 0.0;
                for plane in &cube[v] {
                    for row in plane {
                        for value in row {
                            sum += value;
                        }
                    }
                }
                *total += sum * dv;
            }
        }
    }
    totals
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::message::local::local_group;
    use crate::patch::{DENS, ENGY, MOMX, MOMY, MOMZ};
    use crate::solvers::advect::DonorCellAdvection;

    fn refined_test_hierarchy<F>(fill: F) -> Hierarchy
    where
        F: Fn([i64; 3], usize, usize, usize, usize) -> Real,
    {
        let config = RuntimeConfig {
            box_size: 16.0,
            n_root: [2, 2, 2],
            max_level: 1,
            ..RuntimeConfig::default()
        };
        let mut hier = Hierarchy::new(config, 0);
        hier.build_root();

        let roots: Vec<PatchId> = hier.real_ids(0).to_vec();
        for id in roots {
            let corner = hier.patch(0, id).corner;
            let cube = hier.patch_mut(0, id).fluid[0].as_deref_mut().unwrap();
            for v in 0..NCOMP_TOTAL {
                for k in 0..PATCH_SIZE {
                    for j in 0..PATCH_SIZE {
                        for i in 0..PATCH_SIZE {
                            cube[v][k][j][i] = fill(corner, v, k, j, i);
                        }
                    }
                }
            }
        }

        // refine the origin octant; injection keeps the sons consistent
        // with the father
        let id = hier.id_at_corner(0, [0, 0, 0]).unwrap();
        hier.refine(0, id).unwrap();
        hier.verify_invariants().unwrap();
        hier
    }

    #[test]
    fn uniform_flow_is_a_fixed_point_of_the_full_step() {
        let group = local_group(1);
        let constants = [1.0, 0.3, -0.2, 0.1, 5.0, 0.02];
        let mut hier = refined_test_hierarchy(|_, v, _, _, _| constants[v]);
        let solver = DonorCellAdvection {
            velocity: [1.0, 0.5, 0.25],
        };

        advance_level(&mut hier, &group[0], &solver, 0, 0.2).unwrap();

        // a completed coarse step leaves every level at the same time
        assert!((hier.time[0] - hier.time[1]).abs() < 1e-14);

        for lv in 0..hier.num_levels() {
            let sg = hier.flu_sg[lv];
            for &id in hier.real_ids(lv) {
                let cube = hier.patch(lv, id).fluid[sg].as_deref().unwrap();
                for v in 0..NCOMP_TOTAL {
                    for k in 0..PATCH_SIZE {
                        for j in 0..PATCH_SIZE {
                            for i in 0..PATCH_SIZE {
                                assert!(
                                    (cube[v][k][j][i] - constants[v]).abs() < 1e-12,
                                    "level {} comp {} drifted",
                                    lv,
                                    v
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn fix_up_restores_global_conservation() {
        let group = local_group(1);
        let mut hier = refined_test_hierarchy(|corner, v, k, j, i| {
            let x = corner[0] as Real + 2.0 * i as Real;
            let y = corner[1] as Real + 2.0 * j as Real;
            let z = corner[2] as Real + 2.0 * k as Real;
            let bump = 1.0 + 0.3 * ((x / 7.0).sin() + (y / 5.0).cos() + (z / 9.0).sin());
            match v {
                DENS => 2.0 + bump,
                MOMX => 0.4 * bump,
                MOMY => -0.2 * bump,
                MOMZ => 0.1 * bump,
                ENGY => 10.0 + bump,
                _ => 0.05 * bump,
            }
        });
        let solver = DonorCellAdvection {
            velocity: [1.0, 0.5, 0.25],
        };

        let before = conserved_totals(&hier);
        advance_level(&mut hier, &group[0], &solver, 0, 0.2).unwrap();
        let after = conserved_totals(&hier);

        for v in 0..NFLUX {
            let scale = before[v].abs().max(1.0);
            assert!(
                ((after[v] - before[v]) / scale).abs() < 1e-12,
                "component {} not conserved: {} vs {}",
                v,
                before[v],
                after[v]
            );
        }
    }

    struct DensityEcho;

    impl PoissonSolver for DensityEcho {
        fn ghost_width(&self) -> usize {
            1
        }

        fn relax(&self, density: &FluidInput, _pot_in: &PotCube, _dh: f64, pot_out: &mut PotCube) {
            let g = self.ghost_width();
            for k in 0..PATCH_SIZE {
                for j in 0..PATCH_SIZE {
                    for i in 0..PATCH_SIZE {
                        pot_out[k][j][i] = -density.at(crate::patch::DENS, k + g, j + g, i + g);
                    }
                }
            }
        }
    }

    #[test]
    fn potential_update_flips_the_sandglass() {
        let group = local_group(1);
        let config = RuntimeConfig {
            n_root: [2, 2, 2],
            max_level: 0,
            gravity_type: crate::config::GravityType::SelfGravity,
            ..RuntimeConfig::default()
        };
        let mut hier = Hierarchy::new(config, 0);
        hier.build_root();

        let id = hier.real_ids(0)[0];
        hier.patch_mut(0, id).fluid[0].as_deref_mut().unwrap()[DENS][2][3][4] = 7.0;

        assert_eq!(hier.pot_sg[0], 0);
        update_potential(&mut hier, &group[0], &DensityEcho, 0, false).unwrap();
        assert_eq!(hier.pot_sg[0], 1);

        let pot = hier.patch(0, id).pot[1].as_deref().unwrap();
        assert_eq!(pot[2][3][4], -7.0);
    }

    #[test]
    fn restriction_sees_the_fine_average_after_the_step() {
        let group = local_group(1);
        let mut hier = refined_test_hierarchy(|corner, v, k, j, i| {
            1.0 + v as Real + 0.01 * (corner[0] as Real + (i + j + k) as Real)
        });
        let solver = DonorCellAdvection {
            velocity: [0.5, 0.0, 0.0],
        };
        advance_level(&mut hier, &group[0], &solver, 0, 0.2).unwrap();

        let father = hier.id_at_corner(0, [0, 0, 0]).unwrap();
        let first = match hier.patch(0, father).son {
            Son::Local(first) => first,
            _ => unreachable!(),
        };
        let fa_sg = hier.flu_sg[0];
        let son_sg = hier.flu_sg[1];

        let fa = hier.patch(0, father).fluid[fa_sg].as_deref().unwrap();
        let son = hier.patch(1, first).fluid[son_sg].as_deref().unwrap();
        let mut avg = 0.0;
        for dk in 0..2 {
            for dj in 0..2 {
                for di in 0..2 {
                    avg += son[DENS][dk][dj][di];
                }
            }
        }
        assert!((fa[DENS][0][0][0] - 0.125 * avg).abs() < 1e-13);
    }
}
