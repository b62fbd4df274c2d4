use crate::driver::{FluidInput, FluidSolver, SolverFluxes};
use crate::patch::{FluidCube, Real, NCOMP_TOTAL, NFLUX, PATCH_SIZE};




/**
 * First-order donor-cell advection of every field by a constant
 * velocity. Deliberately the simplest conservative scheme that
 * exercises the whole grid core: one ghost layer, upwind interface
 * fluxes, and honest face-flux reporting for the coarse-fine registers.
 */
pub struct DonorCellAdvection {
    pub velocity: [Real; 3],
}




// ============================================================================
impl DonorCellAdvection {


    /// Upwind interface flux along `axis` between `left` and `right`.
    fn interface_flux(&self, axis: usize, left: Real, right: Real) -> Real {
        let v = self.velocity[axis];
        if v >= 0.0 {
            v * left
        } else {
            v * right
        }
    }
}


impl FluidSolver for DonorCellAdvection {


    fn ghost_width(&self) -> usize {
        1
    }


    fn advance(
        &self,
        input: &FluidInput,
        dh: f64,
        dt: f64,
        output: &mut FluidCube,
        fluxes: &mut SolverFluxes,
    ) {
        let g = self.ghost_width();
        let courant = dt / dh;

        for v in 0..NCOMP_TOTAL {
            for k in 0..PATCH_SIZE {
                for j in 0..PATCH_SIZE {
                    for i in 0..PATCH_SIZE {
                        let (kk, jj, ii) = (k + g, j + g, i + g);
                        let center = input.at(v, kk, jj, ii);

                        let fx_lo =
                            self.interface_flux(0, input.at(v, kk, jj, ii - 1), center);
                        let fx_hi =
                            self.interface_flux(0, center, input.at(v, kk, jj, ii + 1));
                        let fy_lo =
                            self.interface_flux(1, input.at(v, kk, jj - 1, ii), center);
                        let fy_hi =
                            self.interface_flux(1, center, input.at(v, kk, jj + 1, ii));
                        let fz_lo =
                            self.interface_flux(2, input.at(v, kk - 1, jj, ii), center);
                        let fz_hi =
                            self.interface_flux(2, center, input.at(v, kk + 1, jj, ii));

                        output[v][k][j][i] = center
                            - courant
                                * ((fx_hi - fx_lo) + (fy_hi - fy_lo) + (fz_hi - fz_lo));
                    }
                }
            }
        }

        // boundary-face fluxes for the conservation registers
        let last = g + PATCH_SIZE - 1;
        for v in 0..NFLUX {
            for m in 0..PATCH_SIZE {
                for n in 0..PATCH_SIZE {
                    let (k, j) = (m + g, n + g);
                    fluxes[0][v][m][n] =
                        self.interface_flux(0, input.at(v, k, j, g - 1), input.at(v, k, j, g));
                    fluxes[1][v][m][n] =
                        self.interface_flux(0, input.at(v, k, j, last), input.at(v, k, j, last + 1));

                    let (k, i) = (m + g, n + g);
                    fluxes[2][v][m][n] =
                        self.interface_flux(1, input.at(v, k, g - 1, i), input.at(v, k, g, i));
                    fluxes[3][v][m][n] =
                        self.interface_flux(1, input.at(v, k, last, i), input.at(v, k, last + 1, i));

                    let (j, i) = (m + g, n + g);
                    fluxes[4][v][m][n] =
                        self.interface_flux(2, input.at(v, g - 1, j, i), input.at(v, g, j, i));
                    fluxes[5][v][m][n] =
                        self.interface_flux(2, input.at(v, last, j, i), input.at(v, last + 1, j, i));
                }
            }
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::driver::prepare_input;
    use crate::hierarchy::Hierarchy;
    use crate::patch::DENS;

    #[test]
    fn uniform_state_is_a_fixed_point() {
        let config = RuntimeConfig {
            n_root: [2, 2, 2],
            max_level: 0,
            ..RuntimeConfig::default()
        };
        let mut hierarchy = Hierarchy::new(config, 0);
        hierarchy.build_root();

        for &id in &hierarchy.real_ids(0).to_vec() {
            let cube = hierarchy.patch_mut(0, id).fluid[0].as_deref_mut().unwrap();
            for k in 0..PATCH_SIZE {
                for j in 0..PATCH_SIZE {
                    for i in 0..PATCH_SIZE {
                        cube[DENS][k][j][i] = 3.5;
                    }
                }
            }
        }

        let solver = DonorCellAdvection {
            velocity: [1.0, -0.5, 0.25],
        };
        let id = hierarchy.real_ids(0)[0];
        let input = prepare_input(&hierarchy, 0, id, 1);
        let mut output = crate::patch::new_fluid_cube();
        let mut fluxes: Box<SolverFluxes> =
            Box::new([[[[0.0; PATCH_SIZE]; PATCH_SIZE]; NFLUX]; 6]);
        solver.advance(&input, 1.0, 0.1, &mut output, &mut fluxes);

        for k in 0..PATCH_SIZE {
            for j in 0..PATCH_SIZE {
                for i in 0..PATCH_SIZE {
                    assert_eq!(output[DENS][k][j][i], 3.5);
                }
            }
        }
        // uniform state: every face flux is v * u
        assert_eq!(fluxes[0][DENS][2][5], 3.5);
        assert_eq!(fluxes[3][DENS][2][5], -1.75);
    }

    #[test]
    fn update_matches_flux_divergence() {
        let config = RuntimeConfig {
            n_root: [2, 2, 2],
            max_level: 0,
            ..RuntimeConfig::default()
        };
        let mut hierarchy = Hierarchy::new(config, 0);
        hierarchy.build_root();

        for &id in &hierarchy.real_ids(0).to_vec() {
            let corner = hierarchy.patch(0, id).corner;
            let cube = hierarchy.patch_mut(0, id).fluid[0].as_deref_mut().unwrap();
            for k in 0..PATCH_SIZE {
                for j in 0..PATCH_SIZE {
                    for i in 0..PATCH_SIZE {
                        cube[DENS][k][j][i] =
                            1.0 + 0.01 * (corner[0] as Real + i as Real + j as Real + k as Real);
                    }
                }
            }
        }

        let solver = DonorCellAdvection {
            velocity: [1.0, 0.0, 0.0],
        };
        let id = hierarchy.real_ids(0)[0];
        let input = prepare_input(&hierarchy, 0, id, 1);
        let mut output = crate::patch::new_fluid_cube();
        let mut fluxes: Box<SolverFluxes> =
            Box::new([[[[0.0; PATCH_SIZE]; PATCH_SIZE]; NFLUX]; 6]);
        let (dh, dt) = (1.0, 0.25);
        solver.advance(&input, dh, dt, &mut output, &mut fluxes);

        // the column sum changes only by the boundary fluxes
        let (k, j) = (3, 4);
        let before: Real = (0..PATCH_SIZE)
            .map(|i| input.at(DENS, k + 1, j + 1, i + 1))
            .sum();
        let after: Real = (0..PATCH_SIZE).map(|i| output[DENS][k][j][i]).sum();
        let expected = before - dt / dh * (fluxes[1][DENS][k][j] - fluxes[0][DENS][k][j]);
        assert!((after - expected).abs() < 1e-12);
    }
}
