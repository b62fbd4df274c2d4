use crate::error::{AmrError, Result};
use crate::patch::Real;




/// Size of the auxiliary parameter array every external hook reads.
pub const EXT_NAUX_MAX: usize = 10;


/// Closed-form external acceleration, `a(x, y, z, t)`.
pub type ExtAccFn = fn(f64, f64, f64, f64, &[f64; EXT_NAUX_MAX]) -> [Real; 3];

/// Closed-form external potential, `phi(x, y, z, t)`.
pub type ExtPotFn = fn(f64, f64, f64, f64, &[f64; EXT_NAUX_MAX]) -> Real;




/**
 * The pair of function-pointer slots through which closed-form gravity
 * sources inject accelerations and potentials: one slot for each, plus
 * a bounded parameter array per slot. The hooks are called by the
 * Poisson solver (to add the external potential to ghost cells) and by
 * the star-formation sweep (to seed particle accelerations); they carry
 * no state beyond the parameter arrays and must be pure, so the sweep
 * can evaluate them from every worker thread.
 */
#[derive(Clone, Copy)]
pub struct ExternalGravity {
    pub acc: Option<ExtAccFn>,
    pub pot: Option<ExtPotFn>,
    pub acc_aux: [f64; EXT_NAUX_MAX],
    pub pot_aux: [f64; EXT_NAUX_MAX],
}




// ============================================================================
impl ExternalGravity {


    pub fn disabled() -> Self {
        Self {
            acc: None,
            pot: None,
            acc_aux: [0.0; EXT_NAUX_MAX],
            pot_aux: [0.0; EXT_NAUX_MAX],
        }
    }


    /**
     * A missing callback behind an enabled flag is a configuration
     * error, caught up front rather than at the first evaluation.
     */
    pub fn validate(&self, requires_acc: bool, requires_pot: bool) -> Result<()> {
        if requires_acc && self.acc.is_none() {
            return Err(AmrError::Precondition {
                name: "ext_acc_fn",
                value: 0,
            });
        }
        if requires_pot && self.pot.is_none() {
            return Err(AmrError::Precondition {
                name: "ext_pot_fn",
                value: 0,
            });
        }
        Ok(())
    }


    pub fn acceleration_at(&self, x: f64, y: f64, z: f64, time: f64) -> [Real; 3] {
        match self.acc {
            Some(f) => f(x, y, z, time, &self.acc_aux),
            None => [0.0; 3],
        }
    }


    pub fn potential_at(&self, x: f64, y: f64, z: f64, time: f64) -> Real {
        match self.pot {
            Some(f) => f(x, y, z, time, &self.pot_aux),
            None => 0.0,
        }
    }
}




// ============================================================================
// The canonical example source: a point mass with optional softening.
//
// aux[0..3] = center coordinates
// aux[3]    = gravitational_constant * point_source_mass
// aux[4]    = soften_length (<= 0.0 disables softening)


pub fn point_mass_aux(center: [f64; 3], gm: f64, eps: f64) -> [f64; EXT_NAUX_MAX] {
    let mut aux = [0.0; EXT_NAUX_MAX];
    aux[0] = center[0];
    aux[1] = center[1];
    aux[2] = center[2];
    aux[3] = gm;
    aux[4] = eps;
    aux
}


/// Plummer-softened point-mass acceleration, `-GM r / (r^2 + eps^2)^{3/2}`.
pub fn ext_acc_point_mass_plummer(
    x: f64,
    y: f64,
    z: f64,
    _time: f64,
    aux: &[f64; EXT_NAUX_MAX],
) -> [Real; 3] {
    let gm = aux[3];
    let eps = aux[4];
    let dx = x - aux[0];
    let dy = y - aux[1];
    let dz = z - aux[2];
    let r2 = dx * dx + dy * dy + dz * dz;

    let inv_r3 = if eps <= 0.0 {
        1.0 / (r2 * r2.sqrt())
    } else {
        (r2 + eps * eps).powf(-1.5)
    };
    [-gm * inv_r3 * dx, -gm * inv_r3 * dy, -gm * inv_r3 * dz]
}


/// Ruffert (1994) softening variant of the point-mass acceleration.
pub fn ext_acc_point_mass_ruffert(
    x: f64,
    y: f64,
    z: f64,
    _time: f64,
    aux: &[f64; EXT_NAUX_MAX],
) -> [Real; 3] {
    let gm = aux[3];
    let eps = aux[4];
    let dx = x - aux[0];
    let dy = y - aux[1];
    let dz = z - aux[2];
    let r2 = dx * dx + dy * dy + dz * dz;

    let inv_r3 = if eps <= 0.0 {
        1.0 / (r2 * r2.sqrt())
    } else {
        let tmp = (-r2 / (eps * eps)).exp();
        (r2 + eps * eps * tmp).powf(-1.5) * (1.0 - tmp)
    };
    [-gm * inv_r3 * dx, -gm * inv_r3 * dy, -gm * inv_r3 * dz]
}


/// Plummer-softened point-mass potential, `-GM / sqrt(r^2 + eps^2)`.
pub fn ext_pot_point_mass(
    x: f64,
    y: f64,
    z: f64,
    _time: f64,
    aux: &[f64; EXT_NAUX_MAX],
) -> Real {
    let gm = aux[3];
    let eps = aux[4];
    let dx = x - aux[0];
    let dy = y - aux[1];
    let dz = z - aux[2];
    let r2 = dx * dx + dy * dy + dz * dz;

    if eps <= 0.0 {
        -gm / r2.sqrt()
    } else {
        -gm / (r2 + eps * eps).sqrt()
    }
}
