use serde::{Deserialize, Serialize};

use crate::patch::PATCH_SIZE;




/**
 * The physical model being advanced on the hierarchy. The fix-up engine
 * dispatches on this: the fluid model optionally reconstructs total
 * energy to keep pressure above a floor, while the wave-function model
 * optionally rescales its real and imaginary parts so the squared
 * amplitude tracks the corrected density.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Model {
    Hydro { gamma: f64, min_pres: Option<f64> },
    Elbdm { conserve_mass: bool },
}

impl Model {
    pub fn name(&self) -> &'static str {
        match self {
            Model::Hydro { .. } => "Hydro",
            Model::Elbdm { .. } => "ELBDM",
        }
    }
}




#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GravityType {
    None,
    SelfGravity,
    External,
    Both,
}

impl GravityType {
    pub fn has_self(&self) -> bool {
        matches!(self, GravityType::SelfGravity | GravityType::Both)
    }

    pub fn has_external(&self) -> bool {
        matches!(self, GravityType::External | GravityType::Both)
    }
}




/// Parameters of the stochastic star-formation sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StarFormationConfig {
    pub gas_dens_thres: f64,
    pub efficiency: f64,
    pub min_star_mass: f64,
    pub max_star_mfrac: f64,
    pub use_metal: bool,
}




/**
 * The flat runtime parameter set. This struct is embedded verbatim in
 * every checkpoint (the `InputPara` record), so a dump is reloadable
 * without the original parameter file.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Edge length of the (cubic) computational domain.
    pub box_size: f64,
    /// Root-level patches per axis.
    pub n_root: [usize; 3],
    /// Deepest refinement level; level 0 is the root.
    pub max_level: usize,
    pub periodic: [bool; 3],
    /// Rank grid of the static partition.
    pub rank_dims: [usize; 3],

    pub model: Model,
    pub gravity_type: GravityType,
    pub newton_g: f64,

    pub fixup_flux: bool,
    pub fixup_restrict: bool,
    /// Skip flux corrections that would drive the density non-positive
    /// (density component only).
    pub positive_dens_in_fixup: bool,

    pub star_formation: Option<StarFormationConfig>,
    pub random_seed: u64,
    /// Independent random streams for threaded sweeps.
    pub n_stream: usize,

    pub ghost_exchange_width: usize,
}




// ============================================================================
impl RuntimeConfig {


    /// Cell size at refinement level `lv`.
    pub fn cell_size(&self, lv: usize) -> f64 {
        self.box_size / (self.n_root[0] * PATCH_SIZE) as f64 / (1u64 << lv) as f64
    }


    /// Cell size at the deepest level; converts integer patch corners
    /// to physical coordinates.
    pub fn cell_size_finest(&self) -> f64 {
        self.cell_size(self.max_level)
    }


    pub fn num_levels(&self) -> usize {
        self.max_level + 1
    }
}


impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            box_size: 1.0,
            n_root: [2, 2, 2],
            max_level: 3,
            periodic: [true, true, true],
            rank_dims: [1, 1, 1],
            model: Model::Hydro {
                gamma: 5.0 / 3.0,
                min_pres: None,
            },
            gravity_type: GravityType::None,
            newton_g: 1.0,
            fixup_flux: true,
            fixup_restrict: true,
            positive_dens_in_fixup: false,
            star_formation: None,
            random_seed: 42,
            n_stream: 1,
            ghost_exchange_width: 2,
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn cell_sizes_halve_per_level() {
        let config = RuntimeConfig {
            box_size: 16.0,
            n_root: [2, 2, 2],
            max_level: 2,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.cell_size(0), 1.0);
        assert_eq!(config.cell_size(1), 0.5);
        assert_eq!(config.cell_size_finest(), 0.25);
    }
}
