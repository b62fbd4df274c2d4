use thiserror::Error;

/**
 * Error taxonomy for the AMR core. Precondition violations report the
 * offending parameter and value. Invariant violations are raised by debug
 * builds only; release builds skip the checks entirely. Numerical guard
 * trips identify the level, patch and cell so the run can be diagnosed
 * from the abort message alone.
 */
#[derive(Debug, Error)]
pub enum AmrError {
    #[error("incorrect parameter {name} = {value}")]
    Precondition { name: &'static str, value: i64 },

    #[error("no suitable target variable for mode {mode}: mask {mask:#x}")]
    IncompatibleMask { mode: &'static str, mask: u32 },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("numerical guard at level {level}, patch {patch}, cell ({i},{j},{k}): {what}")]
    NumericalGuard {
        level: usize,
        patch: usize,
        i: usize,
        j: usize,
        k: usize,
        what: String,
    },

    #[error("flux register requested on non coarse-fine face {face} of patch {patch}")]
    NoFluxRegister { patch: usize, face: usize },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("checkpoint i/o: {0}")]
    Checkpoint(String),
}

pub type Result<T> = std::result::Result<T, AmrError>;
