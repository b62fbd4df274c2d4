//! Reference collaborators for the grid core: minimal integrators that
//! honor the solver contracts, used by the demo driver and the
//! conservation tests. Production discretizations plug into the same
//! traits.

pub mod advect;
