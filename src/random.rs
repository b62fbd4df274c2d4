/// The multiplier, increment and modulus mask of the 48-bit linear
/// congruential sequence (the classic `drand48` constants).
const MULTIPLIER: u64 = 0x5DEECE66D;
const INCREMENT: u64 = 0xB;
const MASK_48: u64 = (1 << 48) - 1;




/**
 * A re-entrant 48-bit linear-congruential random source. Each instance
 * owns its whole state, so parallel sweeps carry one per worker thread;
 * `from_stream` derives the thread states deterministically from a base
 * seed and the stream index, which is what makes the star-formation
 * regression tests reproducible across runs and rank counts.
 */
#[derive(Clone, Debug)]
pub struct Rand48 {
    state: u64,
}




// ============================================================================
impl Rand48 {


    /// Seed as `srand48` does: the high 32 bits from the seed, the low
    /// 16 bits fixed.
    pub fn new(seed: u64) -> Self {
        Self {
            state: ((seed & 0xFFFF_FFFF) << 16) | 0x330E,
        }
    }


    /// The deterministic per-thread stream: worker `stream` of a sweep
    /// seeded with `base_seed` always produces the same sequence.
    pub fn from_stream(base_seed: u64, stream: usize) -> Self {
        Self::new(base_seed.wrapping_add(1000 * stream as u64))
    }


    /// Uniform deviate in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        self.state = MULTIPLIER
            .wrapping_mul(self.state)
            .wrapping_add(INCREMENT)
            & MASK_48;
        self.state as f64 / (MASK_48 + 1) as f64
    }
}
