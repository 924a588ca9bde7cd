use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// The run's single random stream.
///
/// Samplers draw from it in batch order, one uniform per unfinished
/// sequence per step, so a fixed seed reproduces a run exactly.
pub struct RandomState {
    rng: StdRng,
    seed: Option<u64>,
    draws: u64,
}

impl RandomState {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: Self::fresh(seed),
            seed,
            draws: 0,
        }
    }

    fn fresh(seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Restarts the stream at the beginning of a run.
    pub fn reset(&mut self) {
        self.rng = Self::fresh(self.seed);
        self.draws = 0;
    }

    /// Uniform in `[0, 1)`.
    #[inline]
    pub fn uniform(&mut self) -> f32 {
        self.draws += 1;
        self.rng.r#gen::<f32>()
    }

    /// Number of values drawn since the last reset.
    pub fn draws(&self) -> u64 {
        self.draws
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}
