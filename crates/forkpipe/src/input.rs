//! Input vector sources for the supervisor.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bridge::protocol::IntegerVector;

/// Inclusive range of generated elements.
pub const ELEMENT_RANGE: std::ops::RangeInclusive<i32> = 1..=10;

pub trait InputSource {
    fn generate(&mut self, len: usize) -> IntegerVector;
}

/// Bounded pseudo-random integers drawn from [`ELEMENT_RANGE`].
#[derive(Debug)]
pub struct RandomInput {
    rng: StdRng,
}

impl RandomInput {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl InputSource for RandomInput {
    fn generate(&mut self, len: usize) -> IntegerVector {
        (0..len)
            .map(|_| self.rng.gen_range(ELEMENT_RANGE))
            .collect::<Vec<_>>()
            .into()
    }
}

/// A fixed vector, for reproducible runs. `len` is ignored.
#[derive(Debug, Clone)]
pub struct FixedInput(Vec<i32>);

impl FixedInput {
    pub fn new(values: Vec<i32>) -> Self {
        Self(values)
    }
}

impl InputSource for FixedInput {
    fn generate(&mut self, _len: usize) -> IntegerVector {
        IntegerVector::new(self.0.clone())
    }
}
