//! Explicit, splittable random keys.
//!
//! Every stochastic operation takes a key from its caller; nothing reads a
//! global generator. A key is a 64-bit seed, derived keys are produced by
//! hashing the parent seed with an index, and a key becomes a generator only at
//! the point of use.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RngKey(u64);

impl RngKey {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn seed(self) -> u64 {
        self.0
    }

    /// Key for the `index`-th independent stream below this key.
    pub fn fold_in(self, index: u64) -> Self {
        Self(mix(self.0 ^ mix(index.wrapping_add(0x9E37_79B9_7F4A_7C15))))
    }

    /// `n` independent child keys.
    pub fn split(self, n: usize) -> Vec<Self> {
        (0..n as u64).map(|i| self.fold_in(i)).collect()
    }

    /// Two child keys, for the common "consume one, pass one on" pattern.
    pub fn split2(self) -> (Self, Self) {
        (self.fold_in(0), self.fold_in(1))
    }

    pub fn to_rng(self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.0)
    }
}

impl Default for RngKey {
    fn default() -> Self {
        Self(0)
    }
}

impl From<u64> for RngKey {
    fn from(seed: u64) -> Self {
        Self(seed)
    }
}

// splitmix64 finalizer
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
