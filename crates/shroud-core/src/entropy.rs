//! Entropy provisioning.
//!
//! The engine only ever asks for unsigned 64-bit values. Whether they are
//! fixed per build ([`BuildEntropy`]) or unique per run ([`RuntimeEntropy`])
//! is up to the caller; any `rand` generator works as a source too.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::BUILD_SEED;

/// Supplies entropy to the builder, the cells and the interpreter.
pub trait EntropySource {
    /// Next unsigned 64-bit value.
    fn entropy_u64(&mut self) -> u64;

    /// Uniform-ish value in `0..bound`. Returns 0 when `bound` is 0.
    fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        // Lemire's multiply-shift; bias is irrelevant at these bounds.
        ((self.entropy_u64() as u128 * bound as u128) >> 64) as u64
    }

    /// `true` with roughly `percent`% probability.
    fn chance(&mut self, percent: u8) -> bool {
        self.below(100) < u64::from(percent.min(100))
    }

    /// A single random byte.
    fn byte(&mut self) -> u8 {
        (self.entropy_u64() >> 56) as u8
    }
}

impl<R: RngCore + ?Sized> EntropySource for R {
    #[inline]
    fn entropy_u64(&mut self) -> u64 {
        self.next_u64()
    }
}

/// splitmix64 finalizer. Used to spread small or correlated seeds.
#[inline]
pub fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Deterministic stream derived from a seed. Two instances built from the
/// same seed produce the same values, so encode-time and decode-time draws
/// agree.
#[derive(Debug, Clone)]
pub struct BuildEntropy {
    rng: ChaCha20Rng,
}

impl BuildEntropy {
    /// Stream for this build's [`BUILD_SEED`].
    pub fn new() -> Self {
        Self::from_seed(BUILD_SEED)
    }

    pub fn from_seed(seed: u64) -> Self {
        BuildEntropy {
            rng: ChaCha20Rng::seed_from_u64(splitmix64(seed ^ 0x5348_524F_5544_0001)),
        }
    }
}

impl Default for BuildEntropy {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for BuildEntropy {
    fn entropy_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }
}

/// Run-distinct entropy: the OS generator mixed with process id, wall
/// clock and a stack address.
#[derive(Debug, Clone)]
pub struct RuntimeEntropy {
    rng: StdRng,
}

impl RuntimeEntropy {
    pub fn new() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let mut os = StdRng::from_entropy();
        let mut seed = os.next_u64();

        let marker = 0u8;
        seed ^= std::ptr::addr_of!(marker) as usize as u64;
        seed ^= u64::from(std::process::id()) << 32;
        if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
            seed ^= now.as_nanos() as u64;
        }

        RuntimeEntropy {
            rng: StdRng::seed_from_u64(splitmix64(seed.rotate_left(31))),
        }
    }
}

impl Default for RuntimeEntropy {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropySource for RuntimeEntropy {
    fn entropy_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_entropy_is_reproducible() {
        let mut a = BuildEntropy::from_seed(7);
        let mut b = BuildEntropy::from_seed(7);
        for _ in 0..64 {
            assert_eq!(a.entropy_u64(), b.entropy_u64());
        }
    }

    #[test]
    fn test_build_entropy_seeds_differ() {
        let mut a = BuildEntropy::from_seed(1);
        let mut b = BuildEntropy::from_seed(2);
        let same = (0..16).filter(|_| a.entropy_u64() == b.entropy_u64()).count();
        assert!(same < 16);
    }

    #[test]
    fn test_below_stays_in_range() {
        let mut src = StdRng::seed_from_u64(42);
        for bound in [1u64, 2, 3, 7, 100, 255, 1 << 40] {
            for _ in 0..200 {
                assert!(src.below(bound) < bound);
            }
        }
        assert_eq!(src.below(0), 0);
    }

    #[test]
    fn test_chance_extremes() {
        let mut src = StdRng::seed_from_u64(3);
        for _ in 0..500 {
            assert!(!src.chance(0));
            assert!(src.chance(100));
        }
    }

    #[test]
    fn test_runtime_entropy_produces_values() {
        let mut src = RuntimeEntropy::new();
        let values: Vec<u64> = (0..8).map(|_| src.entropy_u64()).collect();
        assert!(values.windows(2).any(|w| w[0] != w[1]));
    }
}
