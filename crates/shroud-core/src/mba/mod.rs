//! Mixed Boolean-Arithmetic identities.
//!
//! Every identity here is exact for all inputs under wrapping arithmetic.
//! The interpreter's additive and bitwise handlers, and MUL by two,
//! evaluate through them; [`ObfCell`] uses [`MbaWord`] for its additive
//! key layer.
//!
//! [`ObfCell`]: crate::vm::cell::ObfCell

pub mod identity;

/// Width-generic MBA addition and subtraction.
pub trait MbaWord: Copy {
    /// `x + y` as `(x ^ y) + 2 * (x & y)`.
    fn mba_add(self, y: Self) -> Self;
    /// `x - y` as `(x ^ y) - 2 * (!x & y)`.
    fn mba_sub(self, y: Self) -> Self;
}

macro_rules! mba_word {
    ($($t:ty),* $(,)?) => {$(
        impl MbaWord for $t {
            #[inline(always)]
            fn mba_add(self, y: Self) -> Self {
                (self ^ y).wrapping_add((self & y).wrapping_shl(1))
            }

            #[inline(always)]
            fn mba_sub(self, y: Self) -> Self {
                (self ^ y).wrapping_sub((!self & y).wrapping_shl(1))
            }
        }
    )*};
}

mba_word!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_u8_exhaustive() {
        for x in 0..=255u8 {
            for y in 0..=255u8 {
                assert_eq!(x.mba_add(y), x.wrapping_add(y));
                assert_eq!(x.mba_sub(y), x.wrapping_sub(y));
            }
        }
    }

    #[test]
    fn test_signed_random() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..10_000 {
            let x: i64 = rng.gen();
            let y: i64 = rng.gen();
            assert_eq!(x.mba_add(y), x.wrapping_add(y));
            assert_eq!(x.mba_sub(y), x.wrapping_sub(y));
        }
        assert_eq!(i64::MIN.mba_sub(1), i64::MAX);
        assert_eq!(i64::MAX.mba_add(1), i64::MIN);
    }
}
