//! Opaque predicates for the dispatch chain.
//!
//! [`always_true`] squares its argument modulo a 64-bit prime and checks
//! Euler's criterion on the result. A non-zero square is always a
//! residue, but the optimizer cannot see through the modular
//! exponentiation, so guarded decoy work stays in the binary.

/// Largest prime below 2^64.
pub const PRIME: u64 = 0xFFFF_FFFF_FFFF_FFC5;

#[inline(always)]
fn mul_mod(a: u64, b: u64) -> u64 {
    ((u128::from(a) * u128::from(b)) % u128::from(PRIME)) as u64
}

/// Always `true`, for any `x`.
#[inline(never)]
pub fn always_true(x: u64) -> bool {
    let y = x % (PRIME - 1) + 1;
    let mut base = mul_mod(y, y);

    // base^((p - 1) / 2) mod p
    let mut exp = (PRIME - 1) >> 1;
    let mut acc = 1u64;
    while exp != 0 {
        if exp & 1 != 0 {
            acc = mul_mod(acc, base);
        }
        base = mul_mod(base, base);
        exp >>= 1;
    }
    acc == 1
}
