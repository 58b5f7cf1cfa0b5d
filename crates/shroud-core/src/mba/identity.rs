//! `u64` MBA rewrites used by the interpreter's ALU handlers.
//!
//! Where two rewrites exist for the same operation the caller picks one per
//! evaluation, so the same logical ADD does not always execute the same
//! host instruction sequence.

/// `x + y = (x ^ y) + 2 * (x & y)`
#[inline(always)]
pub fn add_v1(x: u64, y: u64) -> u64 {
    (x ^ y).wrapping_add((x & y) << 1)
}

/// `x + y = (x | y) + (x & y)`
#[inline(always)]
pub fn add_v2(x: u64, y: u64) -> u64 {
    (x | y).wrapping_add(x & y)
}

/// Addition through the rewrite selected by `variant`'s low bit.
#[inline(always)]
pub fn add(x: u64, y: u64, variant: u64) -> u64 {
    if variant & 1 == 0 {
        add_v1(x, y)
    } else {
        add_v2(x, y)
    }
}

/// `x - y = (x ^ y) - 2 * (!x & y)`
#[inline(always)]
pub fn sub(x: u64, y: u64) -> u64 {
    (x ^ y).wrapping_sub((!x & y) << 1)
}

/// `-x = !x + 1`
#[inline(always)]
pub fn neg(x: u64) -> u64 {
    add_v1(!x, 1)
}

/// `2x = (x | 2x) + (x & 2x) - x`
#[inline(always)]
pub fn mul2(x: u64) -> u64 {
    let d = x << 1;
    (x | d).wrapping_add(x & d).wrapping_sub(x)
}

/// `x ^ y = (x | y) - (x & y)`
#[inline(always)]
pub fn xor(x: u64, y: u64) -> u64 {
    (x | y).wrapping_sub(x & y)
}

/// `x & y = !(!x | !y)`
#[inline(always)]
pub fn and(x: u64, y: u64) -> u64 {
    !(!x | !y)
}

/// `x | y = !(!x & !y)`
#[inline(always)]
pub fn or(x: u64, y: u64) -> u64 {
    !(!x & !y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const EDGES: [u64; 7] = [0, 1, 2, 0xFF, 0x8000_0000_0000_0000, u64::MAX - 1, u64::MAX];

    #[test]
    fn test_edge_pairs() {
        for &x in &EDGES {
            for &y in &EDGES {
                assert_eq!(add_v1(x, y), x.wrapping_add(y), "add_v1 x={x:#x} y={y:#x}");
                assert_eq!(add_v2(x, y), x.wrapping_add(y), "add_v2 x={x:#x} y={y:#x}");
                assert_eq!(sub(x, y), x.wrapping_sub(y), "sub x={x:#x} y={y:#x}");
                assert_eq!(xor(x, y), x ^ y);
                assert_eq!(and(x, y), x & y);
                assert_eq!(or(x, y), x | y);
            }
            assert_eq!(neg(x), x.wrapping_neg());
            assert_eq!(mul2(x), x.wrapping_mul(2), "mul2 x={x:#x}");
        }
    }

    #[test]
    fn test_random_pairs() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..10_000 {
            let x: u64 = rng.gen();
            let y: u64 = rng.gen();
            let v: u64 = rng.gen();
            assert_eq!(add(x, y, v), x.wrapping_add(y));
            assert_eq!(sub(x, y), x.wrapping_sub(y));
            assert_eq!(xor(x, y), x ^ y);
            assert_eq!(neg(x), x.wrapping_neg());
            assert_eq!(mul2(x), x.wrapping_mul(2));
        }
    }
}
