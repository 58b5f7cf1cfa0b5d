//! Immediate operand layout.
//!
//! An immediate is 8 payload bytes followed by a marker byte. The marker's
//! low bit selects the payload byte order, so the interpreter never relies
//! on host endianness. When bit 1 is set the payload is XOR-masked and the
//! 8-byte mask follows the marker in the same byte order. The upper six
//! marker bits are noise.

use crate::entropy::EntropySource;

pub const MARKER_BIG_ENDIAN: u8 = 0b01;
pub const MARKER_MASKED: u8 = 0b10;
const MARKER_FLAGS: u8 = MARKER_BIG_ENDIAN | MARKER_MASKED;

/// Payload bytes of an immediate.
pub const PAYLOAD_LEN: usize = 8;

/// How one immediate is laid out in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmLayout {
    pub big_endian: bool,
    pub mask: Option<u64>,
    noise: u8,
}

impl ImmLayout {
    pub fn new(big_endian: bool, mask: Option<u64>) -> Self {
        ImmLayout { big_endian, mask, noise: 0 }
    }

    /// Random byte order, marker noise and (if `masked`) mask key.
    pub fn random<S: EntropySource + ?Sized>(src: &mut S, masked: bool) -> Self {
        ImmLayout {
            big_endian: src.chance(50),
            mask: masked.then(|| src.entropy_u64()),
            noise: src.byte() & !MARKER_FLAGS,
        }
    }

    pub fn marker(&self) -> u8 {
        let mut marker = self.noise & !MARKER_FLAGS;
        if self.big_endian {
            marker |= MARKER_BIG_ENDIAN;
        }
        if self.mask.is_some() {
            marker |= MARKER_MASKED;
        }
        marker
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        PAYLOAD_LEN + 1 + if self.mask.is_some() { PAYLOAD_LEN } else { 0 }
    }

    /// Append the encoding of `value` to `out`.
    pub fn encode(&self, value: u64, out: &mut Vec<u8>) {
        let payload = value ^ self.mask.unwrap_or(0);
        out.extend_from_slice(&to_bytes(payload, self.big_endian));
        out.push(self.marker());
        if let Some(mask) = self.mask {
            out.extend_from_slice(&to_bytes(mask, self.big_endian));
        }
    }
}

fn to_bytes(v: u64, big_endian: bool) -> [u8; 8] {
    if big_endian {
        v.to_be_bytes()
    } else {
        v.to_le_bytes()
    }
}

fn from_bytes(bytes: [u8; 8], big_endian: bool) -> u64 {
    if big_endian {
        u64::from_be_bytes(bytes)
    } else {
        u64::from_le_bytes(bytes)
    }
}

/// Whether a mask key follows this marker.
pub fn marker_is_masked(marker: u8) -> bool {
    marker & MARKER_MASKED != 0
}

/// Reassemble a value from its payload, marker and optional mask bytes.
pub fn decode(payload: [u8; 8], marker: u8, mask: Option<[u8; 8]>) -> u64 {
    let big_endian = marker & MARKER_BIG_ENDIAN != 0;
    let value = from_bytes(payload, big_endian);
    match mask {
        Some(mask) if marker_is_masked(marker) => value ^ from_bytes(mask, big_endian),
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn split(bytes: &[u8]) -> u64 {
        let payload: [u8; 8] = bytes[..8].try_into().unwrap();
        let marker = bytes[8];
        let mask = marker_is_masked(marker).then(|| bytes[9..17].try_into().unwrap());
        decode(payload, marker, mask)
    }

    #[test]
    fn test_both_byte_orders() {
        for big_endian in [false, true] {
            let layout = ImmLayout::new(big_endian, None);
            let mut out = Vec::new();
            layout.encode(0x0102_0304_0506_0708, &mut out);
            assert_eq!(out.len(), 9);
            assert_eq!(out[0], if big_endian { 0x01 } else { 0x08 });
            assert_eq!(split(&out), 0x0102_0304_0506_0708);
        }
    }

    #[test]
    fn test_masked_payload_hides_value() {
        let layout = ImmLayout::new(false, Some(0xA5A5_A5A5_A5A5_A5A5));
        let mut out = Vec::new();
        layout.encode(42, &mut out);
        assert_eq!(out.len(), layout.encoded_len());
        assert_eq!(out.len(), 17);
        assert_ne!(u64::from_le_bytes(out[..8].try_into().unwrap()), 42);
        assert_eq!(split(&out), 42);
    }

    #[test]
    fn test_random_layouts_decode() {
        let mut rng = StdRng::seed_from_u64(8);
        for i in 0..500u64 {
            let layout = ImmLayout::random(&mut rng, i % 2 == 0);
            let value = i.wrapping_mul(0x9E37_79B9_7F4A_7C15);
            let mut out = Vec::new();
            layout.encode(value, &mut out);
            assert_eq!(out.len(), layout.encoded_len());
            assert_eq!(split(&out), value);
        }
    }
}
