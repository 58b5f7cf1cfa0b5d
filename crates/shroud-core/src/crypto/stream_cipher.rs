//! Three-layer chained byte cipher for sealed bytecode.
//!
//! This is NOT a cryptographically secure cipher. Its purpose is to keep
//! opcode bytes and immediates out of reach of a plain hex dump and to make
//! patching expensive:
//!
//! 1. XOR with a rolling key that rotates and absorbs both the byte index
//!    and the previous plaintext byte.
//! 2. Per-position bit rotation keyed by the position modulo a small prime.
//! 3. XOR with the previous ciphertext byte, so a single patched byte
//!    desynchronizes everything after it.
//!
//! Decoding undoes the layers in reverse order and must walk the buffer
//! strictly in order. [`StreamReader`] provides that walk over a sealed
//! buffer, including seeking (backward seeks restart from the beginning).

use crate::entropy::{splitmix64, EntropySource};

/// Modulus for the layer-2 rotation schedule.
const ROTATION_PRIME: usize = 7;

/// Key material for one sealed program.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CipherKey {
    rolling: u64,
    rotation: u8,
    chain_iv: u8,
}

impl CipherKey {
    /// Derive all three layer keys from one 64-bit seed.
    pub fn from_seed(seed: u64) -> Self {
        let rolling = splitmix64(seed);
        let aux = splitmix64(rolling ^ seed.rotate_left(29));
        CipherKey {
            rolling,
            rotation: (aux & 0x07) as u8,
            chain_iv: (aux >> 8) as u8,
        }
    }

    /// Fresh key drawn from an entropy source.
    pub fn random<S: EntropySource + ?Sized>(src: &mut S) -> Self {
        Self::from_seed(src.entropy_u64())
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey { .. }")
    }
}

#[inline(always)]
fn rotation_at(pos: usize, key: u8) -> u32 {
    ((pos % ROTATION_PRIME) as u32 + key as u32) % 8
}

#[inline(always)]
fn roll(key: u64, pos: usize, plain: u8) -> u64 {
    (key.rotate_left(7) ^ pos as u64).wrapping_add(plain as u64)
}

/// Incremental encryptor. Feed plaintext bytes in order.
#[derive(Debug, Clone)]
pub struct Encoder {
    key: u64,
    rotation: u8,
    prev: u8,
    pos: usize,
}

impl Encoder {
    pub fn new(key: &CipherKey) -> Self {
        Encoder {
            key: key.rolling,
            rotation: key.rotation,
            prev: key.chain_iv,
            pos: 0,
        }
    }

    pub fn encrypt_byte(&mut self, plain: u8) -> u8 {
        let l1 = plain ^ self.key as u8;
        let l2 = l1.rotate_left(rotation_at(self.pos, self.rotation));
        let l3 = l2 ^ self.prev;

        self.key = roll(self.key, self.pos, plain);
        self.prev = l3;
        self.pos += 1;
        l3
    }
}

/// Incremental decryptor. Feed ciphertext bytes in order.
#[derive(Debug, Clone)]
pub struct Decoder {
    key: u64,
    rotation: u8,
    prev: u8,
    pos: usize,
}

impl Decoder {
    pub fn new(key: &CipherKey) -> Self {
        Decoder {
            key: key.rolling,
            rotation: key.rotation,
            prev: key.chain_iv,
            pos: 0,
        }
    }

    pub fn decrypt_byte(&mut self, cipher: u8) -> u8 {
        let l2 = cipher ^ self.prev;
        let l1 = l2.rotate_right(rotation_at(self.pos, self.rotation));
        let plain = l1 ^ self.key as u8;

        self.key = roll(self.key, self.pos, plain);
        self.prev = cipher;
        self.pos += 1;
        plain
    }

    /// Number of bytes decrypted so far.
    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Encrypt a whole buffer.
pub fn encrypt(plain: &[u8], key: &CipherKey) -> Vec<u8> {
    let mut enc = Encoder::new(key);
    plain.iter().map(|&b| enc.encrypt_byte(b)).collect()
}

/// Decrypt a whole buffer.
pub fn decrypt(cipher: &[u8], key: &CipherKey) -> Vec<u8> {
    let mut dec = Decoder::new(key);
    cipher.iter().map(|&b| dec.decrypt_byte(b)).collect()
}

/// Sequential, seekable view over an encrypted buffer. Only the decoder
/// state is kept; no plaintext is buffered.
#[derive(Debug, Clone)]
pub struct StreamReader<'a> {
    bytes: &'a [u8],
    key: CipherKey,
    decoder: Decoder,
}

impl<'a> StreamReader<'a> {
    pub fn new(bytes: &'a [u8], key: CipherKey) -> Self {
        StreamReader {
            bytes,
            key,
            decoder: Decoder::new(&key),
        }
    }

    /// Offset of the next byte [`next_byte`](Self::next_byte) returns.
    pub fn position(&self) -> usize {
        self.decoder.position()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decrypt the next byte, or `None` at the end of the buffer.
    pub fn next_byte(&mut self) -> Option<u8> {
        let c = *self.bytes.get(self.decoder.position())?;
        Some(self.decoder.decrypt_byte(c))
    }

    /// Move to `target`. Seeking backwards restarts the chain from offset
    /// 0; seeking past the end stops at the end.
    pub fn seek(&mut self, target: usize) {
        if target < self.decoder.position() {
            self.decoder = Decoder::new(&self.key);
        }
        while self.decoder.position() < target {
            if self.next_byte().is_none() {
                break;
            }
        }
    }
}
