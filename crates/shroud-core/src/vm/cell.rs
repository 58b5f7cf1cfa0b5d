//! Obfuscated value cells.
//!
//! An [`ObfCell`] never holds its payload in plaintext. Integral payloads go
//! through an MBA addition, an XOR and a rotation, each with its own key;
//! floating payloads XOR their bit pattern. The VM uses cells for every
//! register, stack slot, pointer and flag word.
//!
//! Two variants hide values the interpreter keeps per run:
//! [`ScatteredCell`] spreads a `u64` over separate heap chunks, and
//! [`PolymorphicCell`] rekeys itself as it is used.

use std::fmt;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::entropy::EntropySource;
use crate::mba::MbaWord;

/// A scalar that can be stored under a reversible keyed transform.
pub trait Scramble: Copy {
    type Key: Copy;

    fn draw_key<S: EntropySource + ?Sized>(src: &mut S) -> Self::Key;
    fn scramble(self, key: &Self::Key) -> Self;
    fn unscramble(self, key: &Self::Key) -> Self;
}

/// Key triple for integral payloads.
#[derive(Clone, Copy)]
pub struct IntKey<T> {
    add: T,
    xor: T,
    rot: u32,
}

macro_rules! scramble_int {
    ($($t:ty),* $(,)?) => {$(
        impl Scramble for $t {
            type Key = IntKey<$t>;

            fn draw_key<S: EntropySource + ?Sized>(src: &mut S) -> IntKey<$t> {
                IntKey {
                    add: src.entropy_u64() as $t,
                    xor: src.entropy_u64() as $t,
                    rot: src.below(u64::from(<$t>::BITS)) as u32,
                }
            }

            #[inline(always)]
            fn scramble(self, key: &IntKey<$t>) -> Self {
                (self.mba_add(key.add) ^ key.xor).rotate_left(key.rot)
            }

            #[inline(always)]
            fn unscramble(self, key: &IntKey<$t>) -> Self {
                (self.rotate_right(key.rot) ^ key.xor).mba_sub(key.add)
            }
        }
    )*};
}

scramble_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl Scramble for f64 {
    type Key = u64;

    fn draw_key<S: EntropySource + ?Sized>(src: &mut S) -> u64 {
        src.entropy_u64()
    }

    fn scramble(self, key: &u64) -> Self {
        f64::from_bits(self.to_bits() ^ key)
    }

    fn unscramble(self, key: &u64) -> Self {
        f64::from_bits(self.to_bits() ^ key)
    }
}

impl Scramble for f32 {
    type Key = u32;

    fn draw_key<S: EntropySource + ?Sized>(src: &mut S) -> u32 {
        src.entropy_u64() as u32
    }

    fn scramble(self, key: &u32) -> Self {
        f32::from_bits(self.to_bits() ^ key)
    }

    fn unscramble(self, key: &u32) -> Self {
        f32::from_bits(self.to_bits() ^ key)
    }
}

/// A value stored under a keyed transform.
///
/// `get` after `set(v)` returns `v` for as long as the key is unchanged;
/// [`rekey`](Self::rekey) swaps the key and re-encodes the payload.
#[derive(Clone)]
pub struct ObfCell<T: Scramble> {
    stored: T,
    key: T::Key,
}

impl<T: Scramble> ObfCell<T> {
    pub fn new<S: EntropySource + ?Sized>(value: T, src: &mut S) -> Self {
        let key = T::draw_key(src);
        ObfCell {
            stored: value.scramble(&key),
            key,
        }
    }

    #[inline(always)]
    pub fn get(&self) -> T {
        self.stored.unscramble(&self.key)
    }

    #[inline(always)]
    pub fn set(&mut self, value: T) {
        self.stored = value.scramble(&self.key);
    }

    /// Store `value`, returning the previous payload.
    pub fn replace(&mut self, value: T) -> T {
        let old = self.get();
        self.set(value);
        old
    }

    /// Apply `f` to the payload and return the new value.
    pub fn update(&mut self, f: impl FnOnce(T) -> T) -> T {
        let value = f(self.get());
        self.set(value);
        value
    }

    /// Draw a new key, keeping the payload.
    pub fn rekey<S: EntropySource + ?Sized>(&mut self, src: &mut S) {
        let value = self.get();
        self.key = T::draw_key(src);
        self.set(value);
    }

    /// The representation held in memory.
    pub fn stored(&self) -> T {
        self.stored
    }
}

impl<T: Scramble> fmt::Debug for ObfCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ObfCell { .. }")
    }
}

struct Chunk {
    data: Box<[u8]>,
    key: u8,
}

/// A `u64` whose bytes are spread over `N` separately allocated chunks,
/// each XORed with its own key byte. `N` must be in `2..=8`.
pub struct ScatteredCell<const N: usize = 4> {
    chunks: [Chunk; N],
}

impl<const N: usize> ScatteredCell<N> {
    const CHUNKS_FIT: () = assert!(N >= 2 && N <= 8, "a u64 splits into 2..=8 chunks");

    pub fn new<S: EntropySource + ?Sized>(value: u64, src: &mut S) -> Self {
        let () = Self::CHUNKS_FIT;
        ScatteredCell {
            chunks: Self::scatter(value, src),
        }
    }

    fn scatter<S: EntropySource + ?Sized>(value: u64, src: &mut S) -> [Chunk; N] {
        let bytes = value.to_le_bytes();
        let (per, extra) = (bytes.len() / N, bytes.len() % N);
        let mut at = 0;
        std::array::from_fn(|i| {
            let len = per + usize::from(i < extra);
            let key = src.byte();
            let data = bytes[at..at + len].iter().map(|b| b ^ key).collect();
            at += len;
            Chunk { data, key }
        })
    }

    pub fn get(&self) -> u64 {
        let mut bytes = [0u8; 8];
        let plain = self
            .chunks
            .iter()
            .flat_map(|chunk| chunk.data.iter().map(move |b| b ^ chunk.key));
        for (slot, b) in bytes.iter_mut().zip(plain) {
            *slot = b;
        }
        u64::from_le_bytes(bytes)
    }

    /// Store `value` in fresh chunks under fresh keys.
    pub fn set<S: EntropySource + ?Sized>(&mut self, value: u64, src: &mut S) {
        self.chunks = Self::scatter(value, src);
    }

    /// Chunk lengths, in byte order.
    pub fn chunk_lens(&self) -> [usize; N] {
        std::array::from_fn(|i| self.chunks[i].data.len())
    }
}

impl<const N: usize> fmt::Debug for ScatteredCell<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScatteredCell { .. }")
    }
}

/// An [`ObfCell`] that draws a new key every 16 to 128 accesses, so the
/// stored representation drifts while the value stays put.
pub struct PolymorphicCell<T: Scramble> {
    cell: ObfCell<T>,
    rng: ChaCha8Rng,
    accesses: u32,
    period: u32,
    mutations: u32,
}

impl<T: Scramble> PolymorphicCell<T> {
    pub fn new<S: EntropySource + ?Sized>(value: T, src: &mut S) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(src.entropy_u64());
        let cell = ObfCell::new(value, &mut rng);
        let period = draw_period(&mut rng);
        PolymorphicCell {
            cell,
            rng,
            accesses: 0,
            period,
            mutations: 0,
        }
    }

    pub fn get(&mut self) -> T {
        self.touch();
        self.cell.get()
    }

    pub fn set(&mut self, value: T) {
        self.cell.set(value);
        self.touch();
    }

    /// Apply `f` to the payload and return the new value.
    pub fn update(&mut self, f: impl FnOnce(T) -> T) -> T {
        let value = self.cell.update(f);
        self.touch();
        value
    }

    /// Times the cell has rekeyed itself.
    pub fn mutations(&self) -> u32 {
        self.mutations
    }

    pub fn stored(&self) -> T {
        self.cell.stored()
    }

    fn touch(&mut self) {
        self.accesses += 1;
        if self.accesses >= self.period {
            self.accesses = 0;
            self.period = draw_period(&mut self.rng);
            self.cell.rekey(&mut self.rng);
            self.mutations = self.mutations.wrapping_add(1);
        }
    }
}

fn draw_period(rng: &mut ChaCha8Rng) -> u32 {
    16 + rng.below(113) as u32
}

impl<T: Scramble> fmt::Debug for PolymorphicCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolymorphicCell")
            .field("mutations", &self.mutations)
            .finish_non_exhaustive()
    }
}
