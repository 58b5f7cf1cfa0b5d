//! VM instruction set and the per-build opcode assignment table.
//!
//! Logical opcodes never appear in a stream as fixed bytes. The table hands
//! each of them one to three byte values out of a seeded shuffle of the
//! whole byte space, so each build produces a different encoding and a
//! single opcode has several spellings within one build.

use rand::seq::SliceRandom;
use rand::Rng;
use rand::SeedableRng;

use crate::entropy::EntropySource;
use crate::BUILD_SEED;

/// Maximum number of alternate encodings per logical opcode.
pub const MAX_ENCODINGS: usize = 3;

/// Logical meaning of an instruction. The byte encoding is determined by
/// [`OpcodeTable`].
///
/// Binary operators pop `b` (top) then `a` and push `a op b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// No operation (touches decoy state only)
    Nop = 0,
    /// Push a 64-bit immediate
    PushImm,

    // ─── Arithmetic (wrapping u64) ───
    Add,
    Sub,
    Mul,
    /// Unsigned division, 0 on division by zero
    Div,
    /// Unsigned remainder, 0 on division by zero
    Mod,
    /// Two's complement negation
    Neg,

    // ─── Bitwise ───
    And,
    Or,
    Xor,
    Not,
    /// `a << (b & 63)`
    Shl,
    /// `a >> (b & 63)` (logical)
    Shr,
    /// `a.rotate_left(b & 63)`
    Rol,
    /// `a.rotate_right(b & 63)`
    Ror,

    // ─── Control flow ───
    /// Jump to an absolute byte target
    Jmp,
    /// Jump if the zero flag is set
    Jz,
    /// Jump if the zero flag is clear
    Jnz,
    /// Pop `b`, `a`; set ZF = (a == b), CF = (a < b)
    Cmp,

    // ─── Registers ───
    /// Push register `r`
    PushReg,
    /// Pop into register `r`
    PopReg,

    /// Stop execution
    Halt,

    // ─── Decoys (never touch real state) ───
    Junk,
    Shuffle,
    Morph,
    Fake,
}

/// Total number of logical opcodes.
pub const OP_COUNT: usize = 27;

/// Operand that follows an opcode byte in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    /// Encoded immediate (see [`imm`](super::imm))
    Imm,
    /// Encoded immediate holding an absolute byte offset
    Target,
    /// One register index byte
    Reg,
}

impl Op {
    /// All opcodes in definition order.
    pub const ALL: [Op; OP_COUNT] = [
        Op::Nop, Op::PushImm,
        Op::Add, Op::Sub, Op::Mul, Op::Div, Op::Mod, Op::Neg,
        Op::And, Op::Or, Op::Xor, Op::Not, Op::Shl, Op::Shr, Op::Rol, Op::Ror,
        Op::Jmp, Op::Jz, Op::Jnz, Op::Cmp,
        Op::PushReg, Op::PopReg,
        Op::Halt,
        Op::Junk, Op::Shuffle, Op::Morph, Op::Fake,
    ];

    /// Opcodes the builder scatters as noise.
    pub const DECOYS: [Op; 4] = [Op::Junk, Op::Shuffle, Op::Morph, Op::Fake];

    pub fn operand(self) -> OperandKind {
        match self {
            Op::PushImm => OperandKind::Imm,
            Op::Jmp | Op::Jz | Op::Jnz => OperandKind::Target,
            Op::PushReg | Op::PopReg => OperandKind::Reg,
            _ => OperandKind::None,
        }
    }

    pub fn is_decoy(self) -> bool {
        matches!(self, Op::Junk | Op::Shuffle | Op::Morph | Op::Fake)
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Op::Jmp | Op::Jz | Op::Jnz)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Nop => "nop",
            Op::PushImm => "push",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Mod => "mod",
            Op::Neg => "neg",
            Op::And => "and",
            Op::Or => "or",
            Op::Xor => "xor",
            Op::Not => "not",
            Op::Shl => "shl",
            Op::Shr => "shr",
            Op::Rol => "rol",
            Op::Ror => "ror",
            Op::Jmp => "jmp",
            Op::Jz => "jz",
            Op::Jnz => "jnz",
            Op::Cmp => "cmp",
            Op::PushReg => "pushr",
            Op::PopReg => "popr",
            Op::Halt => "halt",
            Op::Junk => "junk",
            Op::Shuffle => "shuffle",
            Op::Morph => "morph",
            Op::Fake => "fake",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Maps logical opcodes to disjoint sets of byte values.
/// Generated once per build from a seed and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeTable {
    /// logical Op index → its encodings (first `counts[i]` entries valid)
    encode: [[u8; MAX_ENCODINGS]; OP_COUNT],
    counts: [u8; OP_COUNT],
    /// encoded byte → logical Op (inverse)
    decode: [Option<Op>; 256],
}

impl OpcodeTable {
    /// Table for this build's [`BUILD_SEED`].
    pub fn for_build() -> Self {
        Self::from_seed(BUILD_SEED)
    }

    /// Generate a random opcode table from a seed.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        Self::from_rng(&mut rng)
    }

    /// Generate a random opcode table from an RNG.
    pub fn from_rng(rng: &mut impl Rng) -> Self {
        let mut available: Vec<u8> = (0..=255).collect();
        available.shuffle(rng);

        let mut encode = [[0u8; MAX_ENCODINGS]; OP_COUNT];
        let mut counts = [0u8; OP_COUNT];
        let mut decode = [None; 256];

        // Consecutive runs of the shuffle: disjoint by construction.
        let mut cursor = 0usize;
        for (i, op) in Op::ALL.iter().enumerate() {
            let n = rng.gen_range(1..=MAX_ENCODINGS);
            for slot in 0..n {
                let byte = available[cursor];
                cursor += 1;
                encode[i][slot] = byte;
                decode[byte as usize] = Some(*op);
            }
            counts[i] = n as u8;
        }

        OpcodeTable { encode, counts, decode }
    }

    /// Every valid encoding of `op`.
    pub fn encodings(&self, op: Op) -> &[u8] {
        let i = op as usize;
        &self.encode[i][..self.counts[i] as usize]
    }

    /// The first encoding of `op`.
    pub fn canonical(&self, op: Op) -> u8 {
        self.encode[op as usize][0]
    }

    /// One of `op`'s encodings, chosen at random.
    pub fn encoding_of<S: EntropySource + ?Sized>(&self, op: Op, src: &mut S) -> u8 {
        let encodings = self.encodings(op);
        encodings[src.below(encodings.len() as u64) as usize]
    }

    /// A random encoding of a random decoy opcode.
    pub fn decoy_encoding<S: EntropySource + ?Sized>(&self, src: &mut S) -> u8 {
        let op = Op::DECOYS[src.below(Op::DECOYS.len() as u64) as usize];
        self.encoding_of(op, src)
    }

    /// Recognize any valid encoding. `None` means the byte is noise.
    #[inline(always)]
    pub fn logical_of(&self, byte: u8) -> Option<Op> {
        self.decode[byte as usize]
    }

    pub fn is_decoy(&self, byte: u8) -> bool {
        self.logical_of(byte).is_some_and(Op::is_decoy)
    }

    /// Number of byte values that decode to nothing.
    pub fn unassigned_count(&self) -> usize {
        self.decode.iter().filter(|d| d.is_none()).count()
    }
}
