//! Fluent bytecode builder.
//!
//! Each emitted operation becomes a *unit*: the opcode byte (one of its
//! alternate encodings), its operand, and whatever decoy bytes the
//! configuration mixes around it. Units stay structured until
//! [`Builder::finalize`] so that jumps, which are written as offsets in
//! logical instructions, can be resolved to absolute byte targets after
//! all noise has been inserted.

use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use super::imm::ImmLayout;
use super::opcode::{Op, OpcodeTable, OperandKind};
use super::program::SealedProgram;
use crate::config::BuilderConfig;
use crate::crypto::stream_cipher::{self, CipherKey};
use crate::entropy::{EntropySource, RuntimeEntropy};

#[derive(Debug, Clone, Copy)]
enum Piece {
    Byte(u8),
    Imm(u64, ImmLayout),
    /// Jump target, `offset` logical instructions after the next one.
    Target { layout: ImmLayout, offset: i32 },
}

impl Piece {
    fn encoded_len(&self) -> usize {
        match self {
            Piece::Byte(_) => 1,
            Piece::Imm(_, layout) | Piece::Target { layout, .. } => layout.encoded_len(),
        }
    }
}

#[derive(Debug, Clone)]
struct Unit {
    op: Op,
    pieces: Vec<Piece>,
    /// Close with a trailing decoy byte (junk+real+junk).
    trailing_decoy: bool,
}

impl Unit {
    fn new(op: Op) -> Self {
        Unit { op, pieces: Vec::with_capacity(4), trailing_decoy: false }
    }

    fn encoded_len(&self) -> usize {
        self.pieces.iter().map(Piece::encoded_len).sum()
    }

    fn has_imm(&self) -> bool {
        self.pieces.iter().any(|p| matches!(p, Piece::Imm(..)))
    }
}

/// Builds a [`SealedProgram`] one stack operation at a time.
///
/// ```ignore
/// let mut b = Builder::new(table, RuntimeEntropy::new());
/// b.push_imm(6).push_imm(7).mul();
/// let program = b.finalize();
/// ```
pub struct Builder<E: EntropySource = RuntimeEntropy> {
    table: Arc<OpcodeTable>,
    entropy: E,
    config: BuilderConfig,
    /// Independent stream the interleaved decoy bytes are drawn from.
    shadow: ChaCha8Rng,
    units: Vec<Unit>,
    open: Option<Unit>,
}

impl<E: EntropySource> Builder<E> {
    pub fn new(table: Arc<OpcodeTable>, entropy: E) -> Self {
        Self::with_config(table, entropy, BuilderConfig::default())
    }

    pub fn with_config(table: Arc<OpcodeTable>, mut entropy: E, config: BuilderConfig) -> Self {
        let shadow = ChaCha8Rng::seed_from_u64(entropy.entropy_u64());
        Builder {
            table,
            entropy,
            config: config.sanitized(),
            shadow,
            units: Vec::new(),
            open: None,
        }
    }

    pub fn table(&self) -> &Arc<OpcodeTable> {
        &self.table
    }

    /// Logical instructions emitted so far. A morphed instruction counts
    /// once.
    pub fn instruction_count(&self) -> usize {
        self.units.len() + usize::from(self.open.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.instruction_count() == 0
    }

    // ─── Generic emission ───

    /// Emit one instruction without its operand.
    pub fn emit(&mut self, op: Op) -> &mut Self {
        self.close_open();

        let mut unit = Unit::new(op);
        let triple = self.entropy.chance(self.config.triple_percent);
        if triple || self.entropy.chance(self.config.junk_percent) {
            let decoy = self.table.decoy_encoding(&mut self.entropy);
            unit.pieces.push(Piece::Byte(decoy));
        }
        unit.trailing_decoy = triple;

        if self.entropy.chance(self.config.morph_percent) {
            self.push_morph(&mut unit);
        } else {
            let byte = self.table.encoding_of(op, &mut self.entropy);
            unit.pieces.push(Piece::Byte(byte));
        }

        self.open = Some(unit);
        self
    }

    /// Append an immediate to the instruction emitted last. When that
    /// instruction takes no immediate, or already has one, a PUSH_IMM is
    /// emitted to carry it.
    pub fn emit_imm(&mut self, value: u64) -> &mut Self {
        let awaits_imm = self
            .open
            .as_ref()
            .is_some_and(|unit| unit.op.operand() == OperandKind::Imm && !unit.has_imm());
        if !awaits_imm {
            self.emit(Op::PushImm);
        }
        let piece = Piece::Imm(value, self.imm_layout());
        if let Some(unit) = self.open.as_mut() {
            unit.pieces.push(piece);
        }
        self
    }

    // ─── Stack and arithmetic ───

    pub fn push_imm(&mut self, value: u64) -> &mut Self {
        self.emit(Op::PushImm).emit_imm(value)
    }

    pub fn add(&mut self) -> &mut Self {
        self.emit(Op::Add)
    }

    pub fn sub(&mut self) -> &mut Self {
        self.emit(Op::Sub)
    }

    pub fn mul(&mut self) -> &mut Self {
        self.emit(Op::Mul)
    }

    pub fn div(&mut self) -> &mut Self {
        self.emit(Op::Div)
    }

    pub fn modulo(&mut self) -> &mut Self {
        self.emit(Op::Mod)
    }

    pub fn neg(&mut self) -> &mut Self {
        self.emit(Op::Neg)
    }

    pub fn and(&mut self) -> &mut Self {
        self.emit(Op::And)
    }

    pub fn or(&mut self) -> &mut Self {
        self.emit(Op::Or)
    }

    pub fn xor(&mut self) -> &mut Self {
        self.emit(Op::Xor)
    }

    pub fn not(&mut self) -> &mut Self {
        self.emit(Op::Not)
    }

    pub fn shl(&mut self) -> &mut Self {
        self.emit(Op::Shl)
    }

    pub fn shr(&mut self) -> &mut Self {
        self.emit(Op::Shr)
    }

    pub fn rol(&mut self) -> &mut Self {
        self.emit(Op::Rol)
    }

    pub fn ror(&mut self) -> &mut Self {
        self.emit(Op::Ror)
    }

    pub fn cmp(&mut self) -> &mut Self {
        self.emit(Op::Cmp)
    }

    // ─── Control flow ───
    //
    // `offset` counts logical instructions from the one after the jump:
    // 0 falls through, -1 jumps to itself.

    pub fn jmp(&mut self, offset: i32) -> &mut Self {
        self.jump(Op::Jmp, offset)
    }

    pub fn jz(&mut self, offset: i32) -> &mut Self {
        self.jump(Op::Jz, offset)
    }

    pub fn jnz(&mut self, offset: i32) -> &mut Self {
        self.jump(Op::Jnz, offset)
    }

    fn jump(&mut self, op: Op, offset: i32) -> &mut Self {
        self.emit(op);
        let layout = self.imm_layout();
        if let Some(unit) = self.open.as_mut() {
            unit.pieces.push(Piece::Target { layout, offset });
        }
        self
    }

    // ─── Registers ───

    pub fn push_reg(&mut self, idx: u8) -> &mut Self {
        self.emit(Op::PushReg).reg_operand(idx)
    }

    pub fn pop_reg(&mut self, idx: u8) -> &mut Self {
        self.emit(Op::PopReg).reg_operand(idx)
    }

    /// Register index in the low 3 bits, noise above.
    fn reg_operand(&mut self, idx: u8) -> &mut Self {
        let byte = (idx & 0x07) | (self.entropy.byte() & 0xF8);
        if let Some(unit) = self.open.as_mut() {
            unit.pieces.push(Piece::Byte(byte));
        }
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.emit(Op::Nop)
    }

    pub fn halt(&mut self) -> &mut Self {
        self.emit(Op::Halt)
    }

    // ─── Sealing ───

    /// Resolve jumps, pad, encrypt and hand over the program.
    pub fn finalize(mut self) -> SealedProgram {
        self.close_open();
        if self.units.last().map(|u| u.op) != Some(Op::Halt) {
            self.emit(Op::Halt);
            self.close_open();
        }

        let mut interleaved = 0usize;
        for unit in &mut self.units {
            if self.entropy.chance(self.config.interleave_percent) {
                let decoy = self.table.decoy_encoding(&mut self.shadow);
                unit.pieces.insert(0, Piece::Byte(decoy));
                interleaved += 1;
            }
        }

        let mut starts = Vec::with_capacity(self.units.len());
        let mut code_len = 0usize;
        for unit in &self.units {
            starts.push(code_len);
            code_len += unit.encoded_len();
        }

        let last = self.units.len() as i64 - 1;
        let mut plain = Vec::with_capacity(code_len + *self.config.padding.end());
        for (i, unit) in self.units.iter().enumerate() {
            for piece in &unit.pieces {
                match *piece {
                    Piece::Byte(b) => plain.push(b),
                    Piece::Imm(value, layout) => layout.encode(value, &mut plain),
                    Piece::Target { layout, offset } => {
                        let target = (i as i64 + 1 + i64::from(offset)).clamp(0, last);
                        layout.encode(starts[target as usize] as u64, &mut plain);
                    }
                }
            }
        }

        let (lo, hi) = (*self.config.padding.start(), *self.config.padding.end());
        let padding = if hi > lo {
            lo + self.entropy.below((hi - lo).saturating_add(1) as u64) as usize
        } else {
            lo
        };
        for _ in 0..padding {
            plain.push(self.entropy.byte());
        }

        let key = CipherKey::random(&mut self.entropy);
        let bytes = stream_cipher::encrypt(&plain, &key);
        debug!(
            instructions = self.units.len(),
            interleaved,
            code_len,
            padding,
            total = bytes.len(),
            "sealed program"
        );
        SealedProgram::from_parts(bytes, key, self.table, code_len)
    }

    // ─── Internals ───

    fn close_open(&mut self) {
        if let Some(mut unit) = self.open.take() {
            if unit.trailing_decoy {
                let decoy = self.table.decoy_encoding(&mut self.entropy);
                unit.pieces.push(Piece::Byte(decoy));
            }
            self.units.push(unit);
        }
    }

    fn imm_layout(&mut self) -> ImmLayout {
        ImmLayout::random(&mut self.entropy, self.config.mask_immediates)
    }

    /// Replace `unit.op` by an equivalent sequence, if it has one.
    fn push_morph(&mut self, unit: &mut Unit) {
        let table = Arc::clone(&self.table);
        let op = |b: Op, e: &mut E| Piece::Byte(table.encoding_of(b, e));
        match unit.op {
            // a - b == a + (-b)
            Op::Sub => {
                unit.pieces.push(op(Op::Neg, &mut self.entropy));
                unit.pieces.push(op(Op::Add, &mut self.entropy));
            }
            // !a == a ^ !0
            Op::Not => {
                unit.pieces.push(op(Op::PushImm, &mut self.entropy));
                unit.pieces.push(Piece::Imm(!0, self.imm_layout()));
                unit.pieces.push(op(Op::Xor, &mut self.entropy));
            }
            // -a == !a + 1
            Op::Neg => {
                unit.pieces.push(op(Op::Not, &mut self.entropy));
                unit.pieces.push(op(Op::PushImm, &mut self.entropy));
                unit.pieces.push(Piece::Imm(1, self.imm_layout()));
                unit.pieces.push(op(Op::Add, &mut self.entropy));
            }
            other => unit.pieces.push(op(other, &mut self.entropy)),
        }
    }
}
