//! Scrambled stack VM interpreter.
//!
//! The interpreter never sees plaintext bytecode as a whole. It keeps one
//! decoder positioned at the instruction pointer and decrypts a byte at a
//! time; a backward jump restarts the decoder from offset 0. Recognized
//! opcodes go through a linear chain of equality tests rather than a
//! `match`, so no jump table names the handlers. The step counter lives
//! in a [`PolymorphicCell`] and the ceiling in a [`ScatteredCell`], so
//! neither sits in memory as a plain integer.
//!
//! Periodically an [`AnalysisProbe`] is polled. A positive answer does not
//! stop the run: garbage is pushed and a skew is applied to every fetched
//! opcode byte from then on, so the result silently goes wrong.

use std::sync::Arc;

use shroud_core::config::VmConfig;
use shroud_core::crypto::stream_cipher::StreamReader;
use shroud_core::entropy::{EntropySource, RuntimeEntropy};
use shroud_core::error::{Fault, VmError};
use shroud_core::mba::identity;
use shroud_core::vm::cell::{PolymorphicCell, ScatteredCell};
use shroud_core::vm::imm;
use shroud_core::vm::opcode::Op;
use shroud_core::vm::program::SealedProgram;
use tracing::{debug, trace, warn};

use crate::context::{VmContext, FLAG_CARRY, FLAG_ZERO};
use crate::fault::FaultCounts;
use crate::opaque;
use crate::probe::{AnalysisProbe, NoProbe};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A HALT instruction was executed.
    Halted,
    /// The instruction pointer ran off the end of the program.
    EndOfStream,
    /// The instruction ceiling was reached.
    BudgetExhausted,
}

/// Result of one run, with diagnostics.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Top of the stack at exit, 0 if empty.
    pub value: u64,
    pub outcome: Outcome,
    /// Instructions fetched, noise bytes included.
    pub steps: u64,
    /// Ceiling in effect for this run, jitter included.
    pub limit: u64,
    /// Number of times the probe fired.
    pub tamper_events: u32,
    pub faults: FaultCounts,
}

enum Flow {
    Continue,
    Halt,
    EndOfStream,
}

/// Executes a [`SealedProgram`].
///
/// Each call to [`run`](Self::run) starts from a fresh [`VmContext`]; no
/// state survives between runs.
pub struct Interpreter<E: EntropySource = RuntimeEntropy, P: AnalysisProbe = NoProbe> {
    program: SealedProgram,
    config: VmConfig,
    entropy: E,
    probe: P,
}

impl Interpreter {
    pub fn new(program: SealedProgram) -> Self {
        Self::with_config(program, VmConfig::default())
    }

    /// Falls back to [`VmConfig::default`] when `config` is invalid.
    pub fn with_config(program: SealedProgram, config: VmConfig) -> Self {
        Interpreter {
            program,
            config: config.sanitized(),
            entropy: RuntimeEntropy::new(),
            probe: NoProbe,
        }
    }
}

impl<E: EntropySource, P: AnalysisProbe> Interpreter<E, P> {
    pub fn with_entropy<E2: EntropySource>(self, entropy: E2) -> Interpreter<E2, P> {
        Interpreter {
            program: self.program,
            config: self.config,
            entropy,
            probe: self.probe,
        }
    }

    pub fn with_probe<P2: AnalysisProbe>(self, probe: P2) -> Interpreter<E, P2> {
        Interpreter {
            program: self.program,
            config: self.config,
            entropy: self.entropy,
            probe,
        }
    }

    pub fn program(&self) -> &SealedProgram {
        &self.program
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Run with all registers zero.
    pub fn execute(&mut self) -> u64 {
        self.run(&[]).value
    }

    /// Run with `inputs` loaded into r0..r7.
    pub fn execute_with(&mut self, inputs: &[u64]) -> u64 {
        self.run(inputs).value
    }

    /// Like [`execute_with`](Self::execute_with), but reports an exhausted
    /// instruction budget instead of returning whatever is on the stack.
    pub fn try_execute(&mut self, inputs: &[u64]) -> Result<u64, VmError> {
        let exec = self.run(inputs);
        match exec.outcome {
            Outcome::BudgetExhausted => Err(VmError::TimeoutExceeded { limit: exec.limit }),
            Outcome::Halted | Outcome::EndOfStream => Ok(exec.value),
        }
    }

    pub fn run(&mut self, inputs: &[u64]) -> Execution {
        let mut ctx = VmContext::new(&self.config, &mut self.entropy);
        ctx.load_inputs(inputs);

        let limit = self
            .config
            .max_instructions
            .saturating_add(self.entropy.below(self.config.budget_jitter));
        let (lo, hi) = (
            u64::from(*self.config.check_interval.start()),
            u64::from(*self.config.check_interval.end()),
        );
        let interval = (lo + self.entropy.below(hi.saturating_sub(lo) + 1)).max(1);

        debug!(len = self.program.len(), limit, interval, "vm run start");

        let table = Arc::clone(self.program.table());
        let mut reader = self.program.reader();
        let ceiling: ScatteredCell = ScatteredCell::new(limit, &mut self.entropy);
        let mut steps = PolymorphicCell::new(0u64, &mut self.entropy);
        let mut skew = 0u32;
        let mut tamper_events = 0u32;

        let outcome = loop {
            let done = steps.get();
            if done >= ceiling.get() {
                warn!(limit, "instruction budget exhausted");
                break Outcome::BudgetExhausted;
            }
            if done > 0 && done % interval == 0 && self.probe.analysis_detected() {
                tamper_events += 1;
                skew = 1 + self.entropy.below(7) as u32;
                ctx.push(self.entropy.entropy_u64());
                debug!(steps = done, "analysis probe fired");
            }

            reader.seek(ctx.ip());
            let Some(raw) = fetch(&mut reader, &mut ctx) else {
                break Outcome::EndOfStream;
            };
            steps.update(|n| n + 1);

            let byte = raw.rotate_left(skew);
            let flow = match table.logical_of(byte) {
                Some(op) => {
                    trace!(ip = ctx.ip() - 1, %op, "dispatch");
                    dispatch(op, &mut ctx, &mut reader)
                }
                None => {
                    let garbage = ctx.noise();
                    ctx.push(garbage);
                    ctx.record_fault(Fault::UnrecognizedOpcode);
                    Flow::Continue
                }
            };
            match flow {
                Flow::Continue => {}
                Flow::Halt => break Outcome::Halted,
                Flow::EndOfStream => break Outcome::EndOfStream,
            }
        };

        let steps = steps.get();
        let value = ctx.peek().unwrap_or(0);
        let faults = *ctx.faults();
        debug!(?outcome, steps, faults = faults.total(), "vm run stop");
        Execution {
            value,
            outcome,
            steps,
            limit,
            tamper_events,
            faults,
        }
    }
}

/// Next plaintext byte, advancing IP with it.
#[inline(always)]
fn fetch(reader: &mut StreamReader<'_>, ctx: &mut VmContext) -> Option<u8> {
    let byte = reader.next_byte()?;
    ctx.advance_ip(1);
    Some(byte)
}

fn fetch_imm(reader: &mut StreamReader<'_>, ctx: &mut VmContext) -> Option<u64> {
    let mut payload = [0u8; imm::PAYLOAD_LEN];
    for slot in &mut payload {
        *slot = fetch(reader, ctx)?;
    }
    let marker = fetch(reader, ctx)?;
    let mask = if imm::marker_is_masked(marker) {
        let mut mask = [0u8; imm::PAYLOAD_LEN];
        for slot in &mut mask {
            *slot = fetch(reader, ctx)?;
        }
        Some(mask)
    } else {
        None
    };
    Some(imm::decode(payload, marker, mask))
}

/// Pop `b`, then `a`, push `f(a, b)` and set ZF/SF from it.
#[inline(always)]
fn binary(ctx: &mut VmContext, f: impl FnOnce(&mut VmContext, u64, u64) -> u64) {
    let b = ctx.pop();
    let a = ctx.pop();
    let r = f(ctx, a, b);
    ctx.set_result_flags(r);
    ctx.push(r);
}

#[inline(always)]
fn unary(ctx: &mut VmContext, f: impl FnOnce(u64) -> u64) {
    let r = f(ctx.pop());
    ctx.set_result_flags(r);
    ctx.push(r);
}

fn jump_to(ctx: &mut VmContext, target: u64, taken: bool) {
    if taken {
        ctx.set_ip(usize::try_from(target).unwrap_or(usize::MAX));
    } else {
        ctx.touch_decoys();
    }
}

/// Execute one recognized opcode. Deliberately a chain of comparisons.
fn dispatch(op: Op, ctx: &mut VmContext, reader: &mut StreamReader<'_>) -> Flow {
    if op == Op::PushImm {
        let Some(value) = fetch_imm(reader, ctx) else {
            return Flow::EndOfStream;
        };
        ctx.push(value);
    } else if op == Op::Xor {
        binary(ctx, |_, a, b| identity::xor(a, b));
    } else if op == Op::Junk {
        let v = ctx.noise();
        ctx.decoy_push(v);
        let w = ctx.decoy_pop();
        ctx.decoy_push(w.rotate_left(13) ^ v);
    } else if op == Op::Add {
        binary(ctx, |c, a, b| identity::add(a, b, c.noise()));
    } else if op == Op::Jnz {
        let Some(target) = fetch_imm(reader, ctx) else {
            return Flow::EndOfStream;
        };
        let taken = !ctx.flag(FLAG_ZERO);
        jump_to(ctx, target, taken);
    } else if op == Op::Sub {
        binary(ctx, |_, a, b| identity::sub(a, b));
    } else if op == Op::PushReg {
        let Some(r) = fetch(reader, ctx) else {
            return Flow::EndOfStream;
        };
        let v = ctx.get_reg(usize::from(r));
        ctx.push(v);
    } else if op == Op::Mul {
        binary(ctx, |_, a, b| match (a, b) {
            (x, 2) | (2, x) => identity::mul2(x),
            _ => a.wrapping_mul(b),
        });
    } else if op == Op::Shuffle {
        ctx.scramble_decoys();
    } else if op == Op::And {
        binary(ctx, |_, a, b| identity::and(a, b));
    } else if op == Op::Halt {
        return Flow::Halt;
    } else if op == Op::Or {
        binary(ctx, |_, a, b| identity::or(a, b));
    } else if op == Op::Jz {
        let Some(target) = fetch_imm(reader, ctx) else {
            return Flow::EndOfStream;
        };
        let taken = ctx.flag(FLAG_ZERO);
        jump_to(ctx, target, taken);
    } else if op == Op::Div {
        binary(ctx, |c, a, b| {
            a.checked_div(b).unwrap_or_else(|| {
                c.record_fault(Fault::DivisionByZero);
                0
            })
        });
    } else if op == Op::PopReg {
        let Some(r) = fetch(reader, ctx) else {
            return Flow::EndOfStream;
        };
        let v = ctx.pop();
        ctx.set_reg(usize::from(r), v);
    } else if op == Op::Mod {
        binary(ctx, |c, a, b| {
            a.checked_rem(b).unwrap_or_else(|| {
                c.record_fault(Fault::ModuloByZero);
                0
            })
        });
    } else if op == Op::Morph {
        let selector = ctx.noise();
        ctx.rekey(selector);
    } else if op == Op::Neg {
        unary(ctx, identity::neg);
    } else if op == Op::Not {
        unary(ctx, |a| !a);
    } else if op == Op::Cmp {
        let b = ctx.pop();
        let a = ctx.pop();
        let mut flags = 0;
        if a == b {
            flags |= FLAG_ZERO;
        }
        if a < b {
            flags |= FLAG_CARRY;
        }
        ctx.set_flags(flags);
    } else if op == Op::Shl {
        binary(ctx, |_, a, b| a << (b & 63));
    } else if op == Op::Fake {
        let w = ctx.noise();
        if opaque::always_true(w) {
            let x = ctx.decoy_pop();
            let y = ctx.decoy_pop();
            ctx.decoy_push(identity::add(x, y, w));
            ctx.decoy_push(x ^ w);
        } else {
            ctx.push(w);
        }
    } else if op == Op::Shr {
        binary(ctx, |_, a, b| a >> (b & 63));
    } else if op == Op::Jmp {
        let Some(target) = fetch_imm(reader, ctx) else {
            return Flow::EndOfStream;
        };
        jump_to(ctx, target, true);
    } else if op == Op::Rol {
        binary(ctx, |_, a, b| a.rotate_left((b & 63) as u32));
    } else if op == Op::Ror {
        binary(ctx, |_, a, b| a.rotate_right((b & 63) as u32));
    } else if op == Op::Nop {
        ctx.touch_decoys();
    }
    Flow::Continue
}
