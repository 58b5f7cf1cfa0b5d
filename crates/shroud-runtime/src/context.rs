//! VM machine state.
//!
//! Every real value (registers, stack slots, stack pointer, instruction
//! pointer, flags) lives in an [`ObfCell`]. Each of them has a decoy
//! counterpart that is written on every real write and read on every real
//! read, so a memory trace shows twice the traffic with no indication of
//! which half matters.

use std::hint::black_box;

use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use shroud_core::config::VmConfig;
use shroud_core::entropy::EntropySource;
use shroud_core::error::Fault;
use shroud_core::vm::cell::ObfCell;

use crate::fault::FaultCounts;

/// Number of general-purpose registers.
pub const NUM_REGS: usize = 8;

/// Set when the last ALU result was zero, or CMP saw equal operands.
pub const FLAG_ZERO: u64 = 1 << 0;
/// Set by CMP when `a < b` (unsigned).
pub const FLAG_CARRY: u64 = 1 << 1;
/// Top bit of the last ALU result.
pub const FLAG_SIGN: u64 = 1 << 2;

/// Chance (percent) that a push also reshuffles the decoy stack.
const DECOY_SHUFFLE_PERCENT: u8 = 3;

pub struct VmContext {
    regs: [ObfCell<u64>; NUM_REGS],
    shadow_regs: [ObfCell<u64>; NUM_REGS],

    stack: Vec<ObfCell<u64>>,
    sp: ObfCell<usize>,
    decoy_stack: Vec<u64>,
    decoy_sp: usize,

    ip: ObfCell<usize>,
    shadow_ip: ObfCell<usize>,

    flags: ObfCell<u64>,
    decoy_flags: ObfCell<u64>,

    noise: ChaCha8Rng,
    faults: FaultCounts,
}

impl VmContext {
    pub fn new<S: EntropySource + ?Sized>(config: &VmConfig, entropy: &mut S) -> Self {
        let mut noise = ChaCha8Rng::seed_from_u64(entropy.entropy_u64());

        let regs = std::array::from_fn(|_| ObfCell::new(0u64, &mut noise));
        let shadow_regs = std::array::from_fn(|_| {
            let v = noise.next_u64();
            ObfCell::new(v, &mut noise)
        });
        let stack = (0..config.stack_capacity)
            .map(|_| ObfCell::new(0u64, &mut noise))
            .collect();
        let decoy_stack = (0..config.decoy_stack_capacity.max(1))
            .map(|_| noise.next_u64())
            .collect();

        VmContext {
            regs,
            shadow_regs,
            stack,
            sp: ObfCell::new(0, &mut noise),
            decoy_stack,
            decoy_sp: 0,
            ip: ObfCell::new(0, &mut noise),
            shadow_ip: ObfCell::new(0, &mut noise),
            flags: ObfCell::new(0, &mut noise),
            decoy_flags: ObfCell::new(!0, &mut noise),
            noise,
            faults: FaultCounts::default(),
        }
    }

    // ─── Stack ───

    /// Push, dropping the value on overflow.
    pub fn push(&mut self, value: u64) {
        if let Err(fault) = self.try_push(value) {
            self.faults.record(fault);
        }
    }

    /// Pop, yielding 0 on underflow.
    pub fn pop(&mut self) -> u64 {
        self.try_pop().unwrap_or_else(|fault| {
            self.faults.record(fault);
            0
        })
    }

    pub fn try_push(&mut self, value: u64) -> Result<(), Fault> {
        let masked = value ^ self.noise.next_u64();
        self.decoy_push(masked);
        if self.noise.chance(DECOY_SHUFFLE_PERCENT) {
            self.scramble_decoys();
        }

        let sp = self.sp.get();
        let slot = self.stack.get_mut(sp).ok_or(Fault::StackOverflow)?;
        slot.set(value);
        self.sp.set(sp + 1);
        Ok(())
    }

    pub fn try_pop(&mut self) -> Result<u64, Fault> {
        black_box(self.decoy_pop());

        let sp = self.sp.get().checked_sub(1).ok_or(Fault::StackUnderflow)?;
        let slot = self.stack.get_mut(sp).ok_or(Fault::StackUnderflow)?;
        let value = slot.replace(self.noise.next_u64());
        self.sp.set(sp);
        Ok(value)
    }

    /// Top of the real stack.
    pub fn peek(&self) -> Option<u64> {
        black_box(self.decoy_stack.get(self.decoy_sp));
        let sp = self.sp.get().checked_sub(1)?;
        self.stack.get(sp).map(ObfCell::get)
    }

    pub fn depth(&self) -> usize {
        black_box(self.decoy_stack.get(self.decoy_sp));
        self.sp.get()
    }

    pub fn stack_capacity(&self) -> usize {
        self.stack.len()
    }

    // ─── Registers ───

    pub fn get_reg(&self, idx: usize) -> u64 {
        let idx = idx % NUM_REGS;
        black_box(self.shadow_regs[idx].get());
        self.regs[idx].get()
    }

    pub fn set_reg(&mut self, idx: usize, value: u64) {
        let idx = idx % NUM_REGS;
        let decoy = value ^ self.noise.next_u64();
        self.shadow_regs[idx].set(decoy);
        self.regs[idx].set(value);
    }

    /// Copy `inputs` into r0, r1, ... Extra inputs are ignored.
    pub fn load_inputs(&mut self, inputs: &[u64]) {
        for (idx, &value) in inputs.iter().take(NUM_REGS).enumerate() {
            self.set_reg(idx, value);
        }
    }

    // ─── Instruction pointer ───

    pub fn ip(&self) -> usize {
        black_box(self.shadow_ip.get());
        self.ip.get()
    }

    pub fn set_ip(&mut self, ip: usize) {
        let drift = self.noise.next_u64() as usize & 0xFF;
        self.shadow_ip.set(ip.wrapping_add(drift));
        self.ip.set(ip);
    }

    pub fn advance_ip(&mut self, n: usize) {
        let ip = self.ip.get().wrapping_add(n);
        self.set_ip(ip);
    }

    // ─── Flags ───

    pub fn flags(&self) -> u64 {
        black_box(self.decoy_flags.get());
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u64) {
        let decoy = !flags ^ self.noise.next_u64();
        self.decoy_flags.set(decoy);
        self.flags.set(flags);
    }

    pub fn flag(&self, mask: u64) -> bool {
        self.flags() & mask != 0
    }

    /// Set ZF and SF from an ALU result, keeping CF.
    pub fn set_result_flags(&mut self, result: u64) {
        let mut flags = self.flags() & FLAG_CARRY;
        if result == 0 {
            flags |= FLAG_ZERO;
        }
        if result >> 63 != 0 {
            flags |= FLAG_SIGN;
        }
        self.set_flags(flags);
    }

    // ─── Decoy state ───

    /// Next value of the per-run noise stream.
    pub fn noise(&mut self) -> u64 {
        self.noise.next_u64()
    }

    pub fn decoy_push(&mut self, value: u64) {
        let cap = self.decoy_stack.len();
        self.decoy_stack[self.decoy_sp % cap] = value;
        self.decoy_sp = (self.decoy_sp + 1) % cap;
    }

    pub fn decoy_pop(&mut self) -> u64 {
        let cap = self.decoy_stack.len();
        self.decoy_sp = (self.decoy_sp + cap - 1) % cap;
        self.decoy_stack[self.decoy_sp]
    }

    /// Reorder the decoy stack and rekey the shadow registers.
    pub fn scramble_decoys(&mut self) {
        self.decoy_stack.shuffle(&mut self.noise);
        self.decoy_sp = self.noise.below(self.decoy_stack.len() as u64) as usize;
        for cell in &mut self.shadow_regs {
            cell.rekey(&mut self.noise);
        }
    }

    /// Rekey one real cell chosen by `selector`. Values are unchanged.
    pub fn rekey(&mut self, selector: u64) {
        match selector % (NUM_REGS as u64 + 3) {
            r if r < NUM_REGS as u64 => self.regs[r as usize].rekey(&mut self.noise),
            8 => self.sp.rekey(&mut self.noise),
            9 => self.ip.rekey(&mut self.noise),
            _ => self.flags.rekey(&mut self.noise),
        }
    }

    /// Read every decoy structure once.
    pub fn touch_decoys(&self) {
        black_box(self.decoy_flags.get());
        black_box(self.shadow_ip.get());
        black_box(&self.decoy_stack);
    }

    // ─── Faults ───

    pub fn record_fault(&mut self, fault: Fault) {
        self.faults.record(fault);
    }

    pub fn faults(&self) -> &FaultCounts {
        &self.faults
    }
}

impl std::fmt::Debug for VmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmContext")
            .field("depth", &self.depth())
            .field("stack_capacity", &self.stack.len())
            .field("faults", &self.faults)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;

    fn ctx(seed: u64) -> VmContext {
        VmContext::new(&VmConfig::default(), &mut StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_push_pop_lifo() {
        let mut c = ctx(1);
        for v in [1u64, 2, 3, u64::MAX] {
            c.push(v);
        }
        assert_eq!(c.depth(), 4);
        assert_eq!(c.peek(), Some(u64::MAX));
        assert_eq!(c.pop(), u64::MAX);
        assert_eq!(c.pop(), 3);
        assert_eq!(c.pop(), 2);
        assert_eq!(c.pop(), 1);
        assert!(c.faults().is_empty());
    }

    #[test]
    fn test_underflow_yields_zero() {
        let mut c = ctx(2);
        assert_eq!(c.try_pop(), Err(Fault::StackUnderflow));
        assert_eq!(c.pop(), 0);
        assert_eq!(c.depth(), 0);
        assert_eq!(c.peek(), None);
        assert_eq!(c.faults().count(Fault::StackUnderflow), 1);
    }

    #[test]
    fn test_overflow_is_dropped() {
        let cfg = VmConfig::default().with_stack_capacity(4);
        let mut c = VmContext::new(&cfg, &mut StdRng::seed_from_u64(3));
        for v in 0..4 {
            assert!(c.try_push(v).is_ok());
        }
        assert_eq!(c.try_push(99), Err(Fault::StackOverflow));
        c.push(100);
        assert_eq!(c.depth(), 4);
        assert_eq!(c.peek(), Some(3));
        assert_eq!(c.faults().count(Fault::StackOverflow), 1);
    }

    #[test]
    fn test_registers_wrap_index() {
        let mut c = ctx(4);
        c.set_reg(3, 77);
        assert_eq!(c.get_reg(3), 77);
        assert_eq!(c.get_reg(11), 77);
        c.set_reg(15, 5);
        assert_eq!(c.get_reg(7), 5);
    }

    #[test]
    fn test_load_inputs_ignores_extra() {
        let mut c = ctx(5);
        let inputs: Vec<u64> = (10..20).collect();
        c.load_inputs(&inputs);
        for i in 0..NUM_REGS {
            assert_eq!(c.get_reg(i), 10 + i as u64);
        }
    }

    #[test]
    fn test_ip_and_flags() {
        let mut c = ctx(6);
        assert_eq!(c.ip(), 0);
        c.set_ip(40);
        c.advance_ip(2);
        assert_eq!(c.ip(), 42);

        c.set_flags(FLAG_CARRY);
        c.set_result_flags(0);
        assert!(c.flag(FLAG_ZERO));
        assert!(c.flag(FLAG_CARRY));
        c.set_result_flags(1 << 63);
        assert!(!c.flag(FLAG_ZERO));
        assert!(c.flag(FLAG_SIGN));
    }

    #[test]
    fn test_decoy_churn_leaves_real_state() {
        let mut c = ctx(7);
        c.push(5);
        c.push(6);
        c.set_reg(0, 123);
        c.set_flags(FLAG_ZERO);
        for i in 0..100 {
            c.scramble_decoys();
            c.rekey(i);
            c.decoy_push(i);
            c.decoy_pop();
            c.touch_decoys();
        }
        assert_eq!(c.get_reg(0), 123);
        assert_eq!(c.flags(), FLAG_ZERO);
        assert_eq!(c.pop(), 6);
        assert_eq!(c.pop(), 5);
    }

    #[test]
    fn test_zero_decoy_capacity_is_safe() {
        let cfg = VmConfig::default().with_decoy_stack_capacity(0);
        let mut c = VmContext::new(&cfg, &mut StdRng::seed_from_u64(8));
        for v in 0..10 {
            c.push(v);
        }
        assert_eq!(c.pop(), 9);
    }

    struct DecoySnapshot {
        stack: Vec<u64>,
        regs: [u64; NUM_REGS],
        ip: usize,
        flags: u64,
    }

    fn snapshot(c: &VmContext) -> DecoySnapshot {
        DecoySnapshot {
            stack: c.decoy_stack.clone(),
            regs: std::array::from_fn(|i| c.shadow_regs[i].stored()),
            ip: c.shadow_ip.stored(),
            flags: c.decoy_flags.stored(),
        }
    }

    #[test]
    fn test_every_real_write_moves_a_decoy() {
        let cfg = VmConfig::default().with_stack_capacity(2);
        let mut c = VmContext::new(&cfg, &mut StdRng::seed_from_u64(9));

        for v in [11u64, 22, 33] {
            let before = snapshot(&c);
            c.push(v);
            assert_ne!(snapshot(&c).stack, before.stack, "push {v}");
        }
        assert_eq!(c.faults().count(Fault::StackOverflow), 1);
        assert_eq!(c.depth(), 2);

        for idx in 0..NUM_REGS {
            let before = snapshot(&c);
            c.set_reg(idx, 5);
            assert_ne!(snapshot(&c).regs[idx], before.regs[idx], "reg {idx}");
        }

        let before = snapshot(&c);
        c.set_ip(1_000);
        assert_ne!(snapshot(&c).ip, before.ip);

        for flags in [FLAG_ZERO, FLAG_ZERO, 0] {
            let before = snapshot(&c);
            c.set_flags(flags);
            assert_ne!(snapshot(&c).flags, before.flags, "flags {flags:#x}");
        }
    }
}
