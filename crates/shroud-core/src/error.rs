//! Error types shared by the builder and the runtime.
//!
//! The engine degrades silently wherever it can: stack faults, division by
//! zero and unknown opcode bytes are absorbed inside the interpreter and
//! only counted. What remains here are the conditions a caller may want to
//! act on explicitly.

use thiserror::Error;

/// Errors surfaced at the public boundary of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// The instruction ceiling was reached before the program halted.
    #[error("instruction budget exhausted after {limit} instructions")]
    TimeoutExceeded {
        /// The ceiling in effect for the run, jitter included.
        limit: u64,
    },

    /// A configuration value is out of its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Interpreter faults. Never propagated to the caller of `execute`; the
/// runtime counts them so tests and diagnostics can observe them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Fault {
    /// Pop on an empty real stack. The pop yields 0.
    #[error("stack underflow")]
    StackUnderflow,

    /// Push beyond the real stack capacity. The write is dropped.
    #[error("stack overflow")]
    StackOverflow,

    /// Division by zero. The result is 0.
    #[error("division by zero")]
    DivisionByZero,

    /// Remainder by zero. The result is 0.
    #[error("modulo by zero")]
    ModuloByZero,

    /// A byte that matches no opcode encoding. A pseudo-random value is
    /// pushed in its place.
    #[error("unrecognized opcode byte")]
    UnrecognizedOpcode,
}
