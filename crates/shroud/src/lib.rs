//! Expression virtualization.
//!
//! Arithmetic is compiled into stack bytecode whose opcode encoding is
//! randomized per build, sealed under a chained byte cipher and executed
//! by an interpreter whose state never sits in memory in plaintext.
//!
//! ```ignore
//! assert_eq!(shroud::compute_add(5, 10), 15);
//! assert_eq!(shroud::evaluate("a * b + (c ^ d)", &[3, 4, 5, 6])?, 15);
//! ```

use std::sync::{Arc, OnceLock};

use tracing::debug;

pub mod expr;

pub use expr::ExprError;
pub use shroud_core::config::{BuilderConfig, VmConfig};
pub use shroud_core::entropy::{BuildEntropy, EntropySource, RuntimeEntropy};
pub use shroud_core::error::{Fault, VmError};
pub use shroud_core::vm::builder::Builder;
pub use shroud_core::vm::cell::{ObfCell, PolymorphicCell, ScatteredCell};
pub use shroud_core::vm::opcode::{Op, OpcodeTable};
pub use shroud_core::vm::program::SealedProgram;
pub use shroud_core::BUILD_SEED;
pub use shroud_runtime::{
    AnalysisProbe, Execution, FaultCounts, Interpreter, NoProbe, Outcome, TimingProbe, VmContext,
};

static BUILD_TABLE: OnceLock<Arc<OpcodeTable>> = OnceLock::new();

/// The opcode table for this build, generated on first use.
pub fn build_table() -> Arc<OpcodeTable> {
    Arc::clone(BUILD_TABLE.get_or_init(|| Arc::new(OpcodeTable::for_build())))
}

/// A builder over [`build_table`] with fresh runtime entropy.
pub fn builder() -> Builder {
    Builder::new(build_table(), RuntimeEntropy::new())
}

/// Seal the expression `src` with the build table.
pub fn seal(src: &str) -> Result<SealedProgram, ExprError> {
    let mut b = builder();
    expr::compile(src, &mut b)?;
    debug!(src, instructions = b.instruction_count(), "compiled expression");
    Ok(b.finalize())
}

/// Compile, seal and run `src` with `inputs` bound to `a`..`h`.
pub fn evaluate(src: &str, inputs: &[u64]) -> Result<u64, ExprError> {
    let program = seal(src)?;
    Ok(Interpreter::new(program).execute_with(inputs))
}

/// `a + b`, computed inside the VM.
pub fn compute_add(a: u64, b: u64) -> u64 {
    let mut builder = builder();
    builder.push_imm(a).push_imm(b).add();
    Interpreter::new(builder.finalize()).execute()
}

/// `(a * b) + (c ^ d)`, computed inside the VM.
pub fn compute(a: u64, b: u64, c: u64, d: u64) -> u64 {
    let mut builder = builder();
    builder
        .push_imm(a)
        .push_imm(b)
        .mul()
        .push_imm(c)
        .push_imm(d)
        .xor()
        .add();
    Interpreter::new(builder.finalize()).execute()
}
