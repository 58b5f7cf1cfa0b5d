//! Run-side half of the shroud virtualization engine.
//!
//! [`Interpreter`] walks a [`SealedProgram`](shroud_core::SealedProgram)
//! one decrypted byte at a time, keeping all machine state inside a
//! [`VmContext`] of obfuscated cells shadowed by decoy copies.

pub mod context;
pub mod fault;
pub mod opaque;
pub mod probe;
pub mod vm_interp;

pub use context::VmContext;
pub use fault::FaultCounts;
pub use probe::{AnalysisProbe, NoProbe, TimingProbe};
pub use vm_interp::{Execution, Interpreter, Outcome};
