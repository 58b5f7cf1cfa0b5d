//! Build-side half of the shroud virtualization engine.
//!
//! Everything needed to turn a sequence of stack operations into a sealed,
//! per-build randomized bytecode artifact lives here: the opcode assignment
//! table, the obfuscated value cell, the MBA identities, the multi-layer
//! byte cipher and the fluent [`vm::builder::Builder`]. The interpreter that
//! consumes a [`vm::program::SealedProgram`] lives in `shroud-runtime`.

pub mod config;
pub mod crypto;
pub mod entropy;
pub mod error;
pub mod mba;
pub mod vm;

pub use config::{BuilderConfig, VmConfig};
pub use entropy::{BuildEntropy, EntropySource, RuntimeEntropy};
pub use error::VmError;
pub use vm::builder::Builder;
pub use vm::cell::{ObfCell, PolymorphicCell, ScatteredCell, Scramble};
pub use vm::opcode::{Op, OpcodeTable};
pub use vm::program::SealedProgram;

/// Seed baked in by `build.rs`. Fixed within one build, different across
/// builds unless `SHROUD_BUILD_SEED` pins it.
pub const BUILD_SEED: u64 = include!(concat!(env!("OUT_DIR"), "/build_seed.rs"));
