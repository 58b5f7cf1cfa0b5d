pub mod builder;
pub mod cell;
pub mod imm;
pub mod opcode;
pub mod program;
