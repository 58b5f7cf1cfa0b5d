use clap::{Args, Parser, Subcommand};

/// shroud - compile arithmetic into randomized, encrypted VM bytecode
#[derive(Debug, Parser)]
#[command(name = "shroud", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Args)]
pub struct GlobalOptions {
    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// How a program is built.
#[derive(Debug, Args)]
pub struct BuildOptions {
    /// Seed for the opcode table and builder noise. Defaults to this
    /// build's table with fresh runtime noise.
    #[arg(long, value_parser = parse_u64)]
    pub seed: Option<u64>,

    /// Emit no decoys, morphs or immediate masks.
    #[arg(long)]
    pub plain: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compile an expression, run it in the VM and print the result.
    Eval {
        /// Expression over a..h, e.g. "a * b + (c ^ d)".
        expr: String,

        /// Input values bound to a, b, c, ... in order.
        #[arg(short, long = "input", value_parser = parse_u64)]
        inputs: Vec<u64>,

        /// Instruction ceiling for the run.
        #[arg(long)]
        max_instructions: Option<u64>,

        #[command(flatten)]
        build: BuildOptions,
    },

    /// Compile an expression and dump the sealed bytecode.
    Dump {
        /// Expression over a..h.
        expr: String,

        #[command(flatten)]
        build: BuildOptions,
    },
}

/// Decimal or `0x`-prefixed hexadecimal.
fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s:?} is not a u64: {e}"))
}
