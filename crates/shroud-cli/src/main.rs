mod app;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use shroud::expr;
use shroud::{
    BuildEntropy, Builder, BuilderConfig, EntropySource, Interpreter, OpcodeTable, RuntimeEntropy,
    SealedProgram, VmConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::{BuildOptions, Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // info+ on stderr; --verbose enables debug; RUST_LOG overrides
    let default = if cli.global.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();

    match cli.command {
        Command::Eval { expr, inputs, max_instructions, build } => {
            eval(&expr, &inputs, max_instructions, &build)
        }
        Command::Dump { expr, build } => dump(&expr, &build),
    }
}

fn seal(src: &str, opts: &BuildOptions) -> anyhow::Result<SealedProgram> {
    let config = if opts.plain {
        BuilderConfig::plain()
    } else {
        BuilderConfig::default()
    };
    match opts.seed {
        Some(seed) => {
            let table = Arc::new(OpcodeTable::from_seed(seed));
            compile(src, Builder::with_config(table, BuildEntropy::from_seed(seed), config))
        }
        None => compile(
            src,
            Builder::with_config(shroud::build_table(), RuntimeEntropy::new(), config),
        ),
    }
}

fn compile<E: EntropySource>(src: &str, mut builder: Builder<E>) -> anyhow::Result<SealedProgram> {
    expr::compile(src, &mut builder).with_context(|| format!("failed to compile {src:?}"))?;
    info!(instructions = builder.instruction_count(), "compiled");
    Ok(builder.finalize())
}

fn eval(
    src: &str,
    inputs: &[u64],
    max_instructions: Option<u64>,
    opts: &BuildOptions,
) -> anyhow::Result<()> {
    let program = seal(src, opts)?;
    let mut config = VmConfig::default();
    if let Some(max) = max_instructions {
        config = config.with_max_instructions(max);
    }
    config.validate()?;

    let exec = Interpreter::with_config(program, config).run(inputs);
    info!(
        outcome = ?exec.outcome,
        steps = exec.steps,
        faults = exec.faults.total(),
        "executed"
    );
    println!("{}", exec.value);
    Ok(())
}

fn dump(src: &str, opts: &BuildOptions) -> anyhow::Result<()> {
    let program = seal(src, opts)?;
    println!("sealed:    {} bytes", program.len());
    println!("code:      {} bytes", program.code_len());
    println!("plaintext: {} bytes", program.decrypt_all().len());
    for chunk in program.bytes().chunks(32) {
        println!("{}", hex::encode(chunk));
    }
    Ok(())
}
