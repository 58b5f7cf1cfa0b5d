//! End-to-end: build, seal and execute programs across many opcode tables.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shroud::expr::{self, BinOp, Expr, UnOp};
use shroud::{
    Builder, BuilderConfig, Fault, Interpreter, Op, OpcodeTable, Outcome, SealedProgram,
    VmConfig, VmError,
};

fn table(seed: u64) -> Arc<OpcodeTable> {
    Arc::new(OpcodeTable::from_seed(seed))
}

fn builder(table_seed: u64, rng: &mut StdRng) -> Builder<StdRng> {
    Builder::new(table(table_seed), StdRng::seed_from_u64(rng.gen()))
}

fn run(program: SealedProgram, inputs: &[u64], rng: &mut StdRng) -> u64 {
    Interpreter::new(program)
        .with_entropy(StdRng::seed_from_u64(rng.gen()))
        .execute_with(inputs)
}

#[test]
fn test_binary_ops_match_native() {
    let mut rng = StdRng::seed_from_u64(0xB1);
    let ops: [(fn(&mut Builder<StdRng>), fn(u64, u64) -> u64); 6] = [
        (|b: &mut Builder<StdRng>| { b.add(); }, u64::wrapping_add),
        (|b: &mut Builder<StdRng>| { b.sub(); }, u64::wrapping_sub),
        (|b: &mut Builder<StdRng>| { b.mul(); }, u64::wrapping_mul),
        (|b: &mut Builder<StdRng>| { b.xor(); }, |a: u64, b: u64| a ^ b),
        (|b: &mut Builder<StdRng>| { b.and(); }, |a: u64, b: u64| a & b),
        (|b: &mut Builder<StdRng>| { b.or(); }, |a: u64, b: u64| a | b),
    ];

    for table_seed in 0..8u64 {
        for (i, (emit, native)) in ops.iter().enumerate() {
            for _ in 0..12 {
                let (x, y): (u64, u64) = (rng.gen(), rng.gen());
                let mut b = builder(table_seed, &mut rng);
                b.push_imm(x).push_imm(y);
                emit(&mut b);
                let got = run(b.finalize(), &[], &mut rng);
                assert_eq!(got, native(x, y), "table {table_seed}, op {i}, {x:#x} {y:#x}");
            }
        }
    }
}

#[test]
fn test_compound_expression_across_tables() {
    let mut rng = StdRng::seed_from_u64(0xC0);
    for table_seed in 100..106u64 {
        for _ in 0..24 {
            let (a, b, c, d): (u64, u64, u64, u64) = (rng.gen(), rng.gen(), rng.gen(), rng.gen());
            let mut builder = builder(table_seed, &mut rng);
            builder
                .push_imm(a)
                .push_imm(b)
                .mul()
                .push_imm(c)
                .push_imm(d)
                .xor()
                .add();
            let expected = a.wrapping_mul(b).wrapping_add(c ^ d);
            assert_eq!(run(builder.finalize(), &[], &mut rng), expected);
        }
    }
}

#[test]
fn test_facade_helpers() {
    assert_eq!(shroud::compute_add(5, 10), 15);
    assert_eq!(shroud::compute(6, 7, 0xF0, 0x0F), 42 + 0xFF);
    assert_eq!(shroud::evaluate("42 ^ 42", &[]), Ok(0));
    assert_eq!(shroud::evaluate("a * b + (c ^ d)", &[3, 4, 5, 6]), Ok(15));
}

#[test]
fn test_xor_self_is_zero() {
    let mut rng = StdRng::seed_from_u64(42);
    for table_seed in 0..5 {
        let mut b = builder(table_seed, &mut rng);
        b.push_imm(42).push_imm(42).xor();
        assert_eq!(run(b.finalize(), &[], &mut rng), 0);
    }
}

#[test]
fn test_empty_program_returns_zero() {
    let mut rng = StdRng::seed_from_u64(1);
    let b = builder(1, &mut rng);
    assert!(b.is_empty());
    assert_eq!(run(b.finalize(), &[], &mut rng), 0);
}

#[test]
fn test_program_without_halt_terminates() {
    let t = table(7);
    let key = shroud_core::crypto::stream_cipher::CipherKey::from_seed(7);
    let plain: Vec<u8> = [Op::Nop, Op::Junk, Op::Nop]
        .iter()
        .map(|&op| t.canonical(op))
        .collect();
    let bytes = shroud_core::crypto::stream_cipher::encrypt(&plain, &key);
    let program = SealedProgram::from_parts(bytes, key, t, 3);

    let exec = Interpreter::new(program).run(&[]);
    assert_eq!(exec.outcome, Outcome::EndOfStream);
    assert_eq!(exec.value, 0);
    assert_eq!(exec.steps, 3);
}

#[test]
fn test_unrecognized_bytes_do_not_crash() {
    let t = table(8);
    let key = shroud_core::crypto::stream_cipher::CipherKey::from_seed(8);
    let noise: Vec<u8> = (0..=255u8).filter(|&b| t.logical_of(b).is_none()).take(20).collect();
    let bytes = shroud_core::crypto::stream_cipher::encrypt(&noise, &key);
    let program = SealedProgram::from_parts(bytes, key, t, noise.len());

    let exec = Interpreter::new(program).run(&[]);
    assert_eq!(exec.outcome, Outcome::EndOfStream);
    assert_eq!(exec.faults.count(Fault::UnrecognizedOpcode), noise.len() as u64);
}

#[test]
fn test_underflow_is_silent() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut b = builder(3, &mut rng);
    b.add().mul().div().modulo().cmp().pop_reg(0).push_imm(9);
    let exec = Interpreter::new(b.finalize()).run(&[]);
    assert_eq!(exec.outcome, Outcome::Halted);
    assert_eq!(exec.value, 9);
    assert!(exec.faults.count(Fault::StackUnderflow) >= 5);
}

#[test]
fn test_stack_storm_leaves_sentinel_registers() {
    let mut rng = StdRng::seed_from_u64(4);
    let sentinels = [0x1111u64, 0x2222, 0x3333, 0x4444, 0x5555, 0x6666, 0x7777];

    let mut b = builder(4, &mut rng);
    for i in 0..40 {
        b.push_imm(i);
    }
    for _ in 0..40 {
        b.pop_reg(7);
    }
    b.push_reg(0);
    for r in 1..7 {
        b.push_reg(r).add();
    }

    let cfg = VmConfig::default().with_stack_capacity(16);
    let exec = Interpreter::with_config(b.finalize(), cfg)
        .with_entropy(StdRng::seed_from_u64(5))
        .run(&sentinels);
    assert_eq!(exec.outcome, Outcome::Halted);
    assert_eq!(exec.value, sentinels.iter().sum::<u64>());
    assert_eq!(exec.faults.count(Fault::StackOverflow), 24);
    assert_eq!(exec.faults.count(Fault::StackUnderflow), 24);
}

#[test]
fn test_factorial_loop() {
    // r1 = 1; while r0 != 0 { r1 *= r0; r0 -= 1 }
    let mut rng = StdRng::seed_from_u64(6);
    for n in [0u64, 1, 5, 10, 20] {
        let mut b = builder(n + 50, &mut rng);
        b.push_imm(1)
            .pop_reg(1)
            .push_reg(0) // loop head
            .push_imm(0)
            .cmp()
            .jz(9)
            .push_reg(1)
            .push_reg(0)
            .mul()
            .pop_reg(1)
            .push_reg(0)
            .push_imm(1)
            .sub()
            .pop_reg(0)
            .jmp(-13)
            .push_reg(1);
        let expected = (1..=n).product::<u64>();
        assert_eq!(run(b.finalize(), &[n], &mut rng), expected, "{n}!");
    }
}

#[test]
fn test_infinite_loop_times_out() {
    let mut rng = StdRng::seed_from_u64(9);
    let mut b = builder(9, &mut rng);
    b.jmp(-1);
    let cfg = VmConfig::default().with_max_instructions(5_000).with_budget_jitter(100);
    let mut vm = Interpreter::with_config(b.finalize(), cfg);
    match vm.try_execute(&[]) {
        Err(VmError::TimeoutExceeded { limit }) => assert!((5_000..5_100).contains(&limit)),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(vm.execute(), 0);
}

#[test]
fn test_same_program_different_artifacts() {
    let mut rng = StdRng::seed_from_u64(10);
    let build = |rng: &mut StdRng| {
        let mut b = builder(10, rng);
        b.push_imm(123).push_imm(456).add();
        b.finalize()
    };
    let p1 = build(&mut rng);
    let p2 = build(&mut rng);
    assert_ne!(p1.bytes(), p2.bytes());
    assert_eq!(run(p1, &[], &mut rng), 579);
    assert_eq!(run(p2, &[], &mut rng), 579);
}

#[test]
fn test_probe_hit_corrupts_result_silently() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut b = builder(11, &mut rng);
    for _ in 0..100 {
        b.push_reg(0).push_imm(3).add().pop_reg(0);
    }
    b.push_reg(0);
    let program = b.finalize();
    let cfg = VmConfig::default().with_check_interval(16..=16);

    let clean = Interpreter::with_config(program.clone(), cfg.clone()).execute_with(&[1]);
    assert_eq!(clean, 301);

    let mut polls = 0;
    let exec = Interpreter::with_config(program, cfg)
        .with_probe(|| {
            polls += 1;
            polls >= 3
        })
        .run(&[1]);
    assert!(exec.tamper_events > 0);
    assert_ne!(exec.value, 301);
}

#[test]
fn test_plain_and_noisy_configs_agree() {
    let mut rng = StdRng::seed_from_u64(12);
    let noisy = BuilderConfig::default()
        .with_junk_percent(60)
        .with_triple_percent(40)
        .with_morph_percent(80)
        .with_interleave_percent(50);
    for cfg in [BuilderConfig::plain(), BuilderConfig::default(), noisy] {
        for _ in 0..10 {
            let (x, y): (u64, u64) = (rng.gen(), rng.gen());
            let mut b = Builder::with_config(table(12), StdRng::seed_from_u64(rng.gen()), cfg.clone());
            b.push_imm(x).push_imm(y).sub().not().neg().push_imm(y).xor();
            // -(!v) == v + 1
            let expected = x.wrapping_sub(y).wrapping_add(1) ^ y;
            assert_eq!(run(b.finalize(), &[], &mut rng), expected);
        }
    }
}

fn random_expr(rng: &mut StdRng, depth: u32) -> Expr {
    if depth == 0 || rng.gen_ratio(1, 4) {
        return if rng.gen() {
            Expr::Lit(rng.gen_range(0..1_000))
        } else {
            Expr::Var(rng.gen_range(0..8))
        };
    }
    match rng.gen_range(0..14) {
        0 => Expr::Unary(UnOp::Neg, Box::new(random_expr(rng, depth - 1))),
        1 => Expr::Unary(UnOp::Not, Box::new(random_expr(rng, depth - 1))),
        k => {
            let op = [
                BinOp::Or,
                BinOp::Xor,
                BinOp::And,
                BinOp::Shl,
                BinOp::Shr,
                BinOp::Add,
                BinOp::Sub,
                BinOp::Mul,
                BinOp::Div,
                BinOp::Mod,
                BinOp::Rol,
                BinOp::Ror,
            ][k - 2];
            Expr::Binary(
                op,
                Box::new(random_expr(rng, depth - 1)),
                Box::new(random_expr(rng, depth - 1)),
            )
        }
    }
}

#[test]
fn test_random_expression_trees() {
    let mut rng = StdRng::seed_from_u64(0xE7);
    for i in 0..150u64 {
        let tree = random_expr(&mut rng, 5);
        let inputs: Vec<u64> = (0..8).map(|_| rng.gen()).collect();
        let mut b = builder(i % 7, &mut rng);
        tree.emit(&mut b);
        let got = run(b.finalize(), &inputs, &mut rng);
        assert_eq!(got, tree.eval(&inputs), "tree {tree:?}");
    }
}

#[test]
fn test_compile_from_source() {
    let mut rng = StdRng::seed_from_u64(0x5C);
    let cases = [
        ("a + b * c", [2u64, 3, 4]),
        ("(a | b) ^ ~c", [0xF0, 0x0F, 0xFF]),
        ("rol(a, 8) >> b % 64", [0x12, 4, 0]),
        ("-a / (b - c)", [7, 10, 8]),
        ("a % 0 + b / 0", [1, 2, 3]),
    ];
    for (src, inputs) in cases {
        let mut b = builder(0x5C, &mut rng);
        let tree = expr::compile(src, &mut b).unwrap();
        assert_eq!(run(b.finalize(), &inputs, &mut rng), tree.eval(&inputs), "{src}");
    }
}
