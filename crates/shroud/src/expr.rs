//! Infix expression front end.
//!
//! The token grammar lives in `expr.pest`. Binding strength follows C,
//! loosest first: `|`, `^`, `&`, `<< >>`, `+ -`, `* / %`, then the unary
//! `- ~ !`. `rol(x, n)` and `ror(x, n)` are function-style rotates.
//!
//! Numbers are unsigned 64-bit, decimal or `0x` hex, `_` allowed as a
//! separator. Variables `a`..`h` read registers r0..r7. All arithmetic
//! wraps.

use std::sync::OnceLock;

use pest::error::InputLocation;
use pest::iterators::Pair;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;
use shroud_core::entropy::EntropySource;
use shroud_core::vm::builder::Builder;
use thiserror::Error;

/// Deepest nesting accepted. Keeps both the parser's recursion and the
/// VM operand stack bounded.
pub const MAX_DEPTH: usize = 96;

#[derive(Parser)]
#[grammar = "expr.pest"]
struct ExprGrammar;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("syntax error at offset {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("invalid number {text:?} at offset {pos}")]
    InvalidNumber { text: String, pos: usize },

    #[error("unknown identifier {name:?} at offset {pos} (variables are a..h)")]
    UnknownIdentifier { name: String, pos: usize },

    #[error("expression nested deeper than {limit} levels")]
    TooDeep { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    Xor,
    And,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Rol,
    Ror,
}

impl BinOp {
    /// Native result, matching the VM's semantics.
    pub fn apply(self, a: u64, b: u64) -> u64 {
        match self {
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::And => a & b,
            BinOp::Shl => a << (b & 63),
            BinOp::Shr => a >> (b & 63),
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div => a.checked_div(b).unwrap_or(0),
            BinOp::Mod => a.checked_rem(b).unwrap_or(0),
            BinOp::Rol => a.rotate_left((b & 63) as u32),
            BinOp::Ror => a.rotate_right((b & 63) as u32),
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Lit(u64),
    /// Register index 0..8
    Var(u8),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Evaluate natively. Missing inputs read as 0.
    pub fn eval(&self, inputs: &[u64]) -> u64 {
        match self {
            Expr::Lit(v) => *v,
            Expr::Var(r) => inputs.get(usize::from(*r)).copied().unwrap_or(0),
            Expr::Unary(UnOp::Neg, e) => e.eval(inputs).wrapping_neg(),
            Expr::Unary(UnOp::Not, e) => !e.eval(inputs),
            Expr::Binary(op, a, b) => op.apply(a.eval(inputs), b.eval(inputs)),
        }
    }

    /// Append stack code for this tree to `builder`.
    pub fn emit<E: EntropySource>(&self, builder: &mut Builder<E>) {
        match self {
            Expr::Lit(v) => {
                builder.push_imm(*v);
            }
            Expr::Var(r) => {
                builder.push_reg(*r);
            }
            Expr::Unary(op, e) => {
                e.emit(builder);
                match op {
                    UnOp::Neg => builder.neg(),
                    UnOp::Not => builder.not(),
                };
            }
            Expr::Binary(op, a, b) => {
                a.emit(builder);
                b.emit(builder);
                match op {
                    BinOp::Or => builder.or(),
                    BinOp::Xor => builder.xor(),
                    BinOp::And => builder.and(),
                    BinOp::Shl => builder.shl(),
                    BinOp::Shr => builder.shr(),
                    BinOp::Add => builder.add(),
                    BinOp::Sub => builder.sub(),
                    BinOp::Mul => builder.mul(),
                    BinOp::Div => builder.div(),
                    BinOp::Mod => builder.modulo(),
                    BinOp::Rol => builder.rol(),
                    BinOp::Ror => builder.ror(),
                };
            }
        }
    }
}

impl From<pest::error::Error<Rule>> for ExprError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        let pos = match err.location {
            InputLocation::Pos(pos) => pos,
            InputLocation::Span((start, _)) => start,
        };
        ExprError::Syntax {
            pos,
            message: err.variant.message().into_owned(),
        }
    }
}

/// Parse `src` and append its code to `builder`. Nothing is emitted on
/// error.
pub fn compile<E: EntropySource>(src: &str, builder: &mut Builder<E>) -> Result<Expr, ExprError> {
    let expr = parse(src)?;
    expr.emit(builder);
    Ok(expr)
}

pub fn parse(src: &str) -> Result<Expr, ExprError> {
    // bounds pest's own recursion
    if paren_depth(src) > MAX_DEPTH {
        return Err(ExprError::TooDeep { limit: MAX_DEPTH });
    }

    let expr = ExprGrammar::parse(Rule::main, src)?
        .next()
        .and_then(|main| main.into_inner().next())
        .ok_or_else(|| ExprError::Syntax {
            pos: 0,
            message: "empty parse".into(),
        })?;
    check_nesting(expr.clone(), 1)?;
    build(expr)
}

fn pratt() -> &'static PrattParser<Rule> {
    static PRATT: OnceLock<PrattParser<Rule>> = OnceLock::new();
    PRATT.get_or_init(|| {
        // loosest first
        PrattParser::new()
            .op(Op::infix(Rule::bit_or, Assoc::Left))
            .op(Op::infix(Rule::bit_xor, Assoc::Left))
            .op(Op::infix(Rule::bit_and, Assoc::Left))
            .op(Op::infix(Rule::shl, Assoc::Left) | Op::infix(Rule::shr, Assoc::Left))
            .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
            .op(Op::infix(Rule::mul, Assoc::Left)
                | Op::infix(Rule::div, Assoc::Left)
                | Op::infix(Rule::rem, Assoc::Left))
            .op(Op::prefix(Rule::neg) | Op::prefix(Rule::not))
    })
}

fn build(expr: Pair<'_, Rule>) -> Result<Expr, ExprError> {
    pratt()
        .map_primary(build_primary)
        .map_prefix(|op, rhs| {
            let op = match op.as_rule() {
                Rule::neg => UnOp::Neg,
                Rule::not => UnOp::Not,
                _ => return Err(unexpected(&op)),
            };
            Ok(Expr::Unary(op, Box::new(rhs?)))
        })
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::bit_or => BinOp::Or,
                Rule::bit_xor => BinOp::Xor,
                Rule::bit_and => BinOp::And,
                Rule::shl => BinOp::Shl,
                Rule::shr => BinOp::Shr,
                Rule::add => BinOp::Add,
                Rule::sub => BinOp::Sub,
                Rule::mul => BinOp::Mul,
                Rule::div => BinOp::Div,
                Rule::rem => BinOp::Mod,
                _ => return Err(unexpected(&op)),
            };
            Ok(Expr::Binary(op, Box::new(lhs?), Box::new(rhs?)))
        })
        .parse(expr.into_inner())
}

fn build_primary(pair: Pair<'_, Rule>) -> Result<Expr, ExprError> {
    let pos = pair.as_span().start();
    match pair.as_rule() {
        Rule::number => parse_number(pair.as_str(), pos).map(Expr::Lit),
        Rule::ident => match pair.as_str().as_bytes() {
            [c @ b'a'..=b'h'] => Ok(Expr::Var(c - b'a')),
            _ => Err(ExprError::UnknownIdentifier {
                name: pair.as_str().to_string(),
                pos,
            }),
        },
        Rule::expr => build(pair),
        Rule::rotate => {
            let mut inner = pair.into_inner();
            let (Some(op), Some(value), Some(amount)) = (inner.next(), inner.next(), inner.next())
            else {
                return Err(ExprError::Syntax {
                    pos,
                    message: "incomplete rotate".into(),
                });
            };
            let op = if op.as_str() == "rol" { BinOp::Rol } else { BinOp::Ror };
            Ok(Expr::Binary(op, Box::new(build(value)?), Box::new(build(amount)?)))
        }
        _ => Err(unexpected(&pair)),
    }
}

fn unexpected(pair: &Pair<'_, Rule>) -> ExprError {
    ExprError::Syntax {
        pos: pair.as_span().start(),
        message: format!("unexpected {:?}", pair.as_rule()),
    }
}

fn paren_depth(src: &str) -> usize {
    let (mut depth, mut max) = (0usize, 0usize);
    for b in src.bytes() {
        match b {
            b'(' => {
                depth += 1;
                max = max.max(depth);
            }
            b')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

/// Rejects trees nested deeper than [`MAX_DEPTH`], counting parentheses,
/// rotate arguments and runs of unary operators.
fn check_nesting(expr: Pair<'_, Rule>, depth: usize) -> Result<(), ExprError> {
    if depth > MAX_DEPTH {
        return Err(ExprError::TooDeep { limit: MAX_DEPTH });
    }
    let mut prefixes = 0;
    for pair in expr.into_inner() {
        match pair.as_rule() {
            Rule::neg | Rule::not => {
                prefixes += 1;
                if depth + prefixes > MAX_DEPTH {
                    return Err(ExprError::TooDeep { limit: MAX_DEPTH });
                }
            }
            Rule::expr => {
                check_nesting(pair, depth + prefixes + 1)?;
                prefixes = 0;
            }
            Rule::rotate => {
                for arg in pair.into_inner().filter(|p| p.as_rule() == Rule::expr) {
                    check_nesting(arg, depth + prefixes + 1)?;
                }
                prefixes = 0;
            }
            _ => prefixes = 0,
        }
    }
    Ok(())
}

fn parse_number(text: &str, pos: usize) -> Result<u64, ExprError> {
    let cleaned: String = text.chars().filter(|&c| c != '_').collect();
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse::<u64>(),
    };
    parsed.map_err(|_| ExprError::InvalidNumber {
        text: text.to_string(),
        pos,
    })
}
