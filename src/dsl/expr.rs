//! Expression compiler.
//!
//! Tokens: numeric literals, double-quoted strings, `{var.path}` variables,
//! `+ - * / ( )`. Shunting-Yard rewrites the token stream to postfix; the
//! evaluator walks the postfix form with a value stack, dispatching each
//! binary operator on its left operand's kind.

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, tag, take_while1},
    character::complete::{char as nom_char, none_of},
    combinator::value,
    sequence::delimited,
    IResult,
};
use rust_decimal::Decimal;
use std::str::FromStr;

use super::ast::{BinOp, Expr, ExprTok};
use crate::error::{EngineError, Result};

/// Pre-postfix token: operands/operators plus grouping parens.
#[derive(Debug, Clone, PartialEq)]
enum RawTok {
    Operand(ExprTok),
    Op(BinOp),
    LParen,
    RParen,
}

fn string_literal(input: &str) -> IResult<&str, String> {
    alt((
        value(String::new(), tag("\"\"")),
        delimited(
            nom_char('"'),
            escaped_transform(
                none_of("\\\""),
                '\\',
                alt((
                    value("\\", tag("\\")),
                    value("\"", tag("\"")),
                    value("\n", tag("n")),
                    value("\t", tag("t")),
                )),
            ),
            nom_char('"'),
        ),
    ))(input)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn variable(input: &str) -> IResult<&str, Vec<String>> {
    let (rest, path) = delimited(
        nom_char('{'),
        take_while1(|c: char| is_ident_char(c) || c == '.'),
        nom_char('}'),
    )(input)?;
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    Ok((rest, segments))
}

fn tokenize(input: &str) -> Result<Vec<RawTok>> {
    let mut toks = Vec::new();
    let mut rest = input.trim();

    // A '-' is a sign (not an operator) at expression start, after another
    // operator, or after an opening paren.
    let unary_position = |toks: &[RawTok]| {
        matches!(toks.last(), None | Some(RawTok::Op(_)) | Some(RawTok::LParen))
    };

    while !rest.is_empty() {
        let c = rest.chars().next().unwrap();
        if c.is_whitespace() {
            rest = rest.trim_start();
            continue;
        }
        match c {
            '"' => {
                let (r, s) = string_literal(rest).map_err(|_| bad_token(input, rest))?;
                toks.push(RawTok::Operand(ExprTok::Str(s)));
                rest = r;
            }
            '{' => {
                let (r, path) = variable(rest).map_err(|_| bad_token(input, rest))?;
                if path.iter().any(|seg| seg.is_empty()) {
                    return Err(bad_token(input, rest));
                }
                toks.push(RawTok::Operand(ExprTok::Var(path)));
                rest = r;
            }
            '(' => {
                toks.push(RawTok::LParen);
                rest = &rest[1..];
            }
            ')' => {
                toks.push(RawTok::RParen);
                rest = &rest[1..];
            }
            '+' => {
                toks.push(RawTok::Op(BinOp::Add));
                rest = &rest[1..];
            }
            '*' => {
                toks.push(RawTok::Op(BinOp::Mul));
                rest = &rest[1..];
            }
            '/' => {
                toks.push(RawTok::Op(BinOp::Div));
                rest = &rest[1..];
            }
            '-' => {
                let next_digit = rest[1..].chars().next().is_some_and(|c| c.is_ascii_digit());
                if next_digit && unary_position(&toks) {
                    let (r, d) = number_literal(rest).map_err(|_| bad_token(input, rest))?;
                    toks.push(RawTok::Operand(ExprTok::Number(d)));
                    rest = r;
                } else {
                    toks.push(RawTok::Op(BinOp::Sub));
                    rest = &rest[1..];
                }
            }
            c if c.is_ascii_digit() => {
                let (r, d) = number_literal(rest).map_err(|_| bad_token(input, rest))?;
                toks.push(RawTok::Operand(ExprTok::Number(d)));
                rest = r;
            }
            _ => return Err(bad_token(input, rest)),
        }
    }
    Ok(toks)
}

fn number_literal(input: &str) -> IResult<&str, Decimal> {
    let end = input
        .char_indices()
        .skip(if input.starts_with('-') { 1 } else { 0 })
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(input.len());
    let (num, rest) = input.split_at(end);
    match Decimal::from_str(num) {
        Ok(d) => Ok((rest, d)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Digit,
        ))),
    }
}

fn bad_token(expr: &str, at: &str) -> EngineError {
    let pos = expr.len() - at.len();
    EngineError::Resolution(format!(
        "unparsable expression '{expr}' (at offset {pos})"
    ))
}

/// Shunting-Yard: infix raw tokens → postfix. All four operators are
/// left-associative.
fn to_postfix(expr: &str, toks: Vec<RawTok>) -> Result<Vec<ExprTok>> {
    let mut output = Vec::new();
    let mut ops: Vec<RawTok> = Vec::new();
    // Operand/operator alternation check doubles as an arity check.
    let mut expect_operand = true;

    for tok in toks {
        match tok {
            RawTok::Operand(t) => {
                if !expect_operand {
                    return Err(unbalanced(expr));
                }
                expect_operand = false;
                output.push(t);
            }
            RawTok::Op(op) => {
                if expect_operand {
                    return Err(unbalanced(expr));
                }
                expect_operand = true;
                while let Some(RawTok::Op(top)) = ops.last() {
                    if top.precedence() >= op.precedence() {
                        output.push(ExprTok::Op(*top));
                        ops.pop();
                    } else {
                        break;
                    }
                }
                ops.push(RawTok::Op(op));
            }
            RawTok::LParen => {
                if !expect_operand {
                    return Err(unbalanced(expr));
                }
                ops.push(RawTok::LParen);
            }
            RawTok::RParen => {
                if expect_operand {
                    return Err(unbalanced(expr));
                }
                loop {
                    match ops.pop() {
                        Some(RawTok::Op(op)) => output.push(ExprTok::Op(op)),
                        Some(RawTok::LParen) => break,
                        _ => return Err(unbalanced(expr)),
                    }
                }
            }
        }
    }
    if expect_operand {
        return Err(unbalanced(expr));
    }
    while let Some(tok) = ops.pop() {
        match tok {
            RawTok::Op(op) => output.push(ExprTok::Op(op)),
            _ => return Err(unbalanced(expr)),
        }
    }
    Ok(output)
}

fn unbalanced(expr: &str) -> EngineError {
    EngineError::Resolution(format!("unparsable expression '{expr}'"))
}

impl Expr {
    /// Compile an expression to postfix. Fails on any syntactic problem, so
    /// procedure compilation rejects bad expressions before execution.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(EngineError::Resolution("empty expression".into()));
        }
        let toks = tokenize(raw)?;
        let postfix = to_postfix(raw, toks)?;
        Ok(Self {
            raw: raw.to_string(),
            postfix,
        })
    }
}
