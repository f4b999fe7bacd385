//! Procedure parser.
//!
//! Line-oriented: every non-blank, non-comment line inside a procedure is
//! classified by its leading keyword and its clause grammar parsed with nom.
//! Blocks (`If`, `For Each`) own the lines indented beneath their header;
//! a line indented at or above an open header closes that block.
//!
//! Expression text embedded in a clause is consumed with `expr_text`, which
//! treats quoted strings, `{…}` variables, and balanced `(…)`/`[…]` groups
//! as atoms — a keyword inside a string literal never terminates a clause.

use nom::{
    branch::alt,
    bytes::complete::{escaped, tag, take_until},
    character::complete::{alpha1, alphanumeric1, anychar, char as nom_char, multispace0, multispace1, none_of},
    combinator::{eof, opt, peek, recognize, rest},
    multi::{many0, many_till, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded},
    IResult,
};
use tracing::debug;

use super::ast::{
    Condition, Expr, Node, Param, ParamKind, ProcedureDef, RawProcedure, SourceLine, Statement,
};
use crate::error::{EngineError, Result};
use crate::schema::types::FieldKind;
use crate::value::CmpOp;

/// Compile one raw procedure block into its definition.
pub fn compile(raw: &RawProcedure) -> Result<ProcedureDef> {
    let params = parse_params(&raw.params_raw, &raw.name)?;
    let mut idx = 0;
    let body = parse_block(&raw.lines, &mut idx, 0)?;
    if idx < raw.lines.len() {
        let line = &raw.lines[idx];
        return Err(EngineError::Resolution(format!(
            "procedure '{}': unexpected indentation at line {}: '{}'",
            raw.name, line.number, line.text
        )));
    }
    debug!(procedure = %raw.name, statements = body.len(), "compiled procedure");
    Ok(ProcedureDef {
        name: raw.name.clone(),
        params,
        body,
    })
}

// ----------------------------------------------------------------------
// Shared nom primitives
// ----------------------------------------------------------------------

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

/// An identifier with an optional `[...]` suffix (`number[10.2]`,
/// `List[Post]`).
fn type_token(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        identifier,
        opt(delimited(nom_char('['), take_until("]"), nom_char(']'))),
    ))(input)
}

/// A complete double-quoted string literal, backslash escapes included.
fn string_chunk(input: &str) -> IResult<&str, &str> {
    recognize(delimited(
        nom_char('"'),
        escaped(none_of("\\\""), '\\', anychar),
        nom_char('"'),
    ))(input)
}

/// A `{var.path}` reference, consumed atomically.
fn variable_chunk(input: &str) -> IResult<&str, &str> {
    recognize(delimited(nom_char('{'), take_until("}"), nom_char('}')))(input)
}

/// A balanced `(…)` group; nested groups and string literals inside it are
/// consumed whole.
fn paren_group(input: &str) -> IResult<&str, &str> {
    recognize(delimited(
        nom_char('('),
        many0(alt((
            paren_group,
            bracket_group,
            string_chunk,
            recognize(none_of("()\"")),
        ))),
        nom_char(')'),
    ))(input)
}

/// A balanced `[…]` group.
fn bracket_group(input: &str) -> IResult<&str, &str> {
    recognize(delimited(
        nom_char('['),
        many0(alt((
            paren_group,
            bracket_group,
            string_chunk,
            recognize(none_of("[]\"")),
        ))),
        nom_char(']'),
    ))(input)
}

/// One atom of expression text.
fn expr_chunk(input: &str) -> IResult<&str, &str> {
    alt((
        string_chunk,
        variable_chunk,
        paren_group,
        bracket_group,
        recognize(anychar),
    ))(input)
}

/// Succeeds (consuming nothing) at end of input or in front of one of the
/// stop phrases.
fn stop_at<'a>(stops: &'static [&'static str]) -> impl FnMut(&'a str) -> IResult<&'a str, ()> {
    move |input: &'a str| {
        if input.is_empty() || stops.iter().any(|s| input.starts_with(s)) {
            Ok((input, ()))
        } else {
            Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        }
    }
}

/// Expression text up to (not including) the first stop phrase that sits
/// outside any string/variable/group atom, or to end of input.
fn expr_text<'a>(
    stops: &'static [&'static str],
) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    move |input: &'a str| {
        let (remaining, _) = many_till(expr_chunk, peek(stop_at(stops)))(input)?;
        Ok((remaining, &input[..input.len() - remaining.len()]))
    }
}

// ----------------------------------------------------------------------
// Parameters
// ----------------------------------------------------------------------

/// `type:name (default?)`, comma-separated; commas inside `[...]` or a
/// parenthesized default never split.
fn param(input: &str) -> IResult<&str, (&str, &str, Option<&str>)> {
    let (input, type_tok) = preceded(multispace0, type_token)(input)?;
    let (input, name) = preceded(nom_char(':'), identifier)(input)?;
    let (input, default) = opt(preceded(
        multispace0,
        delimited(nom_char('('), take_until(")"), nom_char(')')),
    ))(input)?;
    let (input, _) = multispace0(input)?;
    Ok((input, (type_tok, name, default)))
}

fn params_list(input: &str) -> IResult<&str, Vec<(&str, &str, Option<&str>)>> {
    let (input, params) = separated_list0(nom_char(','), param)(input)?;
    let (input, _) = pair(multispace0, eof)(input)?;
    Ok((input, params))
}

pub fn parse_params(raw: &str, proc_name: &str) -> Result<Vec<Param>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let (_, parsed) = params_list(raw).map_err(|_| {
        EngineError::Resolution(format!(
            "procedure '{proc_name}': malformed parameter list '{raw}'"
        ))
    })?;
    let mut params = Vec::new();
    for (type_tok, name, default) in parsed {
        params.push(Param {
            name: name.to_string(),
            kind: parse_param_kind(type_tok)?,
            default: default.map(|d| d.trim().to_string()),
        });
    }
    Ok(params)
}

fn parse_param_kind(type_tok: &str) -> Result<ParamKind> {
    let lower = type_tok.to_ascii_lowercase();
    if let Some(inner) = lower
        .strip_prefix("list[")
        .and_then(|rest| rest.strip_suffix(']'))
    {
        return Ok(ParamKind::List(inner.to_string()));
    }
    Ok(ParamKind::Scalar(FieldKind::parse(type_tok)?))
}

// ----------------------------------------------------------------------
// Statement tree
// ----------------------------------------------------------------------

/// Parse statements indented deeper than `parent_indent`, consuming lines
/// until one returns to or above the parent level.
fn parse_block(
    lines: &[SourceLine],
    idx: &mut usize,
    parent_indent: usize,
) -> Result<Vec<Statement>> {
    let mut block = Vec::new();
    while *idx < lines.len() {
        let line = &lines[*idx];
        if line.indent <= parent_indent {
            break;
        }
        *idx += 1;
        let node = classify(line)?;
        let node = match node {
            Pending::Leaf(node) => node,
            Pending::If(cond) => Node::If {
                cond,
                body: parse_block(lines, idx, line.indent)?,
            },
            Pending::ForEach { item, list } => Node::ForEach {
                item,
                list,
                body: parse_block(lines, idx, line.indent)?,
            },
        };
        block.push(Statement {
            line: line.number,
            indent: line.indent,
            node,
        });
    }
    Ok(block)
}

/// A classified line: either a complete leaf node, or a block header whose
/// body is parsed by the caller.
enum Pending {
    Leaf(Node),
    If(Condition),
    ForEach { item: String, list: Expr },
}

/// Attach the source line to a parse failure's message.
fn with_line(e: EngineError, number: usize, text: &str) -> EngineError {
    match e {
        EngineError::Resolution(msg) => {
            EngineError::Resolution(format!("line {number}: {msg} ('{text}')"))
        }
        other => other,
    }
}

fn classify(line: &SourceLine) -> Result<Pending> {
    let text = line.text.trim_end();
    let err = |msg: &str| {
        EngineError::Resolution(format!("line {}: {} ('{}')", line.number, msg, text))
    };

    if let Some(clause) = text.strip_prefix("Get ") {
        let (_, (entity, id_text, alias)) = get_clause(clause)
            .map_err(|_| err("'Get' expects [a|an|the] ENTITY by id of EXPR as ALIAS"))?;
        return Ok(Pending::Leaf(Node::Get {
            entity: entity.to_string(),
            id: Expr::parse(id_text).map_err(|e| with_line(e, line.number, text))?,
            alias: alias.to_string(),
        }));
    }
    if let Some(clause) = text.strip_prefix("Create ") {
        let (_, (entity, assignments, alias)) = create_clause(clause)
            .map_err(|_| err("'Create' expects [a|an] ENTITY with FIELD of EXPR [and …] [as ALIAS]"))?;
        let mut compiled = Vec::with_capacity(assignments.len());
        for (field, expr_raw) in assignments {
            compiled.push((
                field.to_string(),
                Expr::parse(expr_raw).map_err(|e| with_line(e, line.number, text))?,
            ));
        }
        return Ok(Pending::Leaf(Node::Create {
            entity: entity.to_string(),
            assignments: compiled,
            alias: alias.map(str::to_string),
        }));
    }
    if let Some(clause) = text.strip_prefix("Update ") {
        let (_, (alias, assignments)) = update_clause(clause)
            .map_err(|_| err("'Update' expects [the] ALIAS to set FIELD = EXPR [, …]"))?;
        let mut compiled = Vec::with_capacity(assignments.len());
        for (field, expr_raw) in assignments {
            compiled.push((
                field.to_string(),
                Expr::parse(expr_raw).map_err(|e| with_line(e, line.number, text))?,
            ));
        }
        return Ok(Pending::Leaf(Node::Update {
            alias: alias.to_string(),
            assignments: compiled,
        }));
    }
    if let Some(clause) = text.strip_prefix("Set ") {
        let (_, (var, expr_raw)) =
            set_clause(clause).map_err(|_| err("'Set' expects {VAR} = EXPR"))?;
        return Ok(Pending::Leaf(Node::Set {
            var: var.to_string(),
            expr: Expr::parse(expr_raw).map_err(|e| with_line(e, line.number, text))?,
        }));
    }
    if let Some(clause) = text.strip_prefix("If ") {
        let cond = clause
            .strip_suffix(':')
            .ok_or_else(|| err("'If' header must end with ':'"))?;
        return Ok(Pending::If(
            parse_condition(cond).map_err(|e| with_line(e, line.number, text))?,
        ));
    }
    if let Some(clause) = text.strip_prefix("For Each ") {
        let clause = clause
            .strip_suffix(':')
            .ok_or_else(|| err("'For Each' header must end with ':'"))?;
        let (_, (item, list)) = for_each_clause(clause)
            .map_err(|_| err("'For Each' expects ITEM in EXPR"))?;
        return Ok(Pending::ForEach {
            item: item.to_string(),
            list: Expr::parse(list).map_err(|e| with_line(e, line.number, text))?,
        });
    }
    if text == "return" {
        return Ok(Pending::Leaf(Node::Return { expr: None }));
    }
    if let Some(clause) = text.strip_prefix("return ") {
        return Ok(Pending::Leaf(Node::Return {
            expr: Some(Expr::parse(clause).map_err(|e| with_line(e, line.number, text))?),
        }));
    }
    // Escape hatch: keep the raw text, evaluated as a bare expression.
    Ok(Pending::Leaf(Node::Raw {
        text: text.to_string(),
    }))
}

// ----------------------------------------------------------------------
// Clause grammars (nom)
// ----------------------------------------------------------------------

/// `[a|an|the] ENTITY by id of EXPR as ALIAS`
fn get_clause(input: &str) -> IResult<&str, (&str, &str, &str)> {
    let (input, _) = multispace0(input)?;
    let (input, _) = opt(alt((tag("a "), tag("an "), tag("the "))))(input)?;
    let (input, entity) = identifier(input)?;
    let (input, _) = delimited(multispace1, tag("by id of"), multispace1)(input)?;
    let (input, id_text) = expr_text(&[" as "])(input)?;
    let (input, _) = tag(" as ")(input)?;
    let (input, alias) = delimited(multispace0, identifier, pair(multispace0, eof))(input)?;
    Ok((input, (entity, id_text, alias)))
}

/// `FIELD of EXPR`, terminated by the next top-level `and`/`as`.
fn create_assignment(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, field) = preceded(multispace0, identifier)(input)?;
    let (input, _) = tag(" of ")(input)?;
    let (input, expr_raw) = expr_text(&[" and ", " as "])(input)?;
    Ok((input, (field, expr_raw)))
}

/// `[a|an] ENTITY with FIELD of EXPR [and …] [as ALIAS]`, or the bare
/// `[a|an] ENTITY as ALIAS`.
#[allow(clippy::type_complexity)]
fn create_clause(input: &str) -> IResult<&str, (&str, Vec<(&str, &str)>, Option<&str>)> {
    let (input, _) = multispace0(input)?;
    let (input, _) = opt(alt((tag("a "), tag("an "))))(input)?;
    let (input, entity) = identifier(input)?;
    let (input, clause) = alt((
        preceded(tag(" with "), create_with_tail),
        preceded(tag(" as "), create_bare_tail),
    ))(input)?;
    let (assignments, alias) = clause;
    Ok((input, (entity, assignments, alias)))
}

#[allow(clippy::type_complexity)]
fn create_with_tail(input: &str) -> IResult<&str, (Vec<(&str, &str)>, Option<&str>)> {
    let (input, assignments) = separated_list1(tag(" and "), create_assignment)(input)?;
    let (input, alias) = opt(preceded(
        tag(" as "),
        delimited(multispace0, identifier, multispace0),
    ))(input)?;
    let (input, _) = pair(multispace0, eof)(input)?;
    Ok((input, (assignments, alias)))
}

#[allow(clippy::type_complexity)]
fn create_bare_tail(input: &str) -> IResult<&str, (Vec<(&str, &str)>, Option<&str>)> {
    let (input, alias) = delimited(multispace0, identifier, pair(multispace0, eof))(input)?;
    Ok((input, (Vec::new(), Some(alias))))
}

/// `FIELD = EXPR`, terminated by the next top-level comma.
fn update_assignment(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, field) = delimited(multispace0, identifier, multispace0)(input)?;
    let (input, _) = nom_char('=')(input)?;
    let (input, expr_raw) = expr_text(&[","])(input)?;
    Ok((input, (field, expr_raw)))
}

/// `[the] ALIAS to set FIELD = EXPR [, FIELD = EXPR]*`
#[allow(clippy::type_complexity)]
fn update_clause(input: &str) -> IResult<&str, (&str, Vec<(&str, &str)>)> {
    let (input, _) = multispace0(input)?;
    let (input, _) = opt(tag("the "))(input)?;
    let (input, alias) = identifier(input)?;
    let (input, _) = tag(" to set ")(input)?;
    let (input, assignments) = separated_list1(nom_char(','), update_assignment)(input)?;
    let (input, _) = pair(multispace0, eof)(input)?;
    Ok((input, (alias, assignments)))
}

/// `{VAR} = EXPR` — the target must be a plain variable, not a path.
fn set_clause(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, var) = preceded(
        multispace0,
        delimited(nom_char('{'), identifier, nom_char('}')),
    )(input)?;
    let (input, _) = preceded(multispace0, nom_char('='))(input)?;
    let (input, expr_raw) = rest(input)?;
    Ok((input, (var, expr_raw)))
}

/// `ITEM in EXPR` (the trailing ':' is stripped by the caller).
fn for_each_clause(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, item) = delimited(multispace0, identifier, multispace1)(input)?;
    let (input, _) = tag("in ")(input)?;
    let (input, list) = rest(input)?;
    Ok((input, (item, list)))
}

// ----------------------------------------------------------------------
// Conditions
// ----------------------------------------------------------------------

/// Rewrites of the natural-language comparison spellings, longest first.
const CONDITION_REWRITES: &[(&str, &str)] = &[
    (" is greater than or equal to ", " >= "),
    (" is less than or equal to ", " <= "),
    (" is not equal to ", " != "),
    (" is greater than ", " > "),
    (" is less than ", " < "),
    (" is equal to ", " == "),
];

const COMPARISON_OPS: &[&str] = &["==", "!=", "<=", ">=", "<", ">"];

/// `LHS op RHS` with the operator at nesting depth zero. Fails when the
/// text carries no operator (a bare boolean condition).
fn comparison_clause(input: &str) -> IResult<&str, (&str, &str, &str)> {
    let (input, lhs) = expr_text(COMPARISON_OPS)(input)?;
    let (rhs, op) = alt((
        tag("=="),
        tag("!="),
        tag("<="),
        tag(">="),
        tag("<"),
        tag(">"),
    ))(input)?;
    Ok(("", (lhs, op, rhs)))
}

pub fn parse_condition(text: &str) -> Result<Condition> {
    let mut normalized = text.trim().to_string();
    for (phrase, op) in CONDITION_REWRITES {
        normalized = normalized.replace(phrase, op);
    }

    match comparison_clause(&normalized) {
        Ok((_, (lhs, op, rhs))) => {
            let op = CmpOp::parse(op).expect("operator table is exhaustive");
            Ok(Condition::Compare {
                lhs: Expr::parse(lhs)?,
                op,
                rhs: Expr::parse(rhs)?,
            })
        }
        Err(_) => Ok(Condition::Bare(Expr::parse(&normalized)?)),
    }
}
