//! Procedure AST.
//!
//! A procedure body parses into a statement tree. Statements keep the
//! indent level of their source line; `If` and `For Each` own the indented
//! block beneath them. Expressions are compiled to postfix at parse time so
//! every syntactic failure is raised before a procedure can touch storage.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::schema::types::FieldKind;
use crate::value::CmpOp;

/// One non-blank, non-comment line of procedure source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLine {
    /// 1-based line number in the combined source text.
    pub number: usize,
    pub indent: usize,
    pub text: String,
}

/// A procedure block as split out of the combined source text: header
/// parsed, body lines untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProcedure {
    pub name: String,
    pub params_raw: String,
    pub header_line: usize,
    pub lines: Vec<SourceLine>,
}

/// Declared parameter kind: a scalar field kind, or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamKind {
    Scalar(FieldKind),
    /// `List[Inner]` — the inner token is kept for diagnostics only; list
    /// elements are wrapped by their own JSON shape.
    List(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    /// Textual default, parsed lazily against the declared kind.
    pub default: Option<String>,
}

/// One postfix token of a compiled expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprTok {
    Number(Decimal),
    Str(String),
    /// `{root.path…}` — at least one segment.
    Var(Vec<String>),
    Op(BinOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Add | Self::Sub => 1,
            Self::Mul | Self::Div => 2,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Self::Add => '+',
            Self::Sub => '-',
            Self::Mul => '*',
            Self::Div => '/',
        }
    }
}

/// A compiled expression: the source text plus its postfix form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub raw: String,
    pub postfix: Vec<ExprTok>,
}

/// A compiled condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Compare { lhs: Expr, op: CmpOp, rhs: Expr },
    /// A bare expression; must evaluate to a Bool.
    Bare(Expr),
}

/// A statement with its source position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub line: usize,
    pub indent: usize,
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Get {
        entity: String,
        id: Expr,
        alias: String,
    },
    Create {
        entity: String,
        assignments: Vec<(String, Expr)>,
        alias: Option<String>,
    },
    Update {
        alias: String,
        assignments: Vec<(String, Expr)>,
    },
    Set {
        var: String,
        expr: Expr,
    },
    If {
        cond: Condition,
        body: Vec<Statement>,
    },
    ForEach {
        item: String,
        list: Expr,
        body: Vec<Statement>,
    },
    Return {
        expr: Option<Expr>,
    },
    /// Escape hatch: an unclassified line, evaluated as a bare expression.
    Raw {
        text: String,
    },
}

/// A fully compiled procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Statement>,
}
