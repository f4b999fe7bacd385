//! Typed runtime values.
//!
//! Every datum the evaluator touches is one of four tagged kinds. Numbers
//! are exact decimals carrying optional precision/scale caps; strings carry
//! an optional max length. Constraint checks run at construction time, so a
//! `Value` that exists is always valid. Arithmetic and comparison dispatch
//! on the LEFT operand's kind; the result of an arithmetic operation
//! inherits the left operand's constraints and is revalidated.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};

/// Comparison operators recognized by the condition language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }
}

/// A tagged, validated runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number {
        value: Decimal,
        precision: Option<u32>,
        scale: Option<u32>,
    },
    Text {
        value: String,
        max_length: Option<usize>,
    },
    Bool(bool),
    DateTime(DateTime<Utc>),
}

/// Fractional digit count of the exact value, trailing zeros ignored.
fn fractional_digits(d: &Decimal) -> u32 {
    d.normalize().scale()
}

fn check_number(d: &Decimal, precision: Option<u32>, scale: Option<u32>) -> Result<()> {
    if let Some(s) = scale {
        let frac = fractional_digits(d);
        if frac > s {
            return Err(EngineError::Validation(format!(
                "value {d} has {frac} fractional digits, scale allows {s}"
            )));
        }
    }
    if let Some(p) = precision {
        let s = scale.unwrap_or(0);
        if s > p {
            return Err(EngineError::Validation(format!(
                "scale {s} exceeds precision {p}"
            )));
        }
        let int_digits = p - s;
        // Decimal tops out below 10^29, so wider caps can never be exceeded.
        if int_digits < 29 {
            let limit = Decimal::from_i128_with_scale(10_i128.pow(int_digits), 0);
            if d.abs() >= limit {
                return Err(EngineError::Validation(format!(
                    "value {d} exceeds precision {p} (scale {s})"
                )));
            }
        }
    }
    Ok(())
}

impl Value {
    // ------------------------------------------------------------------
    // Constructors (validating)
    // ------------------------------------------------------------------

    pub fn number(value: Decimal, precision: Option<u32>, scale: Option<u32>) -> Result<Self> {
        check_number(&value, precision, scale)?;
        Ok(Self::Number {
            value,
            precision,
            scale,
        })
    }

    pub fn number_from_text(
        text: &str,
        precision: Option<u32>,
        scale: Option<u32>,
    ) -> Result<Self> {
        let d = Decimal::from_str(text.trim()).map_err(|e| {
            EngineError::Validation(format!("'{text}' is not a valid number: {e}"))
        })?;
        Self::number(d, precision, scale)
    }

    pub fn text(value: impl Into<String>, max_length: Option<usize>) -> Result<Self> {
        let value = value.into();
        if let Some(max) = max_length {
            let len = value.chars().count();
            if len > max {
                return Err(EngineError::Validation(format!(
                    "string of length {len} exceeds max length {max}"
                )));
            }
        }
        Ok(Self::Text { value, max_length })
    }

    pub fn boolean(value: bool) -> Self {
        Self::Bool(value)
    }

    pub fn datetime(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }

    /// Parse an instant from its textual raw form. RFC-3339 is canonical;
    /// the space-separated and date-only spellings are accepted on input.
    pub fn datetime_from_text(text: &str) -> Result<Self> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(Self::DateTime(dt.with_timezone(&Utc)));
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, fmt) {
                return Ok(Self::DateTime(naive.and_utc()));
            }
        }
        if let Ok(date) = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(Self::DateTime(naive.and_utc()));
            }
        }
        Err(EngineError::Validation(format!(
            "'{text}' is not a valid datetime"
        )))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Number { .. } => "number",
            Self::Text { .. } => "str",
            Self::Bool(_) => "bool",
            Self::DateTime(_) => "datetime",
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Number { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { value, .. } => Some(value),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Raw (storage) form
    // ------------------------------------------------------------------

    /// Canonical storage representation: decimals as text (zero-padded to
    /// the declared scale), strings as text, bools as 0/1, datetimes as
    /// RFC-3339 text.
    pub fn to_raw(&self) -> JsonValue {
        match self {
            Self::Number { value, scale, .. } => JsonValue::String(render_decimal(value, *scale)),
            Self::Text { value, .. } => JsonValue::String(value.clone()),
            Self::Bool(b) => JsonValue::from(if *b { 1_i64 } else { 0 }),
            Self::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
        }
    }

    /// Wrap a raw scalar using this value's kind and constraints. Used when
    /// one side of a comparison arrives untyped.
    pub fn wrap_like(&self, raw: &JsonValue) -> Result<Self> {
        match self {
            Self::Number {
                precision, scale, ..
            } => number_from_raw(raw, *precision, *scale),
            Self::Text { max_length, .. } => text_from_raw(raw, *max_length),
            Self::Bool(_) => bool_from_raw(raw),
            Self::DateTime(_) => datetime_from_raw(raw),
        }
    }

    // ------------------------------------------------------------------
    // Arithmetic (left-kind dispatch)
    // ------------------------------------------------------------------

    pub fn add(&self, rhs: &Value) -> Result<Value> {
        match self {
            Self::Number {
                value,
                precision,
                scale,
            } => {
                let r = rhs_decimal(rhs)?;
                let sum = value
                    .checked_add(r)
                    .ok_or_else(|| EngineError::Validation("numeric overflow in add".into()))?;
                Self::number(sum, *precision, *scale)
            }
            Self::Text { value, max_length } => {
                Self::text(format!("{value}{rhs}"), *max_length)
            }
            other => Err(EngineError::Validation(format!(
                "cannot add to a {} value",
                other.kind_name()
            ))),
        }
    }

    pub fn sub(&self, rhs: &Value) -> Result<Value> {
        let (value, precision, scale) = self.numeric_parts("subtract")?;
        let r = rhs_decimal(rhs)?;
        let diff = value
            .checked_sub(r)
            .ok_or_else(|| EngineError::Validation("numeric overflow in subtract".into()))?;
        Self::number(diff, precision, scale)
    }

    pub fn mul(&self, rhs: &Value) -> Result<Value> {
        let (value, precision, scale) = self.numeric_parts("multiply")?;
        let r = rhs_decimal(rhs)?;
        let prod = value
            .checked_mul(r)
            .ok_or_else(|| EngineError::Validation("numeric overflow in multiply".into()))?;
        Self::number(prod, precision, scale)
    }

    pub fn div(&self, rhs: &Value) -> Result<Value> {
        let (value, precision, scale) = self.numeric_parts("divide")?;
        let r = rhs_decimal(rhs)?;
        if r == Decimal::ZERO {
            return Err(EngineError::Validation("division by zero".into()));
        }
        let quot = value
            .checked_div(r)
            .ok_or_else(|| EngineError::Validation("numeric overflow in divide".into()))?;
        Self::number(quot, precision, scale)
    }

    /// Round to `dp` fractional digits, half-up. Returns a new Number under
    /// the same constraints.
    pub fn round(&self, dp: u32) -> Result<Value> {
        let (value, precision, scale) = self.numeric_parts("round")?;
        let rounded = value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
        Self::number(rounded, precision, scale)
    }

    fn numeric_parts(&self, op: &str) -> Result<(Decimal, Option<u32>, Option<u32>)> {
        match self {
            Self::Number {
                value,
                precision,
                scale,
            } => Ok((*value, *precision, *scale)),
            other => Err(EngineError::Validation(format!(
                "cannot {op} a {} value",
                other.kind_name()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Boolean operations (no short-circuit at this level)
    // ------------------------------------------------------------------

    pub fn not(&self) -> Result<Value> {
        match self {
            Self::Bool(b) => Ok(Self::Bool(!b)),
            other => Err(EngineError::Validation(format!(
                "cannot negate a {} value",
                other.kind_name()
            ))),
        }
    }

    pub fn and(&self, rhs: &Value) -> Result<Value> {
        match (self.as_bool(), rhs.as_bool()) {
            (Some(a), Some(b)) => Ok(Self::Bool(a && b)),
            _ => Err(EngineError::Validation("'and' requires bool operands".into())),
        }
    }

    pub fn or(&self, rhs: &Value) -> Result<Value> {
        match (self.as_bool(), rhs.as_bool()) {
            (Some(a), Some(b)) => Ok(Self::Bool(a || b)),
            _ => Err(EngineError::Validation("'or' requires bool operands".into())),
        }
    }

    // ------------------------------------------------------------------
    // Comparison (left-kind dispatch; raw side wrapped first)
    // ------------------------------------------------------------------

    /// Each kind supports its own operator set: Number the full six, Text
    /// and Bool equality only, DateTime `==`/`>`/`<` on the instant. Any
    /// other pairing is a `ValidationError`, never a silent ordering.
    pub fn compare(&self, op: CmpOp, rhs: &Value) -> Result<bool> {
        match self {
            Self::Number { value, .. } => {
                let r = rhs_decimal(rhs)?;
                Ok(apply_ord(op, value.cmp(&r)))
            }
            Self::Text { value, .. } => {
                let r = match rhs {
                    Self::Text { value, .. } => value.clone(),
                    other => other.to_string(),
                };
                match op {
                    CmpOp::Eq => Ok(*value == r),
                    CmpOp::Ne => Ok(*value != r),
                    _ => Err(EngineError::Validation(
                        "str values only support == and !=".into(),
                    )),
                }
            }
            Self::Bool(a) => match (op, rhs.as_bool()) {
                (CmpOp::Eq, Some(b)) => Ok(*a == b),
                (CmpOp::Ne, Some(b)) => Ok(*a != b),
                (_, Some(_)) => Err(EngineError::Validation(
                    "bool values only support == and !=".into(),
                )),
                (_, None) => Err(EngineError::Validation(
                    "cannot compare bool with non-bool".into(),
                )),
            },
            Self::DateTime(a) => {
                let b = match rhs {
                    Self::DateTime(b) => *b,
                    Self::Text { value, .. } => match Self::datetime_from_text(value)? {
                        Self::DateTime(b) => b,
                        _ => unreachable!(),
                    },
                    other => {
                        return Err(EngineError::Validation(format!(
                            "cannot compare datetime with {}",
                            other.kind_name()
                        )))
                    }
                };
                match op {
                    CmpOp::Eq => Ok(*a == b),
                    CmpOp::Gt => Ok(*a > b),
                    CmpOp::Lt => Ok(*a < b),
                    _ => Err(EngineError::Validation(
                        "datetime values only support ==, > and <".into(),
                    )),
                }
            }
        }
    }
}

fn apply_ord(op: CmpOp, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CmpOp::Eq => ord == Equal,
        CmpOp::Ne => ord != Equal,
        CmpOp::Lt => ord == Less,
        CmpOp::Le => ord != Greater,
        CmpOp::Gt => ord == Greater,
        CmpOp::Ge => ord != Less,
    }
}

/// Right operand of a numeric operation: a Number directly, or text that
/// parses as one (the typed left side selects the kind).
fn rhs_decimal(rhs: &Value) -> Result<Decimal> {
    match rhs {
        Value::Number { value, .. } => Ok(*value),
        Value::Text { value, .. } => Decimal::from_str(value.trim()).map_err(|_| {
            EngineError::Validation(format!("'{value}' is not usable as a number"))
        }),
        other => Err(EngineError::Validation(format!(
            "cannot use a {} value as a number",
            other.kind_name()
        ))),
    }
}

fn render_decimal(d: &Decimal, scale: Option<u32>) -> String {
    match scale {
        Some(s) => {
            let mut v = *d;
            // Construction already capped fractional digits, so this only pads.
            v.rescale(s);
            v.to_string()
        }
        // No declared scale: print the exact decimal as-is, keeping the
        // scale its arithmetic produced ("30.50" + "5.50" renders "36.00").
        None => d.to_string(),
    }
}

// ----------------------------------------------------------------------
// Raw → typed wrapping used by field kinds and comparisons
// ----------------------------------------------------------------------

pub fn number_from_raw(
    raw: &JsonValue,
    precision: Option<u32>,
    scale: Option<u32>,
) -> Result<Value> {
    match raw {
        JsonValue::String(s) => Value::number_from_text(s, precision, scale),
        JsonValue::Number(n) => Value::number_from_text(&n.to_string(), precision, scale),
        other => Err(EngineError::Validation(format!(
            "cannot wrap {other} as a number"
        ))),
    }
}

pub fn text_from_raw(raw: &JsonValue, max_length: Option<usize>) -> Result<Value> {
    match raw {
        JsonValue::String(s) => Value::text(s.clone(), max_length),
        JsonValue::Number(n) => Value::text(n.to_string(), max_length),
        JsonValue::Bool(b) => Value::text(b.to_string(), max_length),
        other => Err(EngineError::Validation(format!(
            "cannot wrap {other} as a string"
        ))),
    }
}

pub fn bool_from_raw(raw: &JsonValue) -> Result<Value> {
    match raw {
        JsonValue::Bool(b) => Ok(Value::Bool(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(EngineError::Validation(format!(
                "{n} is not a valid bool (expected 0 or 1)"
            ))),
        },
        JsonValue::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(EngineError::Validation(format!(
                "'{s}' is not a valid bool"
            ))),
        },
        other => Err(EngineError::Validation(format!(
            "cannot wrap {other} as a bool"
        ))),
    }
}

pub fn datetime_from_raw(raw: &JsonValue) -> Result<Value> {
    match raw {
        JsonValue::String(s) => Value::datetime_from_text(s),
        other => Err(EngineError::Validation(format!(
            "cannot wrap {other} as a datetime"
        ))),
    }
}

impl fmt::Display for Value {
    /// Textual form used for concatenation and messages. Numbers render in
    /// their canonical storage form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number { value, scale, .. } => write!(f, "{}", render_decimal(value, *scale)),
            Self::Text { value, .. } => write!(f, "{value}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn num(s: &str, p: Option<u32>, sc: Option<u32>) -> Value {
        Value::number_from_text(s, p, sc).unwrap()
    }

    #[test]
    fn scale_rejects_excess_fractional_digits() {
        assert!(Value::number_from_text("1.234", None, Some(2)).is_err());
        // Trailing zeros do not count against the scale.
        assert!(Value::number_from_text("1.230", None, Some(2)).is_ok());
    }

    #[test]
    fn precision_caps_magnitude() {
        // number[5.2]: |v| must stay below 10^3
        assert!(Value::number_from_text("999.99", Some(5), Some(2)).is_ok());
        assert!(Value::number_from_text("1000.00", Some(5), Some(2)).is_err());
        assert!(Value::number_from_text("-1000.00", Some(5), Some(2)).is_err());
    }

    #[test]
    fn scaled_raw_form_is_zero_padded() {
        let v = num("100.5", Some(10), Some(2));
        assert_eq!(v.to_raw(), JsonValue::String("100.50".into()));
        // Without a declared scale the exact decimal prints as-is.
        let bare = num("100.50", None, None);
        assert_eq!(bare.to_raw(), JsonValue::String("100.50".into()));
        let sum = num("30.50", None, None).add(&num("5.50", None, None)).unwrap();
        assert_eq!(sum.to_raw(), JsonValue::String("36.00".into()));
    }

    #[test]
    fn arithmetic_inherits_left_constraints() {
        let a = num("10.50", Some(10), Some(2));
        let b = num("20.00", Some(10), Some(2));
        let sum = a.add(&b).unwrap();
        assert_eq!(sum.to_raw(), JsonValue::String("30.50".into()));

        // 10.50 * 0.333 would need 5 fractional digits: rejected, not rounded.
        let c = num("0.333", None, None);
        assert!(a.mul(&c).is_err());
    }

    #[test]
    fn division_rejects_zero_and_inexact_results() {
        let a = num("100.00", Some(10), Some(2));
        assert!(a.div(&num("0", None, None)).is_err());
        assert!(a.div(&num("3", None, None)).is_err());
        let half = a.div(&num("4", None, None)).unwrap();
        assert_eq!(half.to_raw(), JsonValue::String("25.00".into()));
    }

    #[test]
    fn round_half_up() {
        let v = num("2.345", None, None).round(2).unwrap();
        assert_eq!(v.as_decimal().unwrap().to_string(), "2.35");
        let n = num("-2.345", None, None).round(2).unwrap();
        assert_eq!(n.as_decimal().unwrap().to_string(), "-2.35");
    }

    #[test]
    fn string_concat_and_max_length() {
        let s = Value::text("ab", Some(5)).unwrap();
        let joined = s.add(&Value::text("cde", None).unwrap()).unwrap();
        assert_eq!(joined.as_text(), Some("abcde"));
        assert!(joined.add(&Value::text("!", None).unwrap()).is_err());
    }

    #[test]
    fn strings_compare_by_equality_only() {
        let a = Value::text("Axe", None).unwrap();
        let b = Value::text("Sword", None).unwrap();
        assert!(a.compare(CmpOp::Ne, &b).unwrap());
        assert!(a.compare(CmpOp::Eq, &a.clone()).unwrap());
        // No lexicographic ordering on str values.
        assert!(a.compare(CmpOp::Lt, &b).is_err());
        assert!(a.compare(CmpOp::Ge, &b).is_err());
    }

    #[test]
    fn comparison_wraps_raw_side_by_left_kind() {
        let n = num("7", None, None);
        let wrapped = n.wrap_like(&JsonValue::String("10".into())).unwrap();
        assert!(n.compare(CmpOp::Lt, &wrapped).unwrap());
        assert!(!n.compare(CmpOp::Gt, &wrapped).unwrap());
    }

    #[test]
    fn number_compares_against_text_rhs() {
        let n = num("20", None, None);
        let t = Value::text("10", None).unwrap();
        // Left kind selects the operation: "10" parses as a number.
        assert!(n.compare(CmpOp::Gt, &t).unwrap());
    }

    #[test]
    fn bool_ops() {
        let t = Value::boolean(true);
        let f = Value::boolean(false);
        assert_eq!(t.and(&f).unwrap().as_bool(), Some(false));
        assert_eq!(t.or(&f).unwrap().as_bool(), Some(true));
        assert_eq!(f.not().unwrap().as_bool(), Some(true));
        assert!(t.compare(CmpOp::Lt, &f).is_err());
    }

    #[test]
    fn datetime_parsing_and_comparison() {
        let a = Value::datetime_from_text("2024-01-01T00:00:00Z").unwrap();
        let b = Value::datetime_from_text("2024-06-15 12:30:00").unwrap();
        assert!(a.compare(CmpOp::Lt, &b).unwrap());
        assert!(b.compare(CmpOp::Gt, &a).unwrap());
        assert!(a.compare(CmpOp::Eq, &a.clone()).unwrap());
        // Only ==, > and < are defined on instants.
        assert!(a.compare(CmpOp::Le, &b).is_err());
        assert!(a.compare(CmpOp::Ne, &b).is_err());
    }

    #[test]
    fn bool_raw_form_is_zero_one() {
        assert_eq!(Value::boolean(true).to_raw(), JsonValue::from(1_i64));
        assert_eq!(bool_from_raw(&JsonValue::from(0_i64)).unwrap(), Value::Bool(false));
    }
}
