//! Condition expression language used by `{{#if}}` / `{{#unless}}` blocks.
//!
//! Grammar, tried in this order on the trimmed input:
//! ```text
//! Condition  ::= Clause ( '&&' Clause )*          -- if the text contains "&&"
//!              | Clause ( '||' Clause )*          -- else if it contains "||"
//!              | '!' Condition
//!              | Operand Operator Operand
//!              | Operand                          -- truthiness
//! Operator   ::= '==' | '!=' | '<=' | '>=' | '<' | '>'
//! Operand    ::= QuotedString | Number | 'true' | 'false' | 'null' | 'undefined' | Path
//! ```
//!
//! Splitting is a plain substring split: it is not parenthesis-aware and `&&` is
//! split before `||`, so `a && b || c` parses as `a && (b || c)`. Mixed-operator
//! conditions are therefore unsupported.

use std::cmp::Ordering;

use serde_json::Value;

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionExpr {
    All(Vec<ConditionExpr>),
    Any(Vec<ConditionExpr>),
    Not(Box<ConditionExpr>),
    Compare {
        left: Operand,
        operator: Operator,
        right: Operand,
    },
    Truthy(Operand),
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path(String),
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
}

// Longest tokens first so `<=` is not read as `<`.
const OPERATORS: &[(&str, Operator)] = &[
    ("==", Operator::Eq),
    ("!=", Operator::NotEq),
    ("<=", Operator::LtEq),
    (">=", Operator::GtEq),
    ("<", Operator::Lt),
    (">", Operator::Gt),
];

/// Parse a condition string. Parsing never fails: anything that is not an
/// operator expression is treated as an operand tested for truthiness.
pub fn parse_condition(input: &str) -> ConditionExpr {
    let trimmed = input.trim();

    if trimmed.contains("&&") {
        return ConditionExpr::All(trimmed.split("&&").map(parse_condition).collect());
    }
    if trimmed.contains("||") {
        return ConditionExpr::Any(trimmed.split("||").map(parse_condition).collect());
    }
    if let Some(rest) = trimmed.strip_prefix('!') {
        if !rest.starts_with('=') {
            return ConditionExpr::Not(Box::new(parse_condition(rest)));
        }
    }
    if let Some((pos, operator, len)) = find_operator(trimmed) {
        return ConditionExpr::Compare {
            left: parse_operand(&trimmed[..pos]),
            operator,
            right: parse_operand(&trimmed[pos + len..]),
        };
    }
    ConditionExpr::Truthy(parse_operand(trimmed))
}

fn find_operator(input: &str) -> Option<(usize, Operator, usize)> {
    // Scan for an operator, skipping quoted regions.
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            _ => {
                if input.is_char_boundary(i) {
                    let tail = &input[i..];
                    for (token, op) in OPERATORS {
                        if tail.starts_with(token) {
                            return Some((i, *op, token.len()));
                        }
                    }
                }
                i += 1;
            }
        }
    }
    None
}

fn parse_operand(raw: &str) -> Operand {
    let s = raw.trim();
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[s.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[s.len() - 1] == b'\'')
        {
            return Operand::Literal(Value::String(s[1..s.len() - 1].to_string()));
        }
    }
    match s {
        "true" => return Operand::Literal(Value::Bool(true)),
        "false" => return Operand::Literal(Value::Bool(false)),
        "null" | "undefined" | "" => return Operand::Literal(Value::Null),
        _ => {}
    }
    if let Ok(n) = s.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return Operand::Literal(Value::Number(num));
        }
    }
    Operand::Path(s.to_string())
}

/// Evaluate a condition against values provided by a resolver function.
///
/// `resolve` maps a token path (e.g. `"globals.flag"`) to its value, or `None`
/// when the path is unresolved.
pub fn evaluate_condition(expr: &ConditionExpr, resolve: &dyn Fn(&str) -> Option<Value>) -> bool {
    match expr {
        ConditionExpr::All(clauses) => clauses.iter().all(|c| evaluate_condition(c, resolve)),
        ConditionExpr::Any(clauses) => clauses.iter().any(|c| evaluate_condition(c, resolve)),
        ConditionExpr::Not(inner) => !evaluate_condition(inner, resolve),
        ConditionExpr::Truthy(operand) => is_truthy(&operand_value(operand, resolve)),
        ConditionExpr::Compare {
            left,
            operator,
            right,
        } => {
            let l = operand_value(left, resolve);
            let r = operand_value(right, resolve);
            match operator {
                Operator::Eq => loose_eq(&l, &r),
                Operator::NotEq => !loose_eq(&l, &r),
                Operator::Lt => loose_cmp(&l, &r) == Some(Ordering::Less),
                Operator::Gt => loose_cmp(&l, &r) == Some(Ordering::Greater),
                Operator::LtEq => matches!(
                    loose_cmp(&l, &r),
                    Some(Ordering::Less | Ordering::Equal)
                ),
                Operator::GtEq => matches!(
                    loose_cmp(&l, &r),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
            }
        }
    }
}

fn operand_value(operand: &Operand, resolve: &dyn Fn(&str) -> Option<Value>) -> Value {
    match operand {
        Operand::Literal(v) => v.clone(),
        Operand::Path(p) => resolve(p).unwrap_or(Value::Null),
    }
}

/// Truthiness: `null`, `false`, `0`, `NaN` and `""` are false. Arrays and
/// objects are true even when empty.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Loose equality: numeric when both sides read as numbers, textual otherwise.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => scalar_text(a) == scalar_text(b),
        },
    }
}

fn loose_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(scalar_text(a).cmp(&scalar_text(b))),
    }
}
