//! The expression DSL used in `selectwhere`, selection `expr`, and `{{…}}`
//! template interpolation.
//!
//! The operator scan below is a deliberate, documented weak spot: it finds the
//! first left-to-right occurrence of each operator in decreasing-precedence
//! order, without regard to parentheses or string-literal boundaries. Existing
//! manifests depend on this exact behavior and it is preserved rather than
//! "fixed" — see the evaluation order in `split_binary`.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde_json::Value;

use crate::context::EvalContext;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unresolved variable `{0}`")]
    UnresolvedVariable(String),
    #[error("malformed expression: {0}")]
    Malformed(String),
}

/// Operators in decreasing precedence order, matching the outermost split
/// that the parser attempts first. Listed widest-to-narrowest exactly as the
/// grammar in spec.md §4.1 enumerates them.
const OPERATORS: &[&str] = &[
    "||", "&&", "==", "!=", ">=", "<=", ">", "<", "+", "-", "*", "/",
];

pub fn interpolate(template: &str, ctx: &EvalContext) -> Result<String, Error> {
    interpolate_inner(template, ctx, false)
}

/// Same as [`interpolate`] but leaves unresolved `{{…}}` placeholders intact
/// instead of raising an error — used for the executor's URL pre-check.
pub fn interpolate_lenient(template: &str, ctx: &EvalContext) -> String {
    interpolate_inner(template, ctx, true).unwrap_or_else(|_| template.to_string())
}

fn interpolate_inner(template: &str, ctx: &EvalContext, lenient: bool) -> Result<String, Error> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        match rest.find("{{") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + 2..];
                match after.find("}}") {
                    None => {
                        out.push_str(&rest[start..]);
                        break;
                    }
                    Some(end) => {
                        let name = after[..end].trim();
                        match resolve_variable(name, ctx) {
                            Ok(value) => out.push_str(&value_to_string(&value)),
                            Err(e) => {
                                if lenient {
                                    out.push_str("{{");
                                    out.push_str(name);
                                    out.push_str("}}");
                                } else {
                                    return Err(e);
                                }
                            }
                        }
                        rest = &after[end + 2..];
                    }
                }
            }
        }
    }
    Ok(out)
}

pub fn resolve_variable(name: &str, ctx: &EvalContext) -> Result<Value, Error> {
    if let Some(v) = ctx.system_variable(name) {
        return Ok(v);
    }
    if let Some(v) = ctx.authy_value(name) {
        return Ok(v);
    }
    if let Some(v) = ctx.extracted_data.get(name) {
        return Ok(v.clone());
    }
    if let Some(v) = ctx.credentials.get(name) {
        return Ok(Value::String(v.clone()));
    }
    Err(Error::UnresolvedVariable(name.to_string()))
}

pub fn eval(source: &str, ctx: &EvalContext) -> Result<Value, Error> {
    let trimmed = source.trim();
    eval_expr(trimmed, ctx)
}

pub fn eval_truthy(source: &str, ctx: &EvalContext) -> Result<bool, Error> {
    Ok(truthy(&eval(source, ctx)?))
}

fn eval_expr(s: &str, ctx: &EvalContext) -> Result<Value, Error> {
    let s = strip_outer_parens(s.trim());

    if let Some((left, op, right)) = split_binary(s) {
        let lv = eval_expr(left, ctx)?;
        let rv = eval_expr(right, ctx)?;
        return Ok(apply_binary(op, &lv, &rv));
    }

    if let Some(v) = try_literal(s) {
        return Ok(v);
    }

    if let Some((name, args)) = try_call(s) {
        let mut arg_values = Vec::with_capacity(args.len());
        for a in args {
            arg_values.push(eval_expr(a.trim(), ctx)?);
        }
        return call_builtin(name, arg_values);
    }

    resolve_variable(s, ctx)
}

/// Strips one layer of matching outer parentheses, if the whole string is
/// wrapped by a single balanced pair.
fn strip_outer_parens(s: &str) -> &str {
    if !s.starts_with('(') || !s.ends_with(')') {
        return s;
    }
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 && i != bytes.len() - 1 {
                    return s;
                }
            }
            _ => {}
        }
    }
    strip_outer_parens(s[1..s.len() - 1].trim())
}

/// Finds the first textual occurrence of each operator, tried in the
/// precedence order given in `OPERATORS`, and splits there. Deliberately does
/// not track quote or paren nesting — see module docs.
fn split_binary(s: &str) -> Option<(&str, &str, &str)> {
    for op in OPERATORS {
        if let Some(idx) = s.find(op) {
            // Don't let unary minus on a number literal masquerade as subtraction:
            // only split if there is a non-empty left-hand side.
            if idx == 0 {
                continue;
            }
            let left = s[..idx].trim();
            let right = s[idx + op.len()..].trim();
            if left.is_empty() || right.is_empty() {
                continue;
            }
            return Some((left, op, right));
        }
    }
    None
}

fn try_literal(s: &str) -> Option<Value> {
    if s == "true" {
        return Some(Value::Bool(true));
    }
    if s == "false" {
        return Some(Value::Bool(false));
    }
    if s == "null" {
        return Some(Value::Null);
    }
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        return Some(Value::String(s[1..s.len() - 1].to_string()));
    }
    if is_number_literal(s) {
        return s.parse::<f64>().ok().and_then(|n| serde_json::Number::from_f64(n)).map(Value::Number);
    }
    None
}

fn is_number_literal(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let mut chars = s.chars().peekable();
    if chars.peek() == Some(&'-') {
        chars.next();
    }
    let rest: String = chars.collect();
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit() || c == '.')
        && rest.matches('.').count() <= 1
}

fn try_call(s: &str) -> Option<(&str, Vec<&str>)> {
    let open = s.find('(')?;
    if !s.ends_with(')') {
        return None;
    }
    let name = &s[..open];
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    let inner = &s[open + 1..s.len() - 1];
    if inner.trim().is_empty() {
        return Some((name, Vec::new()));
    }
    Some((name, split_top_level_commas(inner)))
}

fn split_top_level_commas(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote: Option<char> = None;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match in_quote {
            Some(q) if c == q => in_quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => in_quote = Some(c),
                '(' => depth += 1,
                ')' => depth -= 1,
                ',' if depth == 0 => {
                    parts.push(&s[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    parts.push(&s[start..]);
    parts
}

fn apply_binary(op: &str, l: &Value, r: &Value) -> Value {
    match op {
        "||" => Value::Bool(truthy(l) || truthy(r)),
        "&&" => Value::Bool(truthy(l) && truthy(r)),
        "==" => Value::Bool(values_equal(l, r)),
        "!=" => Value::Bool(!values_equal(l, r)),
        ">=" | "<=" | ">" | "<" => {
            let (lf, rf) = (as_f64(l), as_f64(r));
            match (lf, rf) {
                (Some(a), Some(b)) => Value::Bool(match op {
                    ">=" => a >= b,
                    "<=" => a <= b,
                    ">" => a > b,
                    "<" => a < b,
                    _ => unreachable!(),
                }),
                _ => Value::Bool(false),
            }
        }
        "+" => match (l, r) {
            (Value::String(a), _) => Value::String(format!("{a}{}", value_to_string(r))),
            (_, Value::String(b)) => Value::String(format!("{}{b}", value_to_string(l))),
            _ => match (as_f64(l), as_f64(r)) {
                (Some(a), Some(b)) => num(a + b),
                _ => Value::Null,
            },
        },
        "-" | "*" | "/" => match (as_f64(l), as_f64(r)) {
            (Some(a), Some(b)) => num(match op {
                "-" => a - b,
                "*" => a * b,
                "/" => a / b,
                _ => unreachable!(),
            }),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn num(f: f64) -> Value {
    serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    if l == r {
        return true;
    }
    match (as_f64(l), as_f64(r)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        _ => v.to_string(),
    }
}

fn call_builtin(name: &str, args: Vec<Value>) -> Result<Value, Error> {
    match name {
        "to_string" => Ok(Value::String(value_to_string(args.first().unwrap_or(&Value::Null)))),
        "to_number" => {
            let f = args.first().and_then(as_f64).unwrap_or(f64::NAN);
            Ok(num(f))
        }
        "url_encode" => {
            let s = args.first().map(value_to_string).unwrap_or_default();
            Ok(Value::String(url::form_urlencoded::byte_serialize(s.as_bytes()).collect()))
        }
        "base64" => {
            let s = args.first().map(value_to_string).unwrap_or_default();
            Ok(Value::String(base64::engine::general_purpose::STANDARD.encode(s)))
        }
        "count" => {
            let n = match args.first() {
                Some(Value::Array(a)) => a.len(),
                Some(Value::Null) | None => 0,
                Some(Value::Object(o)) => o.len(),
                Some(Value::String(s)) => s.len(),
                _ => 0,
            };
            Ok(Value::Number(n.into()))
        }
        "max" => {
            let best = args.iter().filter_map(as_f64).fold(f64::NEG_INFINITY, f64::max);
            Ok(num(best))
        }
        "now" => {
            let millis = chrono::Utc::now().timestamp_millis();
            Ok(Value::Number(millis.into()))
        }
        "not" => Ok(Value::Bool(!truthy(args.first().unwrap_or(&Value::Null)))),
        "find_in" => {
            let arr = args.first().and_then(|v| v.as_array());
            let key = args.get(1).map(value_to_string).unwrap_or_default();
            let target = args.get(2).cloned().unwrap_or(Value::Null);
            let found = arr
                .and_then(|a| a.iter().find(|el| el.get(&key).map(|v| values_equal(v, &target)).unwrap_or(false)))
                .cloned()
                .unwrap_or(Value::Null);
            Ok(found)
        }
        other => Err(Error::Malformed(format!("unknown function `{other}`"))),
    }
}

#[allow(dead_code)]
pub(crate) fn augmented(base: &BTreeMap<String, Value>, extra: &[(&str, Value)]) -> BTreeMap<String, Value> {
    let mut out = base.clone();
    for (k, v) in extra {
        out.insert((*k).to_string(), v.clone());
    }
    out
}
