//! Canonical value normalization and content hashing.
//!
//! Every hash in the graph is computed over the *canonical* form of a value,
//! so two payloads that mean the same thing always produce the same bytes.
//!
//! Rules applied by [`canonicalize`]:
//! - Object keys sorted lexicographically (recursive at every depth).
//! - Arrays preserve element order; elements are canonicalized in place.
//! - Numbers become fixed 6-decimal strings with trailing zeros and the
//!   decimal point stripped (`1.0 → "1"`, `2.50 → "2.5"`).
//! - Strings that are plain decimal literals (`-?digits(.digits)?`) are
//!   normalized with the same rule, so `"1.500000"` and `1.5` agree.
//! - `null` stays `null`; absent optionals serialize to `null` upstream.
//!
//! [`stable_stringify`] renders the canonical form as compact JSON and
//! [`content_hash`] digests it.

pub mod digest;

pub use digest::{Blake3Digest, ContentDigest, DigestAlgorithm, Sha256Digest, content_hash};

use serde_json::{Map, Value};

/// Number of fractional digits kept for numeric leaves.
pub const NUMERIC_PRECISION: usize = 6;

/// Produce the canonical normal form of a value.
///
/// Idempotent: `canonicalize(&canonicalize(v)) == canonicalize(v)`.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use filament_core::canon::canonicalize;
///
/// let val = json!({"z": 1.0, "a": {"c": "0.500000", "b": null}});
/// assert_eq!(canonicalize(&val), json!({"a": {"b": null, "c": "0.5"}, "z": "1"}));
/// ```
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        Value::Number(n) => Value::String(normalize_number(n)),
        Value::String(s) => Value::String(normalize_string(s)),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                if let Some(val) = map.get(key) {
                    out.insert(key.clone(), canonicalize(val));
                }
            }
            Value::Object(out)
        }
    }
}

/// Serialize the canonical form of `value` as compact JSON with sorted keys.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use filament_core::canon::stable_stringify;
///
/// let val = json!({"z": 1, "a": {"c": 3, "b": 2}});
/// assert_eq!(stable_stringify(&val), r#"{"a":{"b":"2","c":"3"},"z":"1"}"#);
/// ```
#[must_use]
pub fn stable_stringify(value: &Value) -> String {
    let mut buf = String::new();
    write_canonical(&canonicalize(value), &mut buf);
    buf
}

/// Serialize any `Serialize` type through [`stable_stringify`].
///
/// # Errors
///
/// Returns `serde_json::Error` if the value cannot be represented as JSON.
pub fn stable_stringify_of<T: serde::Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(stable_stringify(&serde_json::to_value(value)?))
}

fn normalize_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    n.as_f64().map_or_else(|| n.to_string(), fixed_decimal)
}

fn fixed_decimal(f: f64) -> String {
    let fixed = format!("{f:.prec$}", prec = NUMERIC_PRECISION);
    let trimmed = if fixed.contains('.') {
        fixed.trim_end_matches('0').trim_end_matches('.')
    } else {
        fixed.as_str()
    };
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_string(s: &str) -> String {
    match decimal_shape(s) {
        Some(DecimalShape::Integer) => normalize_integer_literal(s),
        Some(DecimalShape::Fraction) => s
            .parse::<f64>()
            .map_or_else(|_| s.to_string(), fixed_decimal),
        None => s.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecimalShape {
    Integer,
    Fraction,
}

fn decimal_shape(s: &str) -> Option<DecimalShape> {
    let body = s.strip_prefix('-').unwrap_or(s);
    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (body, None),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match frac_part {
        None => Some(DecimalShape::Integer),
        Some(f) if !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()) => {
            Some(DecimalShape::Fraction)
        }
        Some(_) => None,
    }
}

// Integers are normalized textually so values beyond f64 precision survive.
fn normalize_integer_literal(s: &str) -> String {
    let (negative, digits) = s
        .strip_prefix('-')
        .map_or((false, s), |rest| (true, rest));
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        "0".to_string()
    } else if negative {
        format!("-{digits}")
    } else {
        digits.to_string()
    }
}

fn write_canonical(value: &Value, buf: &mut String) {
    match value {
        Value::Null => buf.push_str("null"),
        Value::Bool(b) => buf.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => buf.push_str(&n.to_string()),
        Value::String(s) => write_json_string(s, buf),
        Value::Array(arr) => {
            buf.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(item, buf);
            }
            buf.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            buf.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_json_string(key, buf);
                buf.push(':');
                if let Some(val) = map.get(*key) {
                    write_canonical(val, buf);
                }
            }
            buf.push('}');
        }
    }
}

fn write_json_string(s: &str, buf: &mut String) {
    buf.push('"');
    for c in s.chars() {
        match c {
            '"' => buf.push_str("\\\""),
            '\\' => buf.push_str("\\\\"),
            '\n' => buf.push_str("\\n"),
            '\r' => buf.push_str("\\r"),
            '\t' => buf.push_str("\\t"),
            '\u{08}' => buf.push_str("\\b"),
            '\u{0c}' => buf.push_str("\\f"),
            c if u32::from(c) < 0x20 => {
                buf.push_str(&format!("\\u{:04x}", u32::from(c)));
            }
            c => buf.push(c),
        }
    }
    buf.push('"');
}
