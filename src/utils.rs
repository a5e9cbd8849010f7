// Shared coercions used by the evaluator and the built-in functions

use crate::errors::{Error, Result};
use crate::value::JValue;

/// Truthiness of a value. `None` for undefined.
///
/// Single-member arrays take the truthiness of their member, longer arrays
/// are true when any member is. Functions are always false.
pub fn to_boolean(value: &JValue) -> Option<bool> {
    let b = match value {
        JValue::Undefined => return None,
        JValue::Null => false,
        JValue::Bool(b) => *b,
        JValue::Number(n) => *n != 0.0,
        JValue::String(s) => !s.is_empty(),
        JValue::Object(map) => !map.is_empty(),
        JValue::Array(..) | JValue::Range(_) => match value.len() {
            0 => false,
            1 => value.get_index(0).and_then(|v| to_boolean(&v)).unwrap_or(false),
            _ => value.members().any(|v| to_boolean(&v) == Some(true)),
        },
        JValue::Lambda(_) | JValue::Native(_) | JValue::Regex(_) => false,
    };
    Some(b)
}

/// Truthiness with undefined treated as false.
#[inline]
pub fn boolize(value: &JValue) -> bool {
    to_boolean(value).unwrap_or(false)
}

/// Render a number the way `$string` does: rounded to 15 significant
/// digits, integers without a fraction, and exponent notation outside
/// `[1e-6, 1e21)`.
pub fn format_number(n: f64) -> String {
    let n = round_significant(n);
    if n == 0.0 {
        return "0".to_string();
    }
    let magnitude = n.abs();
    if !(1e-6..1e21).contains(&magnitude) {
        let rendered = format!("{:e}", n);
        return match rendered.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => format!("{mantissa}e+{exponent}"),
            _ => rendered,
        };
    }
    if n.fract() == 0.0 {
        return format!("{:.0}", n);
    }
    format!("{}", n)
}

fn round_significant(n: f64) -> f64 {
    format!("{:.14e}", n).parse::<f64>().unwrap_or(n)
}

/// JSON view of a value with `$string` number rounding; functions become `""`.
pub fn to_json_value(value: &JValue) -> Result<serde_json::Value> {
    let json = match value {
        JValue::Null | JValue::Undefined => serde_json::Value::Null,
        JValue::Bool(b) => serde_json::Value::Bool(*b),
        JValue::Number(n) => {
            if !n.is_finite() {
                return Err(Error::new("D3001"));
            }
            if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                serde_json::Value::from(*n as i64)
            } else {
                serde_json::Value::from(round_significant(*n))
            }
        }
        JValue::String(s) => serde_json::Value::String(s.to_string()),
        JValue::Array(..) | JValue::Range(_) => serde_json::Value::Array(
            value
                .members()
                .map(|m| to_json_value(&m))
                .collect::<Result<Vec<_>>>()?,
        ),
        JValue::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map.iter() {
                out.insert(k.clone(), to_json_value(v)?);
            }
            serde_json::Value::Object(out)
        }
        JValue::Lambda(_) | JValue::Native(_) | JValue::Regex(_) => serde_json::Value::String(String::new()),
    };
    Ok(json)
}

/// String conversion used by `&` and `$string`. `None` for undefined.
pub fn stringify(value: &JValue, pretty: bool) -> Result<Option<String>> {
    let s = match value {
        JValue::Undefined => return Ok(None),
        JValue::String(s) => s.to_string(),
        JValue::Number(n) if !n.is_finite() => return Err(Error::new("D3001")),
        JValue::Number(n) => format_number(*n),
        JValue::Lambda(_) | JValue::Native(_) | JValue::Regex(_) => String::new(),
        other => {
            let json = to_json_value(other)?;
            let rendered = if pretty {
                serde_json::to_string_pretty(&json)
            } else {
                serde_json::to_string(&json)
            };
            rendered.map_err(|e| Error::new("D3001").with_token(e.to_string()))?
        }
    };
    Ok(Some(s))
}

/// Deep copy through the JSON view; functions are replaced by `""`.
pub fn deep_clone(value: &JValue) -> Result<JValue> {
    if value.is_undefined() {
        return Ok(JValue::Undefined);
    }
    Ok(JValue::from(to_json_value(value)?))
}
