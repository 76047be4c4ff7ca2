//! Write-time type validation.
//!
//! Values arrive either already typed (JSON from an import document) or as
//! text from a form field. Both are normalised to the parsed JSON structure
//! that is stored and returned, so readers never re-parse.

use serde_json::{Number, Value};

use crate::key::DeclaredType;

impl DeclaredType {
  /// Check `raw` against this type and return its stored form, or a reason
  /// for the mismatch.
  pub fn coerce(self, raw: Value) -> Result<Value, String> {
    match (self, raw) {
      (Self::String, v @ Value::String(_)) => Ok(v),

      (Self::Number, v @ Value::Number(_)) => Ok(v),
      (Self::Number, Value::String(s)) => parse_number(&s)
        .map(Value::Number)
        .ok_or_else(|| format!("{s:?} is not numeric")),

      (Self::Boolean, v @ Value::Bool(_)) => Ok(v),
      (Self::Boolean, Value::String(s)) => match s.trim() {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        _ => Err(format!("{s:?} is not `true` or `false`")),
      },

      (Self::Json, Value::String(text)) => serde_json::from_str(&text)
        .map_err(|e| format!("invalid JSON text: {e}")),
      (Self::Json, v) => Ok(v),

      (Self::Array, v @ Value::Array(_)) => Ok(v),
      (Self::Array, Value::String(text)) => {
        match serde_json::from_str::<Value>(&text) {
          Ok(v @ Value::Array(_)) => Ok(v),
          Ok(other) => Err(format!("expected a JSON array, got {}", kind(&other))),
          Err(e) => Err(format!("invalid JSON text: {e}")),
        }
      }

      (_, other) => Err(format!("unexpected {}", kind(&other))),
    }
  }
}

fn parse_number(s: &str) -> Option<Number> {
  let s = s.trim();
  if let Ok(i) = s.parse::<i64>() {
    return Some(i.into());
  }
  if let Ok(u) = s.parse::<u64>() {
    return Some(u.into());
  }
  s.parse::<f64>().ok().and_then(Number::from_f64)
}

fn kind(v: &Value) -> &'static str {
  match v {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}
