// SPDX-License-Identifier: MIT OR Apache-2.0
//! `{param}` placeholder substitution over config trees.
//!
//! A string that is exactly one placeholder takes the parameter's value
//! with its JSON type preserved; embedded placeholders render through
//! string formatting.  Unresolved placeholders fail fast.  `${VAR}` is
//! environment syntax and is left for the env-expansion pass.

use serde_json::{Map, Value};

/// Errors from placeholder substitution.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A placeholder referenced a parameter the caller did not supply.
    #[error("missing parameter '{name}' for placeholder")]
    MissingParameter {
        /// Placeholder name that had no matching parameter.
        name: String,
    },
}

/// Substitute `{param}` placeholders throughout a config tree.
///
/// # Errors
///
/// Returns [`TemplateError::MissingParameter`] for the first placeholder
/// with no matching runtime parameter.
pub fn substitute_value(
    value: &Value,
    params: &Map<String, Value>,
) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => substitute_string(s, params),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute_value(item, params)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), substitute_value(item, params)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_string(s: &str, params: &Map<String, Value>) -> Result<Value, TemplateError> {
    // Whole-string placeholder preserves the value's JSON type.
    if let Some(name) = whole_placeholder(s) {
        return params
            .get(name)
            .cloned()
            .ok_or_else(|| TemplateError::MissingParameter {
                name: name.to_string(),
            });
    }

    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let rest = &s[i..];
        if let Some((name, consumed)) = leading_placeholder(rest, i > 0 && bytes[i - 1] == b'$') {
            let value = params
                .get(name)
                .ok_or_else(|| TemplateError::MissingParameter {
                    name: name.to_string(),
                })?;
            out.push_str(&render(value));
            i += consumed;
        } else {
            let ch = rest.chars().next().expect("non-empty rest");
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    Ok(Value::String(out))
}

/// Render a parameter value for embedding into a string.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The whole string is a single `{name}` placeholder.
fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    is_placeholder_name(inner).then_some(inner)
}

/// A `{name}` placeholder at the start of `rest`; `env` marks a preceding
/// `$`, which makes this `${VAR}` environment syntax instead.
fn leading_placeholder(rest: &str, env: bool) -> Option<(&str, usize)> {
    if env || !rest.starts_with('{') {
        return None;
    }
    let end = rest.find('}')?;
    let name = &rest[1..end];
    is_placeholder_name(name).then_some((name, end + 1))
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
