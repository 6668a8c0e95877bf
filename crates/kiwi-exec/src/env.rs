// SPDX-License-Identifier: MIT OR Apache-2.0
//! `${VAR}` / `${VAR:-default}` environment expansion.
//!
//! Expansion runs against a merged environment: the process environment
//! overlaid with config-supplied variables.  A supplied environment larger
//! than [`PRERESOLVED_ENV_THRESHOLD`] entries is assumed to be a fully
//! resolved snapshot and is used as-is.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Config-supplied environments larger than this are treated as already
/// resolved (process env plus dotfiles) and not merged again.
pub const PRERESOLVED_ENV_THRESHOLD: usize = 50;

fn env_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid re"))
}

/// Expand `${VAR}` and `${VAR:-default}` references in a string.
///
/// Unset variables without a default expand to the empty string.
#[must_use]
pub fn expand_str(value: &str, env: &HashMap<String, String>) -> String {
    env_var_re()
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let expr = &caps[1];
            match expr.split_once(":-") {
                Some((name, default)) => env
                    .get(name.trim())
                    .cloned()
                    .unwrap_or_else(|| default.to_string()),
                None => env.get(expr).cloned().unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Expand environment references in every string of a config tree.
#[must_use]
pub fn expand_value(value: &Value, env: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(expand_str(s, env)),
        Value::Array(items) => Value::Array(items.iter().map(|v| expand_value(v, env)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_value(v, env)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Build the effective environment from the process environment and a
/// config-supplied `env` object.
///
/// Small supplied environments overlay the process environment; large
/// ones (> [`PRERESOLVED_ENV_THRESHOLD`]) are assumed pre-resolved and
/// returned as-is.
#[must_use]
pub fn merged_env(config_env: Option<&Map<String, Value>>) -> HashMap<String, String> {
    let supplied: HashMap<String, String> = config_env
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), value_to_env_string(v)))
                .collect()
        })
        .unwrap_or_default();

    if supplied.len() > PRERESOLVED_ENV_THRESHOLD {
        return supplied;
    }

    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(supplied);
    env
}

fn value_to_env_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
