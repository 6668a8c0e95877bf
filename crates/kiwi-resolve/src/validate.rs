// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pre-execution chain validation.
//!
//! Two checks run before any I/O: every adjacent parent must be able to
//! consume what its child declares, and the chain must end in a recognized
//! primitive.

use crate::Chain;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Primitive identifiers the executor can dispatch.
pub const PRIMITIVE_IDS: &[&str] = &["http_client", "subprocess"];

/// Outcome of validating a chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainValidationResult {
    /// `true` when no errors remain after mode handling.
    pub valid: bool,
    /// Hard failures (strict mode aborts on these).
    pub errors: Vec<String>,
    /// Advisory findings.
    pub warnings: Vec<String>,
}

impl ChainValidationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: vec![],
            warnings: vec![],
        }
    }
}

/// Validate a resolved chain.
///
/// In strict mode (the default on execute) findings are errors and
/// `valid` is false when any exist; in non-strict mode errors are
/// downgraded to warnings and `valid` stays true.
#[must_use]
pub fn validate_chain(chain: &Chain, strict: bool) -> ChainValidationResult {
    let mut result = ChainValidationResult::ok();

    // Terminal primitive with a recognized identifier.
    let terminal = chain.terminal();
    if !terminal.manifest.is_primitive() {
        result
            .errors
            .push(format!("terminal link '{}' is not a primitive", terminal.tool_id()));
    } else if !PRIMITIVE_IDS.contains(&terminal.tool_id()) {
        result.errors.push(format!(
            "unrecognized primitive '{}' (expected one of {:?})",
            terminal.tool_id(),
            PRIMITIVE_IDS
        ));
    }

    // Parent-accepts-child for each adjacent pair.
    for pair in chain.links().windows(2) {
        let (child, parent) = (&pair[0], &pair[1]);
        let merged_placeholders = {
            let mut names = Vec::new();
            collect_placeholders(&child.manifest.config, &mut names);
            collect_placeholders(&parent.manifest.config, &mut names);
            names
        };

        for param in &child.manifest.parameters {
            let accepted = parent.manifest.parameter(&param.name).is_some()
                || merged_placeholders.contains(&param.name);
            if !accepted {
                result.errors.push(format!(
                    "parameter '{}' of '{}' is not accepted by parent '{}'",
                    param.name,
                    child.tool_id(),
                    parent.tool_id()
                ));
                continue;
            }
            // A child may narrow a type; a changed type is advisory only.
            if let Some(parent_param) = parent.manifest.parameter(&param.name) {
                if parent_param.param_type != param.param_type {
                    result.warnings.push(format!(
                        "parameter '{}' narrows type {} -> {} between '{}' and '{}'",
                        param.name,
                        parent_param.param_type,
                        param.param_type,
                        child.tool_id(),
                        parent.tool_id()
                    ));
                }
            }
        }
    }

    if !result.errors.is_empty() {
        if strict {
            result.valid = false;
        } else {
            result.warnings.append(&mut result.errors);
        }
    }
    result
}

/// Collect `{placeholder}` names appearing in any string of a config tree.
fn collect_placeholders(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find('{') {
                let Some(len) = rest[start + 1..].find('}') else {
                    break;
                };
                // `${VAR}` is environment syntax, not a parameter placeholder.
                let env_syntax = start > 0 && rest.as_bytes()[start - 1] == b'$';
                let name = &rest[start + 1..start + 1 + len];
                if !env_syntax
                    && !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    out.push(name.to_string());
                }
                rest = &rest[start + 1 + len + 1..];
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_placeholders(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_placeholders(item, out);
            }
        }
        _ => {}
    }
}
