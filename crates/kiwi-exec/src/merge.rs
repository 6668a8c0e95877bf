// SPDX-License-Identifier: MIT OR Apache-2.0
//! Chain configuration merging.
//!
//! The merged config is folded from the terminal primitive upward: each
//! link closer to the called tool overlays its `config` onto the
//! accumulated value.  Scalars and maps override (maps recursively); the
//! single named special case is `stream.destinations`, where the
//! overlaying link *extends* the accumulated list by concatenation instead
//! of replacing it.  The fold is total, pure, and associative.

use serde_json::{Map, Value};

/// Merge the configs of a chain, called tool last (so it wins overrides).
///
/// `configs` is given in chain order: called tool first, terminal
/// primitive last, the same order [`kiwi_resolve::Chain::links`] yields.
#[must_use]
pub fn merge_chain_configs(configs: &[&Value]) -> Value {
    let mut acc = Value::Object(Map::new());
    for config in configs.iter().rev() {
        acc = overlay(acc, config, &[]);
    }
    acc
}

/// Overlay `upper` onto `acc`, with `upper` winning scalars and maps and
/// extending the `stream.destinations` list.
#[must_use]
pub fn overlay(acc: Value, upper: &Value, path: &[&str]) -> Value {
    match (acc, upper) {
        // A link with no config is transparent.
        (acc, Value::Null) => acc,
        (Value::Object(mut base), Value::Object(over)) => {
            for (key, upper_value) in over {
                let mut child_path: Vec<&str> = path.to_vec();
                child_path.push(key.as_str());
                let merged = match base.remove(key) {
                    Some(existing) => overlay(existing, upper_value, &child_path),
                    None => upper_value.clone(),
                };
                base.insert(key.clone(), merged);
            }
            Value::Object(base)
        }
        // The one config path whose lists concatenate instead of override.
        (Value::Array(mut base), Value::Array(over))
            if matches!(path, ["stream", "destinations"]) =>
        {
            base.extend(over.iter().cloned());
            Value::Array(base)
        }
        // Everything else: the overlaying value wins.
        (_, upper) => upper.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn caller_overrides_scalars() {
        let primitive = json!({"method": "GET", "timeout": 30});
        let caller = json!({"method": "POST"});
        let merged = merge_chain_configs(&[&caller, &primitive]);
        assert_eq!(merged["method"], "POST");
        assert_eq!(merged["timeout"], 30);
    }

    #[test]
    fn maps_merge_recursively() {
        let primitive = json!({"headers": {"accept": "application/json", "x-a": "1"}});
        let caller = json!({"headers": {"x-a": "2"}});
        let merged = merge_chain_configs(&[&caller, &primitive]);
        assert_eq!(merged["headers"]["accept"], "application/json");
        assert_eq!(merged["headers"]["x-a"], "2");
    }

    #[test]
    fn plain_lists_override() {
        let primitive = json!({"args": ["-v"]});
        let caller = json!({"args": ["-q"]});
        let merged = merge_chain_configs(&[&caller, &primitive]);
        assert_eq!(merged["args"], json!(["-q"]));
    }

    #[test]
    fn stream_destinations_concatenate() {
        let messages = json!({"stream": {"destinations": [{"type": "return"}]}});
        let thread = json!({"stream": {"destinations": [{"type": "file_sink", "path": "t.jsonl"}]}});
        let merged = merge_chain_configs(&[&thread, &messages]);
        let dests = merged["stream"]["destinations"].as_array().unwrap();
        assert_eq!(dests.len(), 2);
        // Accumulated (deeper) entries first, overlaying link's appended after.
        assert_eq!(dests[0]["type"], "return");
        assert_eq!(dests[1]["type"], "file_sink");
    }

    #[test]
    fn destinations_elsewhere_do_not_concatenate() {
        // Only the exact `stream.destinations` path extends.
        let a = json!({"other": {"destinations": [1]}});
        let b = json!({"other": {"destinations": [2]}});
        let merged = merge_chain_configs(&[&b, &a]);
        assert_eq!(merged["other"]["destinations"], json!([2]));
    }

    #[test]
    fn three_link_inheritance() {
        let http = json!({"url": "https://api.anthropic.com/v1/messages", "method": "POST"});
        let messages = json!({"headers": {"anthropic-version": "2023-06-01"},
                              "stream": {"destinations": [{"type": "return"}]}});
        let thread = json!({"stream": {"destinations": [{"type": "file_sink"}]}});
        let merged = merge_chain_configs(&[&thread, &messages, &http]);
        // Transport inherited from the primitive.
        assert_eq!(merged["url"], "https://api.anthropic.com/v1/messages");
        assert_eq!(merged["headers"]["anthropic-version"], "2023-06-01");
        let dests = merged["stream"]["destinations"].as_array().unwrap();
        assert_eq!(dests.len(), 2);
    }

    #[test]
    fn merge_is_associative() {
        let a = json!({"x": 1, "m": {"k": "a"}, "stream": {"destinations": [{"s": "a"}]}});
        let b = json!({"y": 2, "m": {"k": "b", "j": 9}, "stream": {"destinations": [{"s": "b"}]}});
        let c = json!({"x": 3, "stream": {"destinations": [{"s": "c"}]}});

        let all_at_once = merge_chain_configs(&[&a, &b, &c]);
        let bc = merge_chain_configs(&[&b, &c]);
        let nested = overlay(bc, &a, &[]);
        assert_eq!(all_at_once, nested);
    }

    #[test]
    fn merge_of_empty_is_empty_object() {
        assert_eq!(merge_chain_configs(&[]), json!({}));
    }

    #[test]
    fn null_config_links_are_transparent() {
        let a = json!({"k": "v"});
        let none = Value::Null;
        assert_eq!(merge_chain_configs(&[&a, &none])["k"], "v");
        assert_eq!(merge_chain_configs(&[&none, &a])["k"], "v");
    }
}
