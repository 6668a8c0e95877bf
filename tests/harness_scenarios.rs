// SPDX-License-Identifier: MIT OR Apache-2.0
//! Harness and token scenarios: attenuation chains, limit-triggered
//! hooks, permission-denied templating, and permission mapping.

use kiwi_harness::{
    attenuate_token, mint_token, permissions_to_caps, sign_token, verify_token, ensure_keypair,
    HarnessAction, HookSpec, Limits, PermissionStatement, SafetyHarness, DEFAULT_AUDIENCE,
};
use serde_json::json;

fn caps(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

#[test]
fn attenuation_chain() {
    let parent = mint_token(
        &caps(&["fs.read", "fs.write", "process.exec"]),
        "deploy",
        "thread-1",
        None,
        1,
        DEFAULT_AUDIENCE,
    );
    let child = attenuate_token(&parent, &caps(&["fs.write", "net.open"]));

    assert_eq!(child.caps, caps(&["fs.write"]));
    assert_eq!(child.exp, parent.exp);
    assert_eq!(child.parent_id.as_deref(), Some(parent.token_id.as_str()));
}

// Token round-trip through real key material on disk.
#[test]
fn sign_verify_with_generated_keypair() {
    let dir = tempfile::tempdir().unwrap();
    let (signing, verifying) = ensure_keypair(dir.path()).unwrap();

    let mut token = mint_token(
        &caps(&["fs.read", "tool.scraper"]),
        "deploy",
        "thread-1",
        None,
        1,
        DEFAULT_AUDIENCE,
    );
    sign_token(&mut token, &signing);

    let verified = verify_token(&token.serialize(), &verifying).unwrap();
    assert_eq!(verified, token);
    assert!(verified.has_capability("tool.scraper"));
    assert!(!verified.has_capability("fs.write"));
}

// A warning hook fires at 90% of the turn cap, before the hard limit.
#[test]
fn limit_warning_hook_fires_at_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = SafetyHarness::new(
        dir.path(),
        Limits {
            turns: Some(10),
            ..Limits::default()
        },
        vec![HookSpec {
            when: "cost.turns >= limits.turns * 0.9".into(),
            directive: "warn_limit".into(),
            inputs: None,
        }],
        "deploy",
        json!({}),
    )
    .unwrap();

    harness.cost_mut().turns = 8;
    assert_eq!(
        harness.checkpoint_before_step("step").action,
        HarnessAction::Continue
    );

    harness.cost_mut().turns = 9;
    let result = harness.checkpoint_before_step("step");
    assert_eq!(result.action, HarnessAction::Hook);
    assert_eq!(result.context.unwrap()["hook_directive"], "warn_limit");
}

#[test]
fn permission_denied_hook_templates_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let harness = SafetyHarness::new(
        dir.path(),
        Limits::default(),
        vec![HookSpec {
            when: "event.code == \"permission_denied\"".into(),
            directive: "request_elevated_permissions".into(),
            inputs: Some(json!({
                "original_directive": "${directive.name}",
                "missing_cap": "${event.detail.missing}",
            })),
        }],
        "deploy",
        json!({}),
    )
    .unwrap();

    let result = harness.checkpoint_on_error("permission_denied", &json!({"missing": "fs.write"}));
    assert_eq!(result.action, HarnessAction::Hook);
    let context = result.context.unwrap();
    assert_eq!(context["hook_directive"], "request_elevated_permissions");
    assert_eq!(context["hook_inputs"]["original_directive"], "deploy");
    assert_eq!(context["hook_inputs"]["missing_cap"], "fs.write");
}

#[test]
fn permission_statements_map_to_sorted_caps() {
    let mapped = permissions_to_caps(&[
        PermissionStatement {
            tag: "read".into(),
            resource: "filesystem".into(),
            action: None,
            id: None,
        },
        PermissionStatement {
            tag: "execute".into(),
            resource: "tool".into(),
            action: None,
            id: Some("scraper".into()),
        },
        PermissionStatement {
            tag: "execute".into(),
            resource: "kiwi-mcp".into(),
            action: Some("search".into()),
            id: None,
        },
    ]);
    assert_eq!(mapped, caps(&["fs.read", "kiwi-mcp.execute", "tool.scraper"]));
}

// Minted caps flow into attenuation for a spawned child thread.
#[test]
fn spawned_child_gets_attenuated_mapped_caps() {
    let declared = permissions_to_caps(&[
        PermissionStatement {
            tag: "read".into(),
            resource: "filesystem".into(),
            action: None,
            id: None,
        },
        PermissionStatement {
            tag: "write".into(),
            resource: "filesystem".into(),
            action: None,
            id: None,
        },
    ]);
    let parent = mint_token(&declared, "deploy", "parent-thread", None, 1, DEFAULT_AUDIENCE);

    // Child declares more than the parent can grant.
    let child_declared = permissions_to_caps(&[
        PermissionStatement {
            tag: "write".into(),
            resource: "filesystem".into(),
            action: None,
            id: None,
        },
        PermissionStatement {
            tag: "execute".into(),
            resource: "shell".into(),
            action: None,
            id: None,
        },
    ]);
    let child = attenuate_token(&parent, &child_declared);
    assert_eq!(child.caps, caps(&["fs.write"]));
}

// Expired parents produce expired (unverifiable) children.
#[test]
fn attenuated_child_inherits_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let (signing, verifying) = ensure_keypair(dir.path()).unwrap();

    let parent = mint_token(&caps(&["fs.read"]), "d", "t", None, -1, DEFAULT_AUDIENCE);
    let mut child = attenuate_token(&parent, &caps(&["fs.read"]));
    sign_token(&mut child, &signing);
    assert!(verify_token(&child.serialize(), &verifying).is_none());
}
