// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capability tokens: minting, attenuation, Ed25519 signing, and the
//! permission→capability mapping.
//!
//! A token grants a sorted set of dotted capability strings (`fs.read`,
//! `tool.scraper`) to one thread.  Child threads receive attenuated
//! tokens: the intersection of the parent's grants and the child's
//! declared needs, never more.  The signed payload is the canonical
//! sorted-key JSON of every field except the signature itself.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Default audience for minted tokens.
pub const DEFAULT_AUDIENCE: &str = "kiwi-mcp";

/// Default validity window, in hours.
pub const DEFAULT_EXP_HOURS: i64 = 1;

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Capability token for permission enforcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    /// Unique token identifier.
    pub token_id: String,
    /// Granted capabilities, kept sorted for determinism.
    pub caps: Vec<String>,
    /// Audience identifier (prevents cross-service replay).
    pub aud: String,
    /// Expiry instant, UTC.
    pub exp: DateTime<Utc>,
    /// Parent token id for delegation chains.
    pub parent_id: Option<String>,
    /// Directive that minted this token.
    pub directive_id: String,
    /// Thread this token belongs to.
    pub thread_id: String,
    /// Ed25519 signature, URL-safe base64 (set after signing).
    pub signature: Option<String>,
}

impl CapabilityToken {
    /// Whether the token's expiry is in the past.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.exp
    }

    /// Whether the token grants a specific capability.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.caps.iter().any(|c| c == capability)
    }

    /// Whether the token grants any of the given capabilities.
    #[must_use]
    pub fn has_any_capability(&self, capabilities: &[String]) -> bool {
        capabilities.iter().any(|c| self.has_capability(c))
    }

    /// Whether the token grants all of the given capabilities.
    #[must_use]
    pub fn has_all_capabilities(&self, capabilities: &[String]) -> bool {
        capabilities.iter().all(|c| self.has_capability(c))
    }

    /// Canonical signing payload: sorted-key JSON of every field except
    /// `signature`, with `caps` sorted.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut caps = self.caps.clone();
        caps.sort();
        // serde_json maps are sorted by key, so this is canonical.
        let payload = serde_json::json!({
            "token_id": self.token_id,
            "caps": caps,
            "aud": self.aud,
            "exp": self.exp.to_rfc3339(),
            "parent_id": self.parent_id,
            "directive_id": self.directive_id,
            "thread_id": self.thread_id,
        });
        serde_json::to_string(&payload)
            .expect("token payload serializes")
            .into_bytes()
    }

    /// Serialize to the URL-safe base64 wire form.
    #[must_use]
    pub fn serialize(&self) -> String {
        let json = serde_json::to_string(&serde_json::to_value(self).expect("token serializes"))
            .expect("token serializes");
        URL_SAFE.encode(json.as_bytes())
    }

    /// Deserialize from the URL-safe base64 wire form.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Malformed`] for bad base64 or JSON.
    pub fn deserialize(token_str: &str) -> Result<Self, TokenError> {
        let bytes = URL_SAFE
            .decode(token_str.as_bytes())
            .map_err(|e| TokenError::Malformed {
                reason: e.to_string(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| TokenError::Malformed {
            reason: e.to_string(),
        })
    }
}

/// Errors from token handling.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Token string failed to decode.
    #[error("malformed token: {reason}")]
    Malformed {
        /// Decode failure detail.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Mint / attenuate / sign / verify
// ---------------------------------------------------------------------------

/// Mint a new unsigned token valid for `exp_hours` from now.
#[must_use]
pub fn mint_token(
    caps: &[String],
    directive_id: &str,
    thread_id: &str,
    parent_id: Option<&str>,
    exp_hours: i64,
    aud: &str,
) -> CapabilityToken {
    CapabilityToken {
        token_id: Uuid::new_v4().to_string(),
        caps: caps.to_vec(),
        aud: aud.to_string(),
        exp: Utc::now() + Duration::hours(exp_hours),
        parent_id: parent_id.map(String::from),
        directive_id: directive_id.to_string(),
        thread_id: thread_id.to_string(),
        signature: None,
    }
}

/// Attenuate a parent token for a child thread.
///
/// The child's capability set is the intersection of what the parent
/// holds and what the child declares it needs, sorted.  Expiry and
/// audience are inherited; `parent_id` records the delegation edge.
#[must_use]
pub fn attenuate_token(parent: &CapabilityToken, child_declared: &[String]) -> CapabilityToken {
    let parent_caps: BTreeSet<&String> = parent.caps.iter().collect();
    let caps: Vec<String> = child_declared
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|c| parent_caps.contains(*c))
        .cloned()
        .collect();

    CapabilityToken {
        token_id: Uuid::new_v4().to_string(),
        caps,
        aud: parent.aud.clone(),
        exp: parent.exp,
        parent_id: Some(parent.token_id.clone()),
        directive_id: parent.directive_id.clone(),
        thread_id: parent.thread_id.clone(),
        signature: None,
    }
}

/// Sign a token in place with an Ed25519 key; returns the signature.
pub fn sign_token(token: &mut CapabilityToken, key: &SigningKey) -> String {
    let signature: Signature = key.sign(&token.signing_payload());
    let encoded = URL_SAFE.encode(signature.to_bytes());
    token.signature = Some(encoded.clone());
    encoded
}

/// Verify a serialized token.
///
/// Returns the token when the signature checks out and the token has not
/// expired; `None` otherwise.  Verification failure never raises.
#[must_use]
pub fn verify_token(token_str: &str, key: &VerifyingKey) -> Option<CapabilityToken> {
    let token = CapabilityToken::deserialize(token_str).ok()?;

    if token.is_expired() {
        return None;
    }
    let encoded = token.signature.as_ref()?;
    let bytes = URL_SAFE.decode(encoded.as_bytes()).ok()?;
    let signature = Signature::from_slice(&bytes).ok()?;

    key.verify(&token.signing_payload(), &signature)
        .ok()
        .map(|()| token)
}

// ---------------------------------------------------------------------------
// Permission → capability mapping
// ---------------------------------------------------------------------------

/// A declarative permission statement from a directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionStatement {
    /// Permission verb (`read`, `write`, `execute`).
    pub tag: String,
    /// Resource the permission applies to.
    pub resource: String,
    /// Optional action qualifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Optional target id (tool permissions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Map permission statements to the sorted, deduplicated capability set.
///
/// A static table covers the kernel's own resources; generic fallbacks
/// cover the rest: `read/R → R.read`, `write/R → R.write`,
/// `execute/R/A → R.A`, `execute/R → R.execute`, and
/// `execute/tool id=X → tool.X`.
#[must_use]
pub fn permissions_to_caps(permissions: &[PermissionStatement]) -> Vec<String> {
    let mut caps = BTreeSet::new();

    for perm in permissions {
        let tag = perm.tag.as_str();
        let resource = perm.resource.as_str();
        let action = perm.action.as_deref();

        if let Some(cap) = static_mapping(tag, resource, action) {
            caps.insert(cap.to_string());
            continue;
        }

        if tag == "execute" && resource == "tool" {
            if let Some(id) = &perm.id {
                caps.insert(format!("tool.{id}"));
            }
            continue;
        }

        match tag {
            "read" if !resource.is_empty() => {
                caps.insert(format!("{resource}.read"));
            }
            "write" if !resource.is_empty() => {
                caps.insert(format!("{resource}.write"));
            }
            "execute" if !resource.is_empty() => match action {
                Some(action) => {
                    caps.insert(format!("{resource}.{action}"));
                }
                None => {
                    caps.insert(format!("{resource}.execute"));
                }
            },
            _ => {}
        }
    }

    caps.into_iter().collect()
}

/// Kernel-owned permission table, exact matches first, then tag/resource
/// matches with any action.
fn static_mapping(tag: &str, resource: &str, action: Option<&str>) -> Option<&'static str> {
    match (tag, resource, action) {
        ("read", "filesystem", _) => Some("fs.read"),
        ("write", "filesystem", _) => Some("fs.write"),
        ("execute", "filesystem", _) => Some("fs.exec"),
        ("execute", "spawn", Some("thread")) => Some("spawn.thread"),
        ("execute", "registry", Some("write")) => Some("registry.write"),
        ("execute", "registry", Some("read")) => Some("registry.read"),
        ("execute", "kiwi-mcp", _) => Some("kiwi-mcp.execute"),
        ("execute", "shell", _) => Some("process.exec"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn keypair() -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        (signing, verifying)
    }

    // ---- mint / queries ---------------------------------------------------

    #[test]
    fn mint_sets_expiry_and_identity() {
        let token = mint_token(
            &caps(&["fs.read"]),
            "deploy",
            "thread-1",
            None,
            1,
            DEFAULT_AUDIENCE,
        );
        assert!(!token.is_expired());
        assert!(token.exp > Utc::now() + Duration::minutes(55));
        assert_eq!(token.aud, "kiwi-mcp");
        assert!(token.signature.is_none());
        assert!(token.parent_id.is_none());
    }

    #[test]
    fn capability_queries() {
        let token = mint_token(
            &caps(&["fs.read", "fs.write"]),
            "d",
            "t",
            None,
            1,
            DEFAULT_AUDIENCE,
        );
        assert!(token.has_capability("fs.read"));
        assert!(!token.has_capability("process.exec"));
        assert!(token.has_any_capability(&caps(&["process.exec", "fs.write"])));
        assert!(!token.has_any_capability(&caps(&["process.exec"])));
        assert!(token.has_all_capabilities(&caps(&["fs.read", "fs.write"])));
        assert!(!token.has_all_capabilities(&caps(&["fs.read", "net.open"])));
    }

    #[test]
    fn empty_caps_grant_nothing() {
        let token = mint_token(&[], "d", "t", None, 1, DEFAULT_AUDIENCE);
        assert!(!token.has_capability("fs.read"));
        assert!(token.has_all_capabilities(&[]));
    }

    // ---- attenuation ------------------------------------------------------

    #[test]
    fn attenuation_is_intersection() {
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
        assert_eq!(child.aud, parent.aud);
        assert_eq!(child.parent_id.as_deref(), Some(parent.token_id.as_str()));
    }

    #[test]
    fn attenuation_result_is_sorted() {
        let parent = mint_token(
            &caps(&["c.z", "a.x", "b.y"]),
            "d",
            "t",
            None,
            1,
            DEFAULT_AUDIENCE,
        );
        let child = attenuate_token(&parent, &caps(&["c.z", "b.y", "a.x"]));
        assert_eq!(child.caps, caps(&["a.x", "b.y", "c.z"]));
    }

    #[test]
    fn attenuation_of_empty_parent_is_empty() {
        let parent = mint_token(&[], "d", "t", None, 1, DEFAULT_AUDIENCE);
        let child = attenuate_token(&parent, &caps(&["fs.read"]));
        assert!(child.caps.is_empty());
        assert!(!child.has_capability("fs.read"));
    }

    #[test]
    fn double_attenuation_never_widens() {
        let parent = mint_token(
            &caps(&["fs.read", "fs.write"]),
            "d",
            "t",
            None,
            1,
            DEFAULT_AUDIENCE,
        );
        let child = attenuate_token(&parent, &caps(&["fs.read"]));
        let grandchild = attenuate_token(&child, &caps(&["fs.read", "fs.write"]));
        assert_eq!(grandchild.caps, caps(&["fs.read"]));
    }

    // ---- sign / verify ----------------------------------------------------

    #[test]
    fn sign_then_verify_roundtrip() {
        let (signing, verifying) = keypair();
        let mut token = mint_token(
            &caps(&["fs.read"]),
            "deploy",
            "thread-1",
            None,
            1,
            DEFAULT_AUDIENCE,
        );
        sign_token(&mut token, &signing);

        let verified = verify_token(&token.serialize(), &verifying).unwrap();
        assert_eq!(verified, token);
    }

    #[test]
    fn unsigned_token_fails_verification() {
        let (_, verifying) = keypair();
        let token = mint_token(&caps(&["fs.read"]), "d", "t", None, 1, DEFAULT_AUDIENCE);
        assert!(verify_token(&token.serialize(), &verifying).is_none());
    }

    #[test]
    fn expired_token_fails_verification() {
        let (signing, verifying) = keypair();
        let mut token = mint_token(&caps(&["fs.read"]), "d", "t", None, -1, DEFAULT_AUDIENCE);
        sign_token(&mut token, &signing);
        assert!(verify_token(&token.serialize(), &verifying).is_none());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let (signing, _) = keypair();
        let (_, other_verifying) = keypair();
        let mut token = mint_token(&caps(&["fs.read"]), "d", "t", None, 1, DEFAULT_AUDIENCE);
        sign_token(&mut token, &signing);
        assert!(verify_token(&token.serialize(), &other_verifying).is_none());
    }

    #[test]
    fn tampered_caps_fail_verification() {
        let (signing, verifying) = keypair();
        let mut token = mint_token(&caps(&["fs.read"]), "d", "t", None, 1, DEFAULT_AUDIENCE);
        sign_token(&mut token, &signing);
        token.caps.push("process.exec".into());
        assert!(verify_token(&token.serialize(), &verifying).is_none());
    }

    #[test]
    fn garbage_token_string_is_rejected_quietly() {
        let (_, verifying) = keypair();
        assert!(verify_token("not-base64!!!", &verifying).is_none());
        assert!(verify_token(&URL_SAFE.encode(b"not json"), &verifying).is_none());
    }

    #[test]
    fn signing_payload_is_deterministic() {
        let token = mint_token(
            &caps(&["b.y", "a.x"]),
            "d",
            "t",
            Some("parent-id"),
            1,
            DEFAULT_AUDIENCE,
        );
        assert_eq!(token.signing_payload(), token.signing_payload());
        // Caps are sorted inside the payload regardless of field order.
        let payload = String::from_utf8(token.signing_payload()).unwrap();
        assert!(payload.find("a.x").unwrap() < payload.find("b.y").unwrap());
    }

    #[test]
    fn wire_form_roundtrips() {
        let token = mint_token(&caps(&["fs.read"]), "d", "t", None, 1, DEFAULT_AUDIENCE);
        let decoded = CapabilityToken::deserialize(&token.serialize()).unwrap();
        assert_eq!(decoded, token);
    }

    // ---- permission mapping -----------------------------------------------

    fn perm(tag: &str, resource: &str, action: Option<&str>, id: Option<&str>) -> PermissionStatement {
        PermissionStatement {
            tag: tag.into(),
            resource: resource.into(),
            action: action.map(String::from),
            id: id.map(String::from),
        }
    }

    #[test]
    fn filesystem_permissions_use_static_table() {
        let mapped = permissions_to_caps(&[
            perm("read", "filesystem", None, None),
            perm("write", "filesystem", None, None),
        ]);
        assert_eq!(mapped, caps(&["fs.read", "fs.write"]));
    }

    #[test]
    fn mixed_statement_mapping_is_sorted() {
        let mapped = permissions_to_caps(&[
            perm("read", "filesystem", None, None),
            perm("execute", "tool", None, Some("scraper")),
            perm("execute", "kiwi-mcp", Some("search"), None),
        ]);
        assert_eq!(mapped, caps(&["fs.read", "kiwi-mcp.execute", "tool.scraper"]));
    }

    #[test]
    fn kiwi_mcp_actions_collapse_to_execute() {
        for action in ["execute", "search", "load", "help"] {
            let mapped = permissions_to_caps(&[perm("execute", "kiwi-mcp", Some(action), None)]);
            assert_eq!(mapped, caps(&["kiwi-mcp.execute"]));
        }
    }

    #[test]
    fn generic_fallbacks() {
        assert_eq!(
            permissions_to_caps(&[perm("read", "registry", None, None)]),
            caps(&["registry.read"])
        );
        assert_eq!(
            permissions_to_caps(&[perm("write", "cache", None, None)]),
            caps(&["cache.write"])
        );
        assert_eq!(
            permissions_to_caps(&[perm("execute", "deploy", Some("rollback"), None)]),
            caps(&["deploy.rollback"])
        );
        assert_eq!(
            permissions_to_caps(&[perm("execute", "deploy", None, None)]),
            caps(&["deploy.execute"])
        );
    }

    #[test]
    fn spawn_and_shell_permissions() {
        assert_eq!(
            permissions_to_caps(&[perm("execute", "spawn", Some("thread"), None)]),
            caps(&["spawn.thread"])
        );
        assert_eq!(
            permissions_to_caps(&[perm("execute", "shell", None, None)]),
            caps(&["process.exec"])
        );
        assert_eq!(
            permissions_to_caps(&[perm("execute", "shell", Some("*"), None)]),
            caps(&["process.exec"])
        );
    }

    #[test]
    fn duplicates_are_deduplicated() {
        let mapped = permissions_to_caps(&[
            perm("read", "filesystem", None, None),
            perm("read", "filesystem", None, None),
        ]);
        assert_eq!(mapped, caps(&["fs.read"]));
    }

    #[test]
    fn tool_permission_without_id_maps_nothing() {
        assert!(permissions_to_caps(&[perm("execute", "tool", None, None)]).is_empty());
    }
}
