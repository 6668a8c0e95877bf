// SPDX-License-Identifier: MIT OR Apache-2.0
//! Validation-signature lines and per-extension comment formats.
//!
//! A signed file carries a single marker comment:
//!
//! - `# lilux:validated:{timestamp}:{hash}` for script-style files
//! - `<!-- lilux:validated:{timestamp}:{hash} -->` for markdown/XML
//!
//! The marker is inserted at the canonical position: after the shebang
//! line when the format says so, otherwise at the top of the file.

use crate::extract::{canonical_content, ContentKind};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

/// Marker tag shared by every signature line.
const MARKER: &str = "lilux:validated";

/// Comment syntax for a family of file extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFormat {
    /// Comment prefix (`"#"` or `"<!--"`).
    pub prefix: String,
    /// Whether the signature goes after a shebang line when one exists.
    pub after_shebang: bool,
}

impl SignatureFormat {
    fn hash_style() -> Self {
        Self {
            prefix: "#".into(),
            after_shebang: true,
        }
    }

    fn xml_style() -> Self {
        Self {
            prefix: "<!--".into(),
            after_shebang: false,
        }
    }

    /// Render the full signature line for a payload.
    fn render(&self, payload: &str) -> String {
        if self.prefix == "<!--" {
            format!("<!-- {MARKER}:{payload} -->")
        } else {
            format!("{} {MARKER}:{payload}", self.prefix)
        }
    }
}

/// A signature extracted from file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    /// Timestamp recorded at signing time (RFC 3339).
    pub timestamp: String,
    /// Canonical content hash recorded at signing time.
    pub hash: String,
}

/// Look up the signature format for a file by extension.
///
/// Unknown extensions fall back to `#`-style comments after the shebang,
/// matching how extractors default.
#[must_use]
pub fn signature_format_for(path: &Path) -> SignatureFormat {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "md" | "markdown" | "xml" | "html" => SignatureFormat::xml_style(),
        "py" | "sh" | "bash" | "rb" | "yaml" | "yml" | "toml" => SignatureFormat::hash_style(),
        other => {
            if !other.is_empty() {
                tracing::debug!(
                    target: "kiwi.manifest",
                    extension = other,
                    "no signature format registered, defaulting to '#'"
                );
            }
            SignatureFormat::hash_style()
        }
    }
}

fn hash_signature_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#+\s*lilux:validated:([^\n]+?)\s*$\n?").expect("valid re"))
}

fn xml_signature_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<!--\s*lilux:validated:([^>]+?)\s*-->\n?").expect("valid re"))
}

/// Remove any signature line from content, leaving everything else intact.
#[must_use]
pub fn remove_signature(content: &str) -> String {
    let pass1 = xml_signature_re().replace_all(content, "");
    hash_signature_re().replace_all(&pass1, "").into_owned()
}

/// Extract the signature record from content, if present.
#[must_use]
pub fn extract_signature(content: &str) -> Option<SignatureRecord> {
    let captures = xml_signature_re()
        .captures(content)
        .or_else(|| hash_signature_re().captures(content))?;
    let payload = captures.get(1)?.as_str();
    // Payload is `{timestamp}:{hash}`; the hash is the final segment so the
    // RFC 3339 timestamp may itself contain colons.
    let (timestamp, hash) = payload.rsplit_once(':')?;
    Some(SignatureRecord {
        timestamp: timestamp.to_string(),
        hash: hash.to_string(),
    })
}

/// Sign content: stamp a `lilux:validated` line carrying the canonical
/// content hash.
///
/// Any existing signature is replaced, which makes signing idempotent on
/// unchanged content: the recorded hash comes out identical.
#[must_use]
pub fn sign_content(content: &str, kind: ContentKind, path: &Path) -> String {
    let unsigned = remove_signature(content);
    let hash = kiwi_integrity::content_hash(&canonical_content(&unsigned, kind));
    let format = signature_format_for(path);
    let line = format.render(&format!("{}:{hash}", Utc::now().to_rfc3339()));

    if format.after_shebang && unsigned.starts_with("#!") {
        match unsigned.split_once('\n') {
            Some((shebang, rest)) => format!("{shebang}\n{line}\n{rest}"),
            None => format!("{unsigned}\n{line}\n"),
        }
    } else {
        format!("{line}\n{unsigned}")
    }
}
