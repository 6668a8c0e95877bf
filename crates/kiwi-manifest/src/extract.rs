// SPDX-License-Identifier: MIT OR Apache-2.0
//! Manifest extraction and canonical-content rules.
//!
//! A manifest may be declared in three shapes:
//!
//! - YAML frontmatter fenced by `---` lines (markdown / knowledge files)
//! - a leading `#`-comment header after an optional shebang (script files)
//! - a leading `<!-- … -->` comment block (markdown / XML files)
//!
//! Canonical content, the bytes that feed the content hash, is derived
//! per content kind.  These rules must stay stable: changing them makes
//! every existing lockfile incompatible.

use crate::signature::remove_signature;
use crate::{ManifestError, ToolManifest};

/// Content kinds with distinct canonicalization rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Directive XML; only the signature comment is stripped.
    Directive,
    /// Tool source file; signature and comment metadata header stripped,
    /// shebang preserved.
    Tool,
    /// Knowledge markdown; signature and YAML frontmatter stripped.
    Knowledge,
}

/// Extract the declared [`ToolManifest`] from file content.
///
/// The signature line (if any) is ignored.  The first matching declaration
/// shape wins: YAML frontmatter, then `#`-comment header, then an XML
/// comment block.
///
/// # Errors
///
/// [`ManifestError::MissingDeclaration`] when no declaration shape is
/// present, [`ManifestError::Malformed`] when the declaration does not
/// parse as a manifest.
pub fn extract_manifest(content: &str) -> Result<ToolManifest, ManifestError> {
    let content = remove_signature(content);

    let declaration = frontmatter_block(&content)
        .or_else(|| comment_header_block(&content))
        .or_else(|| xml_comment_block(&content))
        .ok_or(ManifestError::MissingDeclaration)?;

    let manifest: ToolManifest =
        serde_yaml::from_str(&declaration).map_err(|e| ManifestError::Malformed {
            reason: e.to_string(),
        })?;
    manifest.validate()?;
    Ok(manifest)
}

/// Extract the canonical content used for content-addressed hashing.
#[must_use]
pub fn canonical_content(content: &str, kind: ContentKind) -> String {
    let stripped = remove_signature(content);
    match kind {
        ContentKind::Directive => stripped,
        ContentKind::Tool => strip_comment_header(&stripped),
        ContentKind::Knowledge => strip_frontmatter(&stripped),
    }
}

/// YAML frontmatter fenced by `---` lines at the very top of the file.
fn frontmatter_block(content: &str) -> Option<String> {
    let rest = content.strip_prefix("---\n")?;
    let end = rest.find("\n---")?;
    Some(rest[..end].to_string())
}

/// Leading `#`-comment header after an optional shebang line.
///
/// The header lines are uncommented (leading `#` plus at most one space
/// removed) and the result parsed as YAML by the caller.
fn comment_header_block(content: &str) -> Option<String> {
    let mut lines = content.lines().peekable();

    // Skip a shebang; it is not part of the declaration.
    if let Some(first) = lines.peek() {
        if first.starts_with("#!") {
            lines.next();
        }
    }

    let mut declaration = String::new();
    let mut saw_comment = false;
    for line in lines {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            if saw_comment {
                break;
            }
            continue;
        }
        let Some(body) = trimmed.strip_prefix('#') else {
            break;
        };
        saw_comment = true;
        declaration.push_str(body.strip_prefix(' ').unwrap_or(body));
        declaration.push('\n');
    }

    if saw_comment && declaration.contains("tool_id") {
        Some(declaration)
    } else {
        None
    }
}

/// Leading `<!-- … -->` comment block.
fn xml_comment_block(content: &str) -> Option<String> {
    let trimmed = content.trim_start();
    let rest = trimmed.strip_prefix("<!--")?;
    let end = rest.find("-->")?;
    let inner = rest[..end].trim();
    if inner.contains("tool_id") {
        Some(inner.to_string())
    } else {
        None
    }
}

/// Drop the leading comment metadata header, preserving any shebang.
fn strip_comment_header(content: &str) -> String {
    let mut out = String::new();
    let mut lines = content.lines().peekable();

    if let Some(first) = lines.peek() {
        if first.starts_with("#!") {
            out.push_str(first);
            out.push('\n');
            lines.next();
        }
    }

    let mut in_header = true;
    for line in lines {
        if in_header {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            in_header = false;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Drop YAML frontmatter fenced by `---` lines.
fn strip_frontmatter(content: &str) -> String {
    if let Some(rest) = content.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---") {
            let after = &rest[end + 4..];
            return after.strip_prefix('\n').unwrap_or(after).to_string();
        }
    }
    content.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign_content;

    const SCRIPT: &str = "#!/usr/bin/env python3\n\
# tool_id: scraper\n\
# tool_type: api\n\
# version: 1.0.0\n\
# executor_id: http_client\n\
# config:\n\
#   url: \"https://example.com/{path}\"\n\
# parameters:\n\
#   - name: path\n\
#     type: string\n\
#     required: true\n\
\n\
print(\"body\")\n";

    #[test]
    fn extracts_comment_header_manifest() {
        let m = extract_manifest(SCRIPT).unwrap();
        assert_eq!(m.tool_id, "scraper");
        assert_eq!(m.tool_type, "api");
        assert_eq!(m.executor_id.as_deref(), Some("http_client"));
        assert_eq!(m.config["url"], "https://example.com/{path}");
        assert_eq!(m.parameters.len(), 1);
        assert!(m.parameters[0].required);
    }

    #[test]
    fn extracts_frontmatter_manifest() {
        let content = "---\n\
tool_id: notes\n\
tool_type: primitive\n\
version: 0.2.0\n\
---\n\
body text\n";
        let m = extract_manifest(content).unwrap();
        assert_eq!(m.tool_id, "notes");
        assert!(m.is_primitive());
    }

    #[test]
    fn extracts_xml_comment_manifest() {
        let content = "<!--\n\
tool_id: report\n\
tool_type: template\n\
version: 1.1.0\n\
executor_id: subprocess\n\
-->\n\
<report/>\n";
        let m = extract_manifest(content).unwrap();
        assert_eq!(m.tool_id, "report");
        assert_eq!(m.executor_id.as_deref(), Some("subprocess"));
    }

    #[test]
    fn missing_declaration_errors() {
        let err = extract_manifest("just a plain file\n").unwrap_err();
        assert!(matches!(err, ManifestError::MissingDeclaration));
    }

    #[test]
    fn malformed_declaration_errors() {
        let content = "# tool_id: [unclosed\n# tool_type: api\n";
        assert!(extract_manifest(content).is_err());
    }

    #[test]
    fn signature_line_does_not_disturb_extraction() {
        let signed = sign_content(SCRIPT, ContentKind::Tool, std::path::Path::new("t.py"));
        let m = extract_manifest(&signed).unwrap();
        assert_eq!(m.tool_id, "scraper");
    }

    #[test]
    fn tool_canonical_content_keeps_shebang_drops_header() {
        let canon = canonical_content(SCRIPT, ContentKind::Tool);
        assert!(canon.starts_with("#!/usr/bin/env python3\n"));
        assert!(!canon.contains("tool_id"));
        assert!(canon.contains("print(\"body\")"));
    }

    #[test]
    fn knowledge_canonical_content_drops_frontmatter() {
        let content = "---\ntitle: api patterns\n---\n# Heading\nbody\n";
        let canon = canonical_content(content, ContentKind::Knowledge);
        assert_eq!(canon, "# Heading\nbody\n");
    }

    #[test]
    fn directive_canonical_content_keeps_everything_but_signature() {
        let content = "<directive name=\"deploy\"/>\n";
        assert_eq!(canonical_content(content, ContentKind::Directive), content);
    }

    #[test]
    fn canonical_content_is_signature_invariant() {
        let unsigned = canonical_content(SCRIPT, ContentKind::Tool);
        let signed = sign_content(SCRIPT, ContentKind::Tool, std::path::Path::new("t.py"));
        assert_eq!(canonical_content(&signed, ContentKind::Tool), unsigned);
    }
}
