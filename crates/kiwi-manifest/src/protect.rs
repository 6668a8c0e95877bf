// SPDX-License-Identifier: MIT OR Apache-2.0
//! Protected namespace prefixes.
//!
//! Kernel-owned tool and knowledge namespaces may not be shadowed by
//! user-space authors.  Directives are never protected.

use crate::extract::ContentKind;
use std::path::Path;

/// Tool paths (relative to a `tools/` root) reserved for the kernel.
pub const PROTECTED_TOOL_PREFIXES: &[&str] =
    &["core/", "primitives/", "runtimes/", "capabilities/"];

/// Knowledge paths (relative to a `knowledge/` root) reserved for the kernel.
pub const PROTECTED_KNOWLEDGE_PREFIXES: &[&str] = &["lilux/", "rye/"];

/// Returns `true` when `relative_path` falls inside a protected namespace
/// for the given content kind.
///
/// `relative_path` is relative to the kind's content root (`tools/` or
/// `knowledge/`).
///
/// # Examples
///
/// ```
/// use kiwi_manifest::{is_protected, ContentKind};
/// use std::path::Path;
///
/// assert!(is_protected(ContentKind::Tool, Path::new("primitives/http_client.py")));
/// assert!(!is_protected(ContentKind::Tool, Path::new("scrapers/fetch.py")));
/// assert!(!is_protected(ContentKind::Directive, Path::new("core/deploy.xml")));
/// ```
#[must_use]
pub fn is_protected(kind: ContentKind, relative_path: &Path) -> bool {
    let prefixes: &[&str] = match kind {
        ContentKind::Tool => PROTECTED_TOOL_PREFIXES,
        ContentKind::Knowledge => PROTECTED_KNOWLEDGE_PREFIXES,
        ContentKind::Directive => return false,
    };
    let normalized = relative_path.to_string_lossy().replace('\\', "/");
    prefixes.iter().any(|p| normalized.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_tool_namespaces_are_protected() {
        for prefix in PROTECTED_TOOL_PREFIXES {
            let path = format!("{prefix}thing.py");
            assert!(is_protected(ContentKind::Tool, Path::new(&path)), "{path}");
        }
    }

    #[test]
    fn user_tool_paths_are_not_protected() {
        assert!(!is_protected(ContentKind::Tool, Path::new("scrapers/web.py")));
        assert!(!is_protected(ContentKind::Tool, Path::new("corex/web.py")));
    }

    #[test]
    fn kernel_knowledge_namespaces_are_protected() {
        assert!(is_protected(
            ContentKind::Knowledge,
            Path::new("lilux/internals.md")
        ));
        assert!(is_protected(
            ContentKind::Knowledge,
            Path::new("rye/handlers.md")
        ));
        assert!(!is_protected(
            ContentKind::Knowledge,
            Path::new("team/patterns.md")
        ));
    }

    #[test]
    fn directives_are_never_protected() {
        assert!(!is_protected(
            ContentKind::Directive,
            Path::new("core/deploy.xml")
        ));
    }
}
