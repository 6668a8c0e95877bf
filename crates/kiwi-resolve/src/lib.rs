// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool chain resolution and validation.
//!
//! Given a tool name, the [`ChainResolver`] walks `executor_id` pointers
//! down to a terminal primitive, hashing every link on the way, and the
//! [`ChainValidator`] checks the structural contract between adjacent
//! links before anything executes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod resolver;
mod validate;

pub use resolver::ChainResolver;
pub use validate::{validate_chain, ChainValidationResult, PRIMITIVE_IDS};

use kiwi_manifest::ToolManifest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Which search tier a tool was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    /// Project-local `.ai/tools/`.
    Local,
    /// User space `~/.ai/tools/`.
    User,
    /// Shared registry.
    Registry,
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::User => "user",
            Self::Registry => "registry",
        };
        f.write_str(s)
    }
}

/// Hash of one file belonging to a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    /// Path relative to the tool's directory.
    pub path: String,
    /// Hex-encoded SHA-256 of the file bytes.
    pub sha256: String,
}

/// The concrete form a resolver emits per chain node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLink {
    /// The tool's declared manifest.
    pub manifest: ToolManifest,
    /// SHA-256 of the tool's canonical content.
    pub content_hash: String,
    /// Per-file hashes for every file under the tool's directory.
    pub files: Vec<FileHash>,
    /// Absolute path of the manifest-bearing file.
    pub file_path: PathBuf,
    /// Tier the tool was found in.
    pub source: SourceTier,
}

impl ResolvedLink {
    /// Shorthand for the link's tool id.
    #[must_use]
    pub fn tool_id(&self) -> &str {
        &self.manifest.tool_id
    }
}

/// Ordered sequence of [`ResolvedLink`] from called tool to terminal
/// primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    links: Vec<ResolvedLink>,
}

impl Chain {
    /// Wrap resolved links, checking the chain invariants:
    /// a non-empty sequence, a primitive terminal, no repeated tool id,
    /// and `links[i].executor_id == links[i + 1].tool_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::InvalidManifest`] naming the violated
    /// invariant.
    pub fn new(links: Vec<ResolvedLink>) -> Result<Self, ResolutionError> {
        let Some(last) = links.last() else {
            return Err(ResolutionError::InvalidManifest {
                tool_id: String::new(),
                reason: "chain must not be empty".into(),
            });
        };
        if !last.manifest.is_primitive() {
            return Err(ResolutionError::InvalidManifest {
                tool_id: last.tool_id().to_string(),
                reason: "chain must terminate in a primitive".into(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for link in &links {
            if !seen.insert(link.tool_id().to_string()) {
                return Err(ResolutionError::Cycle {
                    tool_id: link.tool_id().to_string(),
                    chain: links.iter().map(|l| l.tool_id().to_string()).collect(),
                });
            }
        }
        for pair in links.windows(2) {
            let declared = pair[0].manifest.executor_id.as_deref();
            if declared != Some(pair[1].tool_id()) {
                return Err(ResolutionError::InvalidManifest {
                    tool_id: pair[0].tool_id().to_string(),
                    reason: format!(
                        "executor_id {:?} does not match next link '{}'",
                        declared,
                        pair[1].tool_id()
                    ),
                });
            }
        }
        Ok(Self { links })
    }

    /// The called tool (index 0).
    #[must_use]
    pub fn called(&self) -> &ResolvedLink {
        &self.links[0]
    }

    /// The terminal primitive (last index).
    #[must_use]
    pub fn terminal(&self) -> &ResolvedLink {
        self.links.last().expect("chain is never empty")
    }

    /// All links in order, called tool first.
    #[must_use]
    pub fn links(&self) -> &[ResolvedLink] {
        &self.links
    }

    /// Number of links.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Chains are never empty; provided for clippy symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Iterate links in order.
    pub fn iter(&self) -> std::slice::Iter<'_, ResolvedLink> {
        self.links.iter()
    }
}

impl<'a> IntoIterator for &'a Chain {
    type Item = &'a ResolvedLink;
    type IntoIter = std::slice::Iter<'a, ResolvedLink>;

    fn into_iter(self) -> Self::IntoIter {
        self.links.iter()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from chain resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    /// The tool was not found in any search tier.
    #[error("tool '{tool_id}' not found (searched {searched:?})")]
    NotFound {
        /// Requested tool id.
        tool_id: String,
        /// Root directories that were searched.
        searched: Vec<PathBuf>,
    },

    /// The executor chain revisits a tool.
    #[error("cycle detected at '{tool_id}' (chain: {chain:?})")]
    Cycle {
        /// Tool id that was revisited.
        tool_id: String,
        /// Tool ids walked before the repeat.
        chain: Vec<String>,
    },

    /// A manifest failed to parse or violates a structural invariant.
    #[error("invalid manifest for '{tool_id}': {reason}")]
    InvalidManifest {
        /// Offending tool id.
        tool_id: String,
        /// Why the manifest was rejected.
        reason: String,
    },

    /// A tool file could not be read.
    #[error("unreadable tool file: {path}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_manifest::{ToolManifest, PRIMITIVE_TYPE};

    fn link(tool_id: &str, tool_type: &str, executor_id: Option<&str>) -> ResolvedLink {
        ResolvedLink {
            manifest: ToolManifest {
                tool_id: tool_id.into(),
                tool_type: tool_type.into(),
                version: semver::Version::new(1, 0, 0),
                executor_id: executor_id.map(String::from),
                config: serde_json::json!({}),
                parameters: vec![],
                required_scope: None,
                signature_format: None,
            },
            content_hash: kiwi_integrity::content_hash(tool_id),
            files: vec![],
            file_path: PathBuf::from(format!("/tools/{tool_id}.py")),
            source: SourceTier::Local,
        }
    }

    #[test]
    fn valid_chain_constructs() {
        let chain = Chain::new(vec![
            link("scraper", "api", Some("http_client")),
            link("http_client", PRIMITIVE_TYPE, None),
        ])
        .unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.called().tool_id(), "scraper");
        assert_eq!(chain.terminal().tool_id(), "http_client");
    }

    #[test]
    fn empty_chain_rejected() {
        assert!(Chain::new(vec![]).is_err());
    }

    #[test]
    fn non_primitive_terminal_rejected() {
        let err = Chain::new(vec![link("scraper", "api", Some("x"))]).unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidManifest { .. }));
    }

    #[test]
    fn repeated_tool_id_rejected() {
        // Terminal is fine, but the same id appears twice.
        let err = Chain::new(vec![
            link("a", "api", Some("a")),
            link("a", PRIMITIVE_TYPE, None),
        ])
        .unwrap_err();
        assert!(matches!(err, ResolutionError::Cycle { .. }));
    }

    #[test]
    fn executor_pointer_must_match_next_link() {
        let err = Chain::new(vec![
            link("a", "api", Some("b")),
            link("c", PRIMITIVE_TYPE, None),
        ])
        .unwrap_err();
        match err {
            ResolutionError::InvalidManifest { tool_id, .. } => assert_eq!(tool_id, "a"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn single_primitive_chain_is_valid() {
        let chain = Chain::new(vec![link("subprocess", PRIMITIVE_TYPE, None)]).unwrap();
        assert_eq!(chain.called().tool_id(), chain.terminal().tool_id());
    }

    #[test]
    fn chain_serde_roundtrip() {
        let chain = Chain::new(vec![link("subprocess", PRIMITIVE_TYPE, None)]).unwrap();
        let json = serde_json::to_string(&chain).unwrap();
        let back: Chain = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chain);
    }
}
