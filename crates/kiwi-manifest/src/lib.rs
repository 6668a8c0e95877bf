// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool manifest model and on-disk metadata handling.
//!
//! A tool is authored as a source file (any extension) whose first comment
//! region or YAML frontmatter declares its manifest: identity, type,
//! version, executor pointer, opaque config, and parameter specs.  This
//! crate parses that declaration, extracts the canonical content used for
//! content-addressed hashing, and manages the `lilux:validated` signature
//! line that marks a file as signed.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod extract;
mod protect;
mod signature;

pub use extract::{canonical_content, extract_manifest, ContentKind};
pub use protect::{is_protected, PROTECTED_KNOWLEDGE_PREFIXES, PROTECTED_TOOL_PREFIXES};
pub use signature::{
    extract_signature, remove_signature, sign_content, signature_format_for, SignatureFormat,
    SignatureRecord,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved `tool_type` marking the terminal node of a chain.
pub const PRIMITIVE_TYPE: &str = "primitive";

/// Errors from manifest parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The file carries no recognizable manifest declaration.
    #[error("no manifest declaration found")]
    MissingDeclaration,

    /// The declaration was found but failed to parse.
    #[error("malformed manifest: {reason}")]
    Malformed {
        /// Human-readable parse failure.
        reason: String,
    },

    /// A structural invariant does not hold.
    #[error("invalid manifest for '{tool_id}': {reason}")]
    Invalid {
        /// Offending tool id (may be empty when the id itself is missing).
        tool_id: String,
        /// Which invariant was violated.
        reason: String,
    },
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name as referenced by `{name}` placeholders.
    pub name: String,
    /// Declared type label (`string`, `number`, `boolean`, `object`, …).
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    /// Whether the caller must supply this parameter.
    #[serde(default)]
    pub required: bool,
    /// Default value used when the caller omits the parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

fn default_param_type() -> String {
    "string".to_string()
}

/// Declarative record describing a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolManifest {
    /// Unique name within its namespace.
    pub tool_id: String,
    /// Free-form type label; `"primitive"` is reserved for terminal nodes.
    pub tool_type: String,
    /// Semantic version of the tool.
    pub version: semver::Version,
    /// Name of the next tool in the chain; absent for primitives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<String>,
    /// Opaque configuration merged down the chain.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Declared parameters.
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Capability scope required to execute this tool, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_scope: Option<String>,
    /// Signature comment format declared by extractor tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_format: Option<SignatureFormat>,
}

impl ToolManifest {
    /// Returns `true` when this manifest describes a terminal primitive.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        self.tool_type == PRIMITIVE_TYPE
    }

    /// Parameter spec by name, if declared.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Map of parameter defaults for parameters that declare one.
    #[must_use]
    pub fn parameter_defaults(&self) -> BTreeMap<String, serde_json::Value> {
        self.parameters
            .iter()
            .filter_map(|p| p.default.clone().map(|d| (p.name.clone(), d)))
            .collect()
    }

    /// Check the structural invariants of the manifest.
    ///
    /// - `tool_id` must be non-empty
    /// - `executor_id` is present iff `tool_type != "primitive"`
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Invalid`] naming the violated invariant.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.tool_id.trim().is_empty() {
            return Err(ManifestError::Invalid {
                tool_id: String::new(),
                reason: "tool_id must not be empty".into(),
            });
        }
        if self.is_primitive() && self.executor_id.is_some() {
            return Err(ManifestError::Invalid {
                tool_id: self.tool_id.clone(),
                reason: "primitive tools must not declare an executor_id".into(),
            });
        }
        if !self.is_primitive() && self.executor_id.is_none() {
            return Err(ManifestError::Invalid {
                tool_id: self.tool_id.clone(),
                reason: "non-primitive tools must declare an executor_id".into(),
            });
        }
        Ok(())
    }
}
