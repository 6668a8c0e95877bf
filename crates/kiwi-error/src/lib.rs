// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the Kiwi kernel.
//!
//! Every kernel error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context.  Use the builder returned by
//! [`KernelError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Tool lookup / chain walk errors.
    Resolution,
    /// Chain structure validation errors.
    Validation,
    /// Lockfile pinning errors.
    Lockfile,
    /// Content hash / file integrity errors.
    Integrity,
    /// Credential store errors.
    Auth,
    /// Primitive execution errors.
    Execution,
    /// Safety-harness errors.
    Harness,
    /// Capability token errors.
    Token,
    /// Hook expression errors.
    Expression,
    /// Thread registry errors.
    Registry,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Resolution => "resolution",
            Self::Validation => "validation",
            Self::Lockfile => "lockfile",
            Self::Integrity => "integrity",
            Self::Auth => "auth",
            Self::Execution => "execution",
            Self::Harness => "harness",
            Self::Token => "token",
            Self::Expression => "expression",
            Self::Registry => "registry",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Resolution --
    /// Tool not found in any search tier.
    ResolutionNotFound,
    /// The executor chain revisits a tool.
    ResolutionCycle,
    /// A manifest failed to parse or is structurally invalid.
    ResolutionInvalidManifest,

    // -- Validation --
    /// A child declares parameters its parent cannot consume.
    ValidationParameterMismatch,
    /// The chain does not end in a recognized primitive.
    ValidationMissingPrimitive,

    // -- Lockfile --
    /// Resolved chain deviates from the frozen lockfile.
    LockfileDrift,
    /// Strict execution requires a lockfile and none exists.
    LockfileMissing,

    // -- Integrity --
    /// File content does not match its recorded hash.
    IntegrityMismatch,
    /// Artifact could not be read for hashing.
    IntegrityUnreadable,

    // -- Auth --
    /// Missing or expired credential with failed refresh.
    AuthRequired,

    // -- Execution --
    /// HTTP transport failure or policy-rejected status.
    ExecutionHttp,
    /// Subprocess spawn, permission, timeout, or exit failure.
    ExecutionSubprocess,

    // -- Harness --
    /// A cost metric exceeded its configured limit.
    HarnessLimit,
    /// A hook directive failed unrecoverably.
    HarnessHook,

    // -- Token --
    /// Token expiry is in the past.
    TokenExpired,
    /// Ed25519 signature missing or invalid.
    TokenInvalidSignature,
    /// A required capability was not granted.
    TokenCapabilityNotGranted,

    // -- Expression --
    /// Hook `when` clause failed to parse at registration time.
    ExpressionInvalid,

    // -- Registry --
    /// Illegal thread status transition or duplicate registration.
    RegistryConflict,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ResolutionNotFound | Self::ResolutionCycle | Self::ResolutionInvalidManifest => {
                ErrorCategory::Resolution
            }

            Self::ValidationParameterMismatch | Self::ValidationMissingPrimitive => {
                ErrorCategory::Validation
            }

            Self::LockfileDrift | Self::LockfileMissing => ErrorCategory::Lockfile,

            Self::IntegrityMismatch | Self::IntegrityUnreadable => ErrorCategory::Integrity,

            Self::AuthRequired => ErrorCategory::Auth,

            Self::ExecutionHttp | Self::ExecutionSubprocess => ErrorCategory::Execution,

            Self::HarnessLimit | Self::HarnessHook => ErrorCategory::Harness,

            Self::TokenExpired | Self::TokenInvalidSignature | Self::TokenCapabilityNotGranted => {
                ErrorCategory::Token
            }

            Self::ExpressionInvalid => ErrorCategory::Expression,

            Self::RegistryConflict => ErrorCategory::Registry,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"LOCKFILE_DRIFT"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolutionNotFound => "RESOLUTION_NOT_FOUND",
            Self::ResolutionCycle => "RESOLUTION_CYCLE",
            Self::ResolutionInvalidManifest => "RESOLUTION_INVALID_MANIFEST",
            Self::ValidationParameterMismatch => "VALIDATION_PARAMETER_MISMATCH",
            Self::ValidationMissingPrimitive => "VALIDATION_MISSING_PRIMITIVE",
            Self::LockfileDrift => "LOCKFILE_DRIFT",
            Self::LockfileMissing => "LOCKFILE_MISSING",
            Self::IntegrityMismatch => "INTEGRITY_MISMATCH",
            Self::IntegrityUnreadable => "INTEGRITY_UNREADABLE",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::ExecutionHttp => "EXECUTION_HTTP",
            Self::ExecutionSubprocess => "EXECUTION_SUBPROCESS",
            Self::HarnessLimit => "HARNESS_LIMIT",
            Self::HarnessHook => "HARNESS_HOOK",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenInvalidSignature => "TOKEN_INVALID_SIGNATURE",
            Self::TokenCapabilityNotGranted => "TOKEN_CAPABILITY_NOT_GRANTED",
            Self::ExpressionInvalid => "EXPRESSION_INVALID",
            Self::RegistryConflict => "REGISTRY_CONFLICT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// KernelError
// ---------------------------------------------------------------------------

/// Unified kernel error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use kiwi_error::{ErrorCode, KernelError};
///
/// let err = KernelError::new(ErrorCode::LockfileDrift, "hash mismatch on scraper")
///     .with_context("tool_id", "scraper")
///     .with_context("chain_position", 0);
/// ```
pub struct KernelError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl KernelError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("KernelError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for KernelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`KernelError`] (without the opaque source).
///
/// This is the shape surfaced to callers: a structured object, never a
/// stack trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&KernelError> for KernelErrorDto {
    fn from(err: &KernelError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<KernelErrorDto> for KernelError {
    fn from(dto: KernelErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
