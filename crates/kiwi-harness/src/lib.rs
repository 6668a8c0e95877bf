// SPDX-License-Identifier: MIT OR Apache-2.0
//! Capability tokens and the per-thread safety harness.
//!
//! Two orthogonal pieces share this crate because they gate the same
//! boundary: what a directive thread may do and how much it may spend.
//!
//! - **Capability tokens** ([`capability`], [`keys`]): Ed25519-signed
//!   grants of dotted capability strings, attenuated by intersection when
//!   a thread spawns a child.
//! - **Safety harness** ([`harness`], [`expr`]): per-thread cost
//!   tracking, declarative hooks with a small boolean expression
//!   language, and checkpoint-driven intervention.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod capability;
pub mod expr;
pub mod harness;
pub mod keys;

pub use capability::{
    attenuate_token, mint_token, permissions_to_caps, sign_token, verify_token, CapabilityToken,
    PermissionStatement, TokenError, DEFAULT_AUDIENCE, DEFAULT_EXP_HOURS,
};
pub use expr::{
    evaluate, evaluate_expression, parse, resolve_path, substitute_templates, truthy, EvalError,
    Expr, ExpressionError,
};
pub use harness::{
    extract_usage, CostTracker, HarnessAction, HarnessResult, HookSpec, Limits, ModelPricing,
    PricingTable, SafetyHarness, Usage,
};
pub use keys::{
    default_key_dir, ensure_keypair, generate_keypair, load_signing_key, load_verifying_key,
    save_keypair, KeyError, PRIVATE_KEY_FILE, PUBLIC_KEY_FILE,
};
