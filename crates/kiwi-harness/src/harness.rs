// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-thread safety harness.
//!
//! The harness is orthogonal middleware: it accumulates cost after each
//! LLM turn, checks limits before each step, and evaluates declarative
//! hooks at checkpoints.  It never owns the scheduler; it publishes
//! checkpoint results that the directive runner consults.  Limits are
//! per-harness; child threads get fresh harnesses with no cost
//! inheritance.

use crate::expr::{self, Expr, ExpressionError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Cost tracking
// ---------------------------------------------------------------------------

/// Per-thread cost counters.  Created with the thread, never shared.
#[derive(Debug, Clone)]
pub struct CostTracker {
    /// LLM turns taken.
    pub turns: u64,
    /// Total tokens (input + output).
    pub tokens: u64,
    /// Input-side tokens.
    pub input_tokens: u64,
    /// Output-side tokens.
    pub output_tokens: u64,
    /// Child threads spawned.
    pub spawns: u64,
    /// Spend in USD.
    pub spend: f64,
    started_at: Instant,
}

impl CostTracker {
    /// Fresh tracker with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            turns: 0,
            tokens: 0,
            input_tokens: 0,
            output_tokens: 0,
            spawns: 0,
            spend: 0.0,
            started_at: Instant::now(),
        }
    }

    /// Seconds since the tracker was created.
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// JSON snapshot for contexts and status reports.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "turns": self.turns,
            "tokens": self.tokens,
            "input_tokens": self.input_tokens,
            "output_tokens": self.output_tokens,
            "spawns": self.spawns,
            "spend": self.spend,
            "duration_seconds": self.duration_seconds(),
        })
    }
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-harness limits; `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum LLM turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turns: Option<u64>,
    /// Maximum total tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Maximum child spawns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawns: Option<u64>,
    /// Maximum wall-clock seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Maximum spend in USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spend: Option<f64>,
}

impl Limits {
    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Per-model token pricing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// USD per million input tokens.
    pub input_per_million: f64,
    /// USD per million output tokens.
    pub output_per_million: f64,
}

/// Pricing table keyed by model, with a `default` fallback entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTable {
    /// Known models.
    #[serde(default)]
    pub models: std::collections::BTreeMap<String, ModelPricing>,
    /// Fallback pricing for unknown models.
    pub default: ModelPricing,
}

impl PricingTable {
    /// Load from the project's pricing YAML
    /// (`.ai/tools/llm/pricing.yaml`); fall back to the built-in default
    /// when absent or unparseable.
    #[must_use]
    pub fn load(project_path: &Path) -> Self {
        let path = project_path
            .join(".ai")
            .join("tools")
            .join("llm")
            .join("pricing.yaml");
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_yaml::from_str(&content).unwrap_or_else(|e| {
                warn!(target: "kiwi.harness", error = %e, "malformed pricing table, using defaults");
                Self::fallback()
            }),
            Err(_) => Self::fallback(),
        }
    }

    /// Built-in conservative default pricing.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            models: std::collections::BTreeMap::new(),
            default: ModelPricing {
                input_per_million: 5.0,
                output_per_million: 15.0,
            },
        }
    }

    /// Pricing for `model`, falling back to the `default` entry.
    #[must_use]
    pub fn for_model(&self, model: &str) -> ModelPricing {
        self.models.get(model).copied().unwrap_or(self.default)
    }
}

/// Usage extracted from one LLM response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Input-side tokens.
    pub input_tokens: u64,
    /// Output-side tokens.
    pub output_tokens: u64,
    /// Combined total.
    pub total_tokens: u64,
    /// `true` when tokens were estimated from content length.
    pub estimated: bool,
}

/// Extract usage from a response, recognizing both the
/// `prompt_tokens`/`completion_tokens` and `input_tokens`/`output_tokens`
/// conventions.  With neither present, output tokens are estimated as
/// `max(1, content_len / 4)` and flagged.
#[must_use]
pub fn extract_usage(response: &Value) -> Usage {
    let usage = response.get("usage");

    let input = usage
        .and_then(|u| u.get("prompt_tokens").or_else(|| u.get("input_tokens")))
        .and_then(Value::as_u64);
    let output = usage
        .and_then(|u| {
            u.get("completion_tokens")
                .or_else(|| u.get("output_tokens"))
        })
        .and_then(Value::as_u64);

    match (input, output) {
        (Some(input_tokens), Some(output_tokens)) => {
            let total_tokens = usage
                .and_then(|u| u.get("total_tokens"))
                .and_then(Value::as_u64)
                .unwrap_or(input_tokens + output_tokens);
            Usage {
                input_tokens,
                output_tokens,
                total_tokens,
                estimated: false,
            }
        }
        _ => {
            let content_len = response
                .get("content")
                .and_then(Value::as_str)
                .map_or(0, str::len);
            let output_tokens = ((content_len / 4) as u64).max(1);
            Usage {
                input_tokens: 0,
                output_tokens,
                total_tokens: output_tokens,
                estimated: true,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Hooks and checkpoint results
// ---------------------------------------------------------------------------

/// Declarative hook: when the expression matches, hand off to a
/// directive with templated inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSpec {
    /// Match expression over the checkpoint context.
    pub when: String,
    /// Directive to hand off to.
    pub directive: String,
    /// Inputs whose string values may contain `${path}` templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
}

/// What the directive runner should do after a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessAction {
    /// Proceed with the step.
    Continue,
    /// Stop and wait for external resumption.
    Pause,
    /// Hand off to the matched hook directive.
    Hook,
}

/// Checkpoint outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessResult {
    /// Action the runner should take.
    pub action: HarnessAction,
    /// For `Hook`: `{hook_directive, hook_inputs}`.  For `Pause`: the
    /// pause reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl HarnessResult {
    fn proceed() -> Self {
        Self {
            action: HarnessAction::Continue,
            context: None,
        }
    }
}

// ---------------------------------------------------------------------------
// SafetyHarness
// ---------------------------------------------------------------------------

/// Per-thread state machine that accumulates cost and drives checkpoint
/// decisions.
pub struct SafetyHarness {
    limits: Limits,
    hooks: Vec<(HookSpec, Expr)>,
    cost: CostTracker,
    directive_name: String,
    directive_inputs: Value,
    pricing: PricingTable,
    pending_pause: Option<String>,
}

impl SafetyHarness {
    /// Create a harness for a directive thread.
    ///
    /// Hook expressions are parsed here; a malformed `when` clause is a
    /// registration-time error.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError`] for the first malformed hook.
    pub fn new(
        project_path: &Path,
        limits: Limits,
        hooks: Vec<HookSpec>,
        directive_name: impl Into<String>,
        directive_inputs: Value,
    ) -> Result<Self, ExpressionError> {
        let mut parsed = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let expr = expr::parse(&hook.when)?;
            parsed.push((hook, expr));
        }
        Ok(Self {
            limits,
            hooks: parsed,
            cost: CostTracker::new(),
            directive_name: directive_name.into(),
            directive_inputs,
            pricing: PricingTable::load(project_path),
            pending_pause: None,
        })
    }

    /// The accumulated cost counters.
    #[must_use]
    pub fn cost(&self) -> &CostTracker {
        &self.cost
    }

    /// Mutable cost access for the runner (turn bookkeeping lives here).
    pub fn cost_mut(&mut self) -> &mut CostTracker {
        &mut self.cost
    }

    /// The configured limits.
    #[must_use]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Record the cost of one completed LLM turn.
    ///
    /// Returns the extracted usage so callers can persist it.
    pub fn update_cost_after_turn(&mut self, response: &Value, model: &str) -> Usage {
        let usage = extract_usage(response);
        let pricing = self.pricing.for_model(model);
        let spend = (usage.input_tokens as f64 / 1_000_000.0) * pricing.input_per_million
            + (usage.output_tokens as f64 / 1_000_000.0) * pricing.output_per_million;

        self.cost.turns += 1;
        self.cost.tokens += usage.total_tokens;
        self.cost.input_tokens += usage.input_tokens;
        self.cost.output_tokens += usage.output_tokens;
        self.cost.spend += spend;

        debug!(
            target: "kiwi.harness",
            directive = %self.directive_name,
            turns = self.cost.turns,
            tokens = self.cost.tokens,
            spend = self.cost.spend,
            estimated = usage.estimated,
            "cost updated after turn"
        );
        usage
    }

    /// Record one child-thread spawn.
    pub fn increment_spawn_count(&mut self) {
        self.cost.spawns += 1;
    }

    /// Ask the harness to pause the thread at its next checkpoint.
    pub fn request_pause(&mut self, reason: impl Into<String>) {
        self.pending_pause = Some(reason.into());
    }

    /// Compare cost against limits; the first exceeded metric yields a
    /// synthetic limits event for the hook phase.
    #[must_use]
    pub fn check_limits(&self) -> Option<Value> {
        let exceeded = |code: &str, current: Value, max: Value| {
            Some(json!({
                "name": "limits",
                "code": code,
                "current": current,
                "max": max,
            }))
        };

        if let Some(max) = self.limits.turns {
            if self.cost.turns >= max {
                return exceeded("turns_exceeded", json!(self.cost.turns), json!(max));
            }
        }
        if let Some(max) = self.limits.tokens {
            if self.cost.tokens >= max {
                return exceeded("tokens_exceeded", json!(self.cost.tokens), json!(max));
            }
        }
        if let Some(max) = self.limits.spawns {
            if self.cost.spawns >= max {
                return exceeded("spawns_exceeded", json!(self.cost.spawns), json!(max));
            }
        }
        if let Some(max) = self.limits.duration_seconds {
            let elapsed = self.cost.duration_seconds();
            if elapsed > max {
                return exceeded("duration_exceeded", json!(elapsed), json!(max));
            }
        }
        if let Some(max) = self.limits.spend {
            if self.cost.spend > max {
                return exceeded("spend_exceeded", json!(self.cost.spend), json!(max));
            }
        }
        None
    }

    /// Build the checkpoint context fed to hook expressions.
    #[must_use]
    pub fn build_context(&self, event: &Value) -> Value {
        json!({
            "event": event,
            "directive": {
                "name": self.directive_name,
                "inputs": self.directive_inputs,
            },
            "cost": self.cost.to_value(),
            "limits": self.limits.to_value(),
        })
    }

    /// Evaluate hooks against an event.  First-match semantics: hooks are
    /// tried in registration order and at most one fires.  A runtime
    /// evaluation fault suppresses that hook and moves on.
    #[must_use]
    pub fn evaluate_hooks(&self, event: &Value) -> HarnessResult {
        let context = self.build_context(event);

        for (spec, expr) in &self.hooks {
            match expr::evaluate(expr, &context) {
                Ok(value) if expr::truthy(&value) => {
                    let inputs = spec
                        .inputs
                        .as_ref()
                        .map(|inputs| expr::substitute_templates(inputs, &context))
                        .unwrap_or_else(|| json!({}));
                    debug!(
                        target: "kiwi.harness",
                        directive = %spec.directive,
                        "hook matched"
                    );
                    return HarnessResult {
                        action: HarnessAction::Hook,
                        context: Some(json!({
                            "hook_directive": spec.directive,
                            "hook_inputs": inputs,
                        })),
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        target: "kiwi.harness",
                        directive = %spec.directive,
                        error = %e,
                        "hook expression fault, suppressed"
                    );
                }
            }
        }
        HarnessResult::proceed()
    }

    /// Checkpoint before a step: honors a pending pause, then limits,
    /// then falls through to continue.
    pub fn checkpoint_before_step(&mut self, step: &str) -> HarnessResult {
        if let Some(reason) = self.pending_pause.take() {
            return HarnessResult {
                action: HarnessAction::Pause,
                context: Some(json!({"reason": reason})),
            };
        }

        if let Some(limit_event) = self.check_limits() {
            let result = self.evaluate_hooks(&limit_event);
            if result.action == HarnessAction::Hook {
                return result;
            }
            // No hook claimed the limit event; the runner must stop.
            return HarnessResult {
                action: HarnessAction::Pause,
                context: Some(limit_event),
            };
        }

        let event = json!({"name": "before_step", "step": step});
        self.evaluate_hooks(&event)
    }

    /// Checkpoint after a step completes.
    #[must_use]
    pub fn checkpoint_after_step(&self, step: &str, result: &Value) -> HarnessResult {
        let event = json!({"name": "after_step", "step": step, "result": result});
        self.evaluate_hooks(&event)
    }

    /// Checkpoint on an error event.
    #[must_use]
    pub fn checkpoint_on_error(&self, code: &str, detail: &Value) -> HarnessResult {
        let event = json!({"name": "error", "code": code, "detail": detail});
        self.evaluate_hooks(&event)
    }

    /// Status snapshot for diagnostics.
    #[must_use]
    pub fn status(&self) -> Value {
        json!({
            "directive": self.directive_name,
            "cost": self.cost.to_value(),
            "limits": self.limits.to_value(),
            "hooks_count": self.hooks.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
