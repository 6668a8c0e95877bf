// SPDX-License-Identifier: MIT OR Apache-2.0
//! Primitive executor.
//!
//! Takes a tool name plus runtime parameters and produces an
//! [`ExecutionResult`].  The pipeline is: resolve the chain, validate it,
//! enforce the lockfile, merge config up the chain, inject auth,
//! substitute `{param}` templates, expand `${VAR}` references, and
//! dispatch the terminal primitive (HTTP or subprocess).  Any failure
//! before dispatch short-circuits; primitive failures come back as values
//! wrapped with chain context.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod http;
pub mod merge;
pub mod sink;
pub mod sse;
pub mod subprocess;
pub mod template;

pub use http::{HttpError, HttpMode, HttpPrimitive, HttpResult};
pub use sink::{build_sinks, EventSink, FileSink, ReturnSink};
pub use sse::SseParser;
pub use subprocess::{SubprocessPrimitive, SubprocessResult};
pub use template::TemplateError;

use kiwi_auth::{AuthError, AuthStore};
use kiwi_lockfile::{LockScope, LockfileError, LockfileStore};
use kiwi_resolve::{validate_chain, Chain, ChainResolver, ResolutionError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Outcome of executing a tool chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `true` when the primitive completed successfully.
    pub success: bool,
    /// Primitive output (HTTP body, or subprocess stdout/stderr record).
    pub output: Value,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the primitive.
    pub duration_ms: u64,
    /// Streamed events captured by the return sink, in delivery order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
    /// Structured context: primitive kind, chain position, status codes.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Errors that abort execution before (or instead of) primitive dispatch.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Chain resolution failed.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Chain validation failed in strict mode.
    #[error("chain validation failed: {errors:?}")]
    Validation {
        /// Validation errors.
        errors: Vec<String>,
    },

    /// Lockfile enforcement failed.
    #[error(transparent)]
    Lockfile(#[from] LockfileError),

    /// A required credential is missing or expired.
    #[error("authentication required for '{service}'")]
    AuthRequired {
        /// Service that needs a credential.
        service: String,
        /// Scope that was requested, if any.
        scope: Option<String>,
    },

    /// Template substitution failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The requested streaming mode is not recognized.
    #[error("unknown mode '{mode}' (expected 'sync' or 'stream')")]
    UnknownMode {
        /// The rejected mode string.
        mode: String,
    },
}

impl ExecutionError {
    /// Stable error code for this failure.
    #[must_use]
    pub fn code(&self) -> kiwi_error::ErrorCode {
        use kiwi_error::ErrorCode;
        match self {
            Self::Resolution(ResolutionError::NotFound { .. }) => ErrorCode::ResolutionNotFound,
            Self::Resolution(ResolutionError::Cycle { .. }) => ErrorCode::ResolutionCycle,
            Self::Resolution(_) => ErrorCode::ResolutionInvalidManifest,
            Self::Validation { .. } => ErrorCode::ValidationParameterMismatch,
            Self::Lockfile(LockfileError::Missing { .. }) => ErrorCode::LockfileMissing,
            Self::Lockfile(_) => ErrorCode::LockfileDrift,
            Self::AuthRequired { .. } => ErrorCode::AuthRequired,
            Self::Template(_) => ErrorCode::ValidationParameterMismatch,
            Self::UnknownMode { .. } => ErrorCode::ExecutionHttp,
        }
    }

    /// Structured failure object surfaced to callers; never a stack trace.
    #[must_use]
    pub fn to_failure(&self) -> Value {
        let mut metadata = Map::new();
        if let Self::AuthRequired { service, scope } = self {
            metadata.insert("auth_required".into(), Value::Bool(true));
            metadata.insert("service".into(), Value::String(service.clone()));
            if let Some(scope) = scope {
                metadata.insert("scope".into(), Value::String(scope.clone()));
            }
        }
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "code": self.code().as_str(),
            "metadata": metadata,
        })
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Execution policy knobs.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Strict mode: validation errors and missing lockfiles abort.
    pub strict: bool,
    /// Lockfile category directory.
    pub category: String,
    /// Lockfile scope.
    pub scope: LockScope,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            strict: true,
            category: "tools".into(),
            scope: LockScope::Project,
        }
    }
}

/// Orchestrates resolution, validation, lockfile enforcement, config
/// merging, auth injection, and primitive dispatch.
pub struct PrimitiveExecutor {
    resolver: ChainResolver,
    lockfiles: LockfileStore,
    auth: Arc<AuthStore>,
    http: HttpPrimitive,
    subprocess: SubprocessPrimitive,
    options: ExecutorOptions,
}

impl PrimitiveExecutor {
    /// Create an executor rooted at `project_path`, with an optional user
    /// space for the secondary search tier.
    #[must_use]
    pub fn new(
        project_path: &Path,
        user_space: Option<&Path>,
        auth: Arc<AuthStore>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            resolver: ChainResolver::new(project_path, user_space),
            lockfiles: LockfileStore::new(&project_path.join(".ai"), user_space),
            auth,
            http: HttpPrimitive::new(),
            subprocess: SubprocessPrimitive,
            options,
        }
    }

    /// Create an executor with an explicit resolver and lockfile store
    /// (tests, embedded setups).
    #[must_use]
    pub fn with_parts(
        resolver: ChainResolver,
        lockfiles: LockfileStore,
        auth: Arc<AuthStore>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            resolver,
            lockfiles,
            auth,
            http: HttpPrimitive::new(),
            subprocess: SubprocessPrimitive,
            options,
        }
    }

    /// Execute `tool_id` with runtime parameters.
    ///
    /// # Errors
    ///
    /// Pre-dispatch failures (resolution, validation, lockfile, auth,
    /// template) return [`ExecutionError`]; primitive failures come back
    /// as an [`ExecutionResult`] with `success == false`.
    pub async fn execute(
        &mut self,
        tool_id: &str,
        params: Map<String, Value>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let chain = self.resolver.resolve(tool_id)?;

        let validation = validate_chain(&chain, self.options.strict);
        if !validation.valid {
            return Err(ExecutionError::Validation {
                errors: validation.errors,
            });
        }
        for warning in &validation.warnings {
            debug!(target: "kiwi.exec", tool_id, warning = %warning, "chain validation warning");
        }

        self.lockfiles.enforce_chain(
            &chain,
            &self.options.category,
            self.options.scope,
            self.options.strict,
        )?;

        let configs: Vec<&Value> = chain.iter().map(|link| &link.manifest.config).collect();
        let mut merged = merge::merge_chain_configs(&configs);

        merged = self.inject_auth(&chain, merged).await?;

        let params = with_defaults(&chain, params);
        merged = template::substitute_value(&merged, &params)?;

        let env = env::merged_env(merged.get("env").and_then(Value::as_object));
        merged = env::expand_value(&merged, &env);

        info!(
            target: "kiwi.exec",
            tool_id,
            primitive = chain.terminal().tool_id(),
            links = chain.len(),
            "dispatching chain"
        );
        self.dispatch(&chain, &merged, &params).await
    }

    /// Fetch a credential for the first link that declares a scope and add
    /// it to the merged config as a bearer header.
    async fn inject_auth(
        &self,
        chain: &Chain,
        mut merged: Value,
    ) -> Result<Value, ExecutionError> {
        let Some(required) = chain
            .iter()
            .find_map(|link| link.manifest.required_scope.as_deref())
        else {
            return Ok(merged);
        };

        let (service, scope) = match required.split_once(':') {
            Some((service, scope)) => (service, Some(scope)),
            None => (required, None),
        };

        let token = self
            .auth
            .get_token(service, scope)
            .await
            .map_err(|e| match e {
                AuthError::AuthenticationRequired { service, scope } => {
                    ExecutionError::AuthRequired { service, scope }
                }
                // Refresh and vault failures still mean the caller must
                // sign in again.
                _ => ExecutionError::AuthRequired {
                    service: service.to_string(),
                    scope: scope.map(String::from),
                },
            })?;

        let headers = merged
            .as_object_mut()
            .map(|map| {
                map.entry("headers")
                    .or_insert_with(|| Value::Object(Map::new()))
            })
            .and_then(Value::as_object_mut);
        if let Some(headers) = headers {
            headers.insert(
                "authorization".into(),
                Value::String(format!("Bearer {token}")),
            );
        }
        Ok(merged)
    }

    async fn dispatch(
        &self,
        chain: &Chain,
        merged: &Value,
        params: &Map<String, Value>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let terminal = chain.terminal();
        let position = chain.len() - 1;

        match terminal.tool_id() {
            "subprocess" => {
                let result = self.subprocess.execute(merged).await;
                Ok(subprocess_result(result, terminal.tool_id(), position))
            }
            "http_client" => {
                let mode_str = params
                    .get("mode")
                    .and_then(Value::as_str)
                    .or_else(|| merged.get("mode").and_then(Value::as_str))
                    .unwrap_or("sync");
                let mode =
                    HttpMode::parse(mode_str).map_err(|mode| ExecutionError::UnknownMode { mode })?;

                let destinations = merged
                    .get("stream")
                    .and_then(|s| s.get("destinations"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let (mut sinks, return_handle) = build_sinks(&destinations);

                match self.http.execute(merged, mode, &mut sinks).await {
                    Ok(result) => Ok(http_result(
                        result,
                        return_handle.as_ref(),
                        terminal.tool_id(),
                        position,
                    )),
                    Err(e) => Ok(http_failure(
                        &e,
                        return_handle.as_ref(),
                        terminal.tool_id(),
                        position,
                    )),
                }
            }
            other => Err(ExecutionError::Validation {
                errors: vec![format!("unrecognized primitive '{other}'")],
            }),
        }
    }
}

/// Overlay parameter defaults declared anywhere in the chain under the
/// caller-supplied params.
fn with_defaults(chain: &Chain, mut params: Map<String, Value>) -> Map<String, Value> {
    for link in chain {
        for (name, default) in link.manifest.parameter_defaults() {
            params.entry(name).or_insert(default);
        }
    }
    params
}

fn chain_context(metadata: &mut Map<String, Value>, tool_id: &str, position: usize) {
    metadata.insert("failed_tool_id".into(), Value::String(tool_id.to_string()));
    metadata.insert("chain_position".into(), Value::from(position));
}

fn subprocess_result(result: SubprocessResult, tool_id: &str, position: usize) -> ExecutionResult {
    let mut metadata = Map::new();
    metadata.insert("primitive".into(), Value::String("subprocess".into()));
    metadata.insert("return_code".into(), Value::from(result.return_code));
    if !result.success {
        chain_context(&mut metadata, tool_id, position);
    }
    ExecutionResult {
        success: result.success,
        output: serde_json::json!({
            "stdout": result.stdout,
            "stderr": result.stderr,
            "return_code": result.return_code,
        }),
        error: (!result.success).then(|| result.stderr.clone()),
        duration_ms: result.duration_ms,
        events: vec![],
        metadata,
    }
}

fn http_result(
    result: HttpResult,
    return_handle: Option<&ReturnSink>,
    tool_id: &str,
    position: usize,
) -> ExecutionResult {
    let mut metadata = Map::new();
    metadata.insert("primitive".into(), Value::String("http_client".into()));
    if let Some(status) = result.status_code {
        metadata.insert("status_code".into(), Value::from(status));
    }
    metadata.insert(
        "stream_events_count".into(),
        Value::from(result.stream_events_count),
    );
    if result.interrupted {
        metadata.insert("interrupted".into(), Value::Bool(true));
    }
    if !result.success {
        chain_context(&mut metadata, tool_id, position);
    }
    ExecutionResult {
        success: result.success,
        error: (!result.success)
            .then(|| format!("http status {}", result.status_code.unwrap_or_default())),
        output: result.body,
        duration_ms: result.duration_ms,
        events: return_handle.map(ReturnSink::events).unwrap_or_default(),
        metadata,
    }
}

fn http_failure(
    error: &HttpError,
    return_handle: Option<&ReturnSink>,
    tool_id: &str,
    position: usize,
) -> ExecutionResult {
    let mut metadata = Map::new();
    metadata.insert("primitive".into(), Value::String("http_client".into()));
    chain_context(&mut metadata, tool_id, position);
    if let HttpError::Status { status } = error {
        metadata.insert("status_code".into(), Value::from(*status));
    }
    ExecutionResult {
        success: false,
        output: Value::Null,
        error: Some(error.to_string()),
        duration_ms: 0,
        events: return_handle.map(ReturnSink::events).unwrap_or_default(),
        metadata,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_auth::MemoryVault;
    use kiwi_resolve::SourceTier;
    use std::fs;
    use std::path::PathBuf;

    fn write_tool(root: &Path, rel: &str, manifest_yaml: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let commented: String = manifest_yaml
            .lines()
            .map(|l| format!("# {l}\n"))
            .collect();
        fs::write(path, format!("{commented}\npass\n")).unwrap();
    }

    fn executor(tools: PathBuf, ai_root: PathBuf, strict: bool) -> PrimitiveExecutor {
        PrimitiveExecutor::with_parts(
            ChainResolver::with_roots(vec![(SourceTier::Local, tools)]),
            LockfileStore::new(&ai_root, None),
            Arc::new(AuthStore::new(Arc::new(MemoryVault::new()))),
            ExecutorOptions {
                strict,
                ..ExecutorOptions::default()
            },
        )
    }

    fn echo_fixture(dir: &Path) -> (PathBuf, PathBuf) {
        let tools = dir.join("tools");
        write_tool(
            &tools,
            "primitives/subprocess.py",
            "tool_id: subprocess\ntool_type: primitive\nversion: 1.0.0",
        );
        write_tool(
            &tools,
            "say.py",
            "tool_id: say\ntool_type: command\nversion: 1.0.0\nexecutor_id: subprocess\n\
config:\n  command: echo\n  args: [\"{message}\"]\nparameters:\n  - name: message\n    type: string\n    required: true",
        );
        (tools, dir.join("ai"))
    }

    #[tokio::test]
    async fn end_to_end_subprocess_chain() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, ai_root) = echo_fixture(dir.path());
        let mut exec = executor(tools, ai_root, false);

        let mut params = Map::new();
        params.insert("message".into(), Value::String("hello chain".into()));
        let result = exec.execute("say", params).await.unwrap();

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output["stdout"].as_str().unwrap().trim(), "hello chain");
        assert_eq!(result.metadata["primitive"], "subprocess");
    }

    #[tokio::test]
    async fn strict_mode_requires_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, ai_root) = echo_fixture(dir.path());
        let mut exec = executor(tools, ai_root, true);

        let mut params = Map::new();
        params.insert("message".into(), Value::String("x".into()));
        let err = exec.execute("say", params).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Lockfile(LockfileError::Missing { .. })
        ));
        assert_eq!(err.code(), kiwi_error::ErrorCode::LockfileMissing);
    }

    #[tokio::test]
    async fn missing_parameter_fails_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, ai_root) = echo_fixture(dir.path());
        let mut exec = executor(tools, ai_root, false);

        let err = exec.execute("say", Map::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Template(_)));
    }

    #[tokio::test]
    async fn parameter_defaults_fill_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("tools");
        write_tool(
            &tools,
            "primitives/subprocess.py",
            "tool_id: subprocess\ntool_type: primitive\nversion: 1.0.0",
        );
        write_tool(
            &tools,
            "greet.py",
            "tool_id: greet\ntool_type: command\nversion: 1.0.0\nexecutor_id: subprocess\n\
config:\n  command: echo\n  args: [\"{greeting}\"]\nparameters:\n  - name: greeting\n    type: string\n    required: false\n    default: \"hi there\"",
        );
        let mut exec = executor(tools, dir.path().join("ai"), false);

        let result = exec.execute("greet", Map::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["stdout"].as_str().unwrap().trim(), "hi there");
    }

    #[tokio::test]
    async fn auth_required_when_scope_declared_and_no_credential() {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("tools");
        write_tool(
            &tools,
            "primitives/http_client.py",
            "tool_id: http_client\ntool_type: primitive\nversion: 1.0.0",
        );
        write_tool(
            &tools,
            "fetch.py",
            "tool_id: fetch\ntool_type: api\nversion: 1.0.0\nexecutor_id: http_client\n\
required_scope: \"anthropic:messages\"\nconfig:\n  url: \"https://example.com\"",
        );
        let mut exec = executor(tools, dir.path().join("ai"), false);

        let err = exec.execute("fetch", Map::new()).await.unwrap_err();
        match &err {
            ExecutionError::AuthRequired { service, scope } => {
                assert_eq!(service, "anthropic");
                assert_eq!(scope.as_deref(), Some("messages"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        let failure = err.to_failure();
        assert_eq!(failure["metadata"]["auth_required"], true);
        assert_eq!(failure["success"], false);
    }

    #[tokio::test]
    async fn unknown_tool_is_resolution_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, ai_root) = echo_fixture(dir.path());
        let mut exec = executor(tools, ai_root, false);
        let err = exec.execute("ghost", Map::new()).await.unwrap_err();
        assert_eq!(err.code(), kiwi_error::ErrorCode::ResolutionNotFound);
    }

    #[tokio::test]
    async fn subprocess_failure_carries_chain_context() {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("tools");
        write_tool(
            &tools,
            "primitives/subprocess.py",
            "tool_id: subprocess\ntool_type: primitive\nversion: 1.0.0",
        );
        write_tool(
            &tools,
            "fail.py",
            "tool_id: fail\ntool_type: command\nversion: 1.0.0\nexecutor_id: subprocess\n\
config:\n  command: sh\n  args: [\"-c\", \"exit 7\"]",
        );
        let mut exec = executor(tools, dir.path().join("ai"), false);

        let result = exec.execute("fail", Map::new()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.metadata["failed_tool_id"], "subprocess");
        assert_eq!(result.metadata["chain_position"], 1);
        assert_eq!(result.metadata["return_code"], 7);
    }
}
