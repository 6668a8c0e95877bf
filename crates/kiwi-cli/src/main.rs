// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiwi_auth::AuthStore;
use kiwi_exec::{ExecutorOptions, PrimitiveExecutor};
use kiwi_harness::{ensure_keypair, default_key_dir};
use kiwi_lockfile::{freeze, LockScope, LockfileStore};
use kiwi_manifest::{sign_content, ContentKind};
use kiwi_resolve::{validate_chain, ChainResolver};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Exit code for any execution error.
const EXIT_FAILURE: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "kiwi", version, about = "Kiwi kernel CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root (where the .ai/ directory lives).
    #[arg(long, default_value = ".")]
    project: PathBuf,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a tool chain.
    Execute {
        /// Tool to execute.
        tool_id: String,

        /// Runtime parameters as key=value (values parsed as JSON when
        /// possible). Can be repeated.
        #[arg(long = "param")]
        params: Vec<String>,

        /// Skip strict lockfile / validation enforcement.
        #[arg(long)]
        no_strict: bool,

        /// Lockfile category directory.
        #[arg(long, default_value = "tools")]
        category: String,
    },

    /// Resolve a tool chain and freeze it into a lockfile, signing the
    /// tool file.
    Sign {
        /// Tool to sign.
        tool_id: String,

        /// Lockfile category directory.
        #[arg(long, default_value = "tools")]
        category: String,
    },

    /// Resolve and validate a chain without executing it.
    Lock {
        /// Tool to resolve.
        tool_id: String,
    },

    /// Ensure the user keypair exists and print the key directory.
    Keys,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output).expect("valid json"));
            let success = output.get("success").and_then(Value::as_bool).unwrap_or(true);
            if !success {
                std::process::exit(EXIT_FAILURE);
            }
        }
        Err(e) => {
            // Structured failure, never a stack trace.
            let failure = serde_json::json!({"success": false, "error": e.to_string()});
            println!("{}", serde_json::to_string_pretty(&failure).expect("valid json"));
            std::process::exit(EXIT_FAILURE);
        }
    }
}

async fn run(cli: Cli) -> Result<Value> {
    let project = cli
        .project
        .canonicalize()
        .with_context(|| format!("project path {} not found", cli.project.display()))?;

    match cli.command {
        Commands::Execute {
            tool_id,
            params,
            no_strict,
            category,
        } => {
            let params = parse_params(&params)?;
            let mut executor = PrimitiveExecutor::new(
                &project,
                None,
                Arc::new(AuthStore::with_os_keychain()),
                ExecutorOptions {
                    strict: !no_strict,
                    category,
                    scope: LockScope::Project,
                },
            );
            match executor.execute(&tool_id, params).await {
                Ok(result) => Ok(serde_json::to_value(result)?),
                Err(e) => Ok(e.to_failure()),
            }
        }

        Commands::Sign { tool_id, category } => {
            let mut resolver = ChainResolver::new(&project, None);
            let chain = resolver.resolve(&tool_id)?;

            // Re-stamp the called tool's signature line.
            let called = chain.called();
            let content = std::fs::read_to_string(&called.file_path)?;
            let signed = sign_content(&content, ContentKind::Tool, &called.file_path);
            std::fs::write(&called.file_path, signed)?;

            // A sign refreshes the frozen chain.
            let chain = ChainResolver::new(&project, None).resolve(&tool_id)?;
            let lockfile = freeze(&chain, &category);
            let store = LockfileStore::new(&project.join(".ai"), None);
            let path = store.save(&lockfile, LockScope::Project)?;

            Ok(serde_json::json!({
                "success": true,
                "tool_id": tool_id,
                "lockfile": path,
                "links": lockfile.chain.len(),
            }))
        }

        Commands::Lock { tool_id } => {
            let mut resolver = ChainResolver::new(&project, None);
            let chain = resolver.resolve(&tool_id)?;
            let validation = validate_chain(&chain, true);
            Ok(serde_json::json!({
                "success": validation.valid,
                "tool_id": tool_id,
                "chain": chain.iter().map(|l| l.tool_id()).collect::<Vec<_>>(),
                "errors": validation.errors,
                "warnings": validation.warnings,
            }))
        }

        Commands::Keys => {
            let dir = default_key_dir();
            ensure_keypair(&dir)?;
            Ok(serde_json::json!({
                "success": true,
                "key_dir": dir,
            }))
        }
    }
}

/// Parse repeated `key=value` flags; values that parse as JSON keep their
/// type, everything else stays a string.
fn parse_params(raw: &[String]) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("expected key=value, got '{entry}'"))?;
        let parsed = serde_json::from_str(value).unwrap_or(Value::String(value.to_string()));
        params.insert(key.to_string(), parsed);
    }
    Ok(params)
}
