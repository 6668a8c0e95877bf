// SPDX-License-Identifier: MIT OR Apache-2.0
//! Frozen chain resolutions.
//!
//! A lockfile pins a tool's resolved chain (tool ids, versions, content
//! hashes, and every file hash) so that later executions either see the
//! identical tree or fail.  Writes are atomic (write-temp-then-rename);
//! readers never observe a partial lockfile.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use kiwi_resolve::{Chain, FileHash};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current lockfile format version.
pub const LOCKFILE_FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Which scope a lockfile is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// Project-local `.ai/lockfiles/`.
    Project,
    /// User space `~/.ai/lockfiles/`.
    User,
}

/// One pinned link of a frozen chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedLink {
    /// Tool id of this link.
    pub tool_id: String,
    /// Pinned version.
    pub version: semver::Version,
    /// Pinned canonical content hash.
    pub content_hash: String,
    /// Pinned per-file hashes.
    pub files: Vec<FileHash>,
}

/// Per-tool frozen chain resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lockfile {
    /// Lockfile format version.
    pub format_version: u32,
    /// Tool the chain was resolved for.
    pub tool_id: String,
    /// Version of the called tool at freeze time.
    pub version: semver::Version,
    /// Category directory this lockfile lives under.
    pub category: String,
    /// When the chain was frozen.
    pub created_at: DateTime<Utc>,
    /// The pinned chain, called tool first.
    pub chain: Vec<LockedLink>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from lockfile persistence and enforcement.
#[derive(Debug, thiserror::Error)]
pub enum LockfileError {
    /// The resolved chain deviates from the frozen chain.
    #[error("lockfile drift at '{offending_link}': {detail}")]
    Drift {
        /// Tool id of the first deviating link.
        offending_link: String,
        /// What differed.
        detail: String,
    },

    /// Strict execution requires a lockfile and none exists.
    #[error("no lockfile for '{tool_id}' in category '{category}'")]
    Missing {
        /// Tool that has not been frozen.
        tool_id: String,
        /// Category that was searched.
        category: String,
    },

    /// A lockfile exists but does not parse.
    #[error("malformed lockfile at {path}: {reason}")]
    Malformed {
        /// Path of the unreadable lockfile.
        path: PathBuf,
        /// Parse failure detail.
        reason: String,
    },

    /// Filesystem failure while reading or writing.
    #[error("lockfile io error at {path}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Freeze / enforce
// ---------------------------------------------------------------------------

/// Build a [`Lockfile`] from a freshly resolved chain.
#[must_use]
pub fn freeze(chain: &Chain, category: &str) -> Lockfile {
    let called = chain.called();
    Lockfile {
        format_version: LOCKFILE_FORMAT_VERSION,
        tool_id: called.tool_id().to_string(),
        version: called.manifest.version.clone(),
        category: category.to_string(),
        created_at: Utc::now(),
        chain: chain
            .iter()
            .map(|link| LockedLink {
                tool_id: link.tool_id().to_string(),
                version: link.manifest.version.clone(),
                content_hash: link.content_hash.clone(),
                files: link.files.clone(),
            })
            .collect(),
    }
}

/// Compare a resolved chain against a frozen lockfile, element-wise.
///
/// Tool ids, versions, content hashes, and every file hash must match
/// bit-for-bit; the first deviation is reported and nothing executes.
///
/// # Errors
///
/// Returns [`LockfileError::Drift`] naming the first offending link.
pub fn enforce(chain: &Chain, lockfile: &Lockfile) -> Result<(), LockfileError> {
    if chain.len() != lockfile.chain.len() {
        return Err(LockfileError::Drift {
            offending_link: lockfile.tool_id.clone(),
            detail: format!(
                "chain length changed: locked {}, resolved {}",
                lockfile.chain.len(),
                chain.len()
            ),
        });
    }

    for (resolved, locked) in chain.iter().zip(&lockfile.chain) {
        if resolved.tool_id() != locked.tool_id {
            return Err(LockfileError::Drift {
                offending_link: locked.tool_id.clone(),
                detail: format!("tool id changed to '{}'", resolved.tool_id()),
            });
        }
        if resolved.manifest.version != locked.version {
            return Err(LockfileError::Drift {
                offending_link: locked.tool_id.clone(),
                detail: format!(
                    "version changed: locked {}, resolved {}",
                    locked.version, resolved.manifest.version
                ),
            });
        }
        if resolved.content_hash != locked.content_hash {
            return Err(LockfileError::Drift {
                offending_link: locked.tool_id.clone(),
                detail: "content hash changed".into(),
            });
        }
        if resolved.files != locked.files {
            let detail = first_file_difference(&resolved.files, &locked.files);
            return Err(LockfileError::Drift {
                offending_link: locked.tool_id.clone(),
                detail,
            });
        }
    }
    Ok(())
}

fn first_file_difference(resolved: &[FileHash], locked: &[FileHash]) -> String {
    for lock in locked {
        match resolved.iter().find(|f| f.path == lock.path) {
            None => return format!("file '{}' removed", lock.path),
            Some(f) if f.sha256 != lock.sha256 => {
                return format!("file '{}' hash changed", lock.path)
            }
            Some(_) => {}
        }
    }
    for f in resolved {
        if !locked.iter().any(|l| l.path == f.path) {
            return format!("file '{}' added", f.path);
        }
    }
    "file set changed".into()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Filesystem store for lockfiles, one per scope and category.
///
/// Layout: `{scope_root}/lockfiles/{category}/{tool_id}.lock`.
pub struct LockfileStore {
    project_root: PathBuf,
    user_root: Option<PathBuf>,
}

impl LockfileStore {
    /// Create a store rooted at the project's `.ai/` directory, with an
    /// optional user-space root (`~/.ai/`).
    #[must_use]
    pub fn new(project_ai_root: &Path, user_ai_root: Option<&Path>) -> Self {
        Self {
            project_root: project_ai_root.to_path_buf(),
            user_root: user_ai_root.map(Path::to_path_buf),
        }
    }

    /// Path for a lockfile in the given scope and category.
    #[must_use]
    pub fn path_for(&self, tool_id: &str, category: &str, scope: LockScope) -> PathBuf {
        let root = match scope {
            LockScope::Project => &self.project_root,
            LockScope::User => self.user_root.as_ref().unwrap_or(&self.project_root),
        };
        root.join("lockfiles")
            .join(category)
            .join(format!("{tool_id}.lock"))
    }

    /// Atomically persist a lockfile: write to a temp file in the target
    /// directory, then rename into place.
    ///
    /// # Errors
    ///
    /// Returns [`LockfileError::Io`] on filesystem failure.
    pub fn save(&self, lockfile: &Lockfile, scope: LockScope) -> Result<PathBuf, LockfileError> {
        let path = self.path_for(&lockfile.tool_id, &lockfile.category, scope);
        let dir = path.parent().expect("lockfile path has a parent");
        std::fs::create_dir_all(dir).map_err(|source| LockfileError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let json = serde_json::to_string_pretty(lockfile).expect("lockfile serializes");
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|source| LockfileError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        tmp.write_all(json.as_bytes())
            .map_err(|source| LockfileError::Io {
                path: tmp.path().to_path_buf(),
                source,
            })?;
        tmp.persist(&path).map_err(|e| LockfileError::Io {
            path: path.clone(),
            source: e.error,
        })?;

        debug!(
            target: "kiwi.lockfile",
            tool_id = %lockfile.tool_id,
            category = %lockfile.category,
            links = lockfile.chain.len(),
            "lockfile saved"
        );
        Ok(path)
    }

    /// Load the lockfile for `tool_id`, if one exists for the requested
    /// version.
    ///
    /// Returns `Ok(None)` when no lockfile exists or the pinned version
    /// differs from `version`.
    ///
    /// # Errors
    ///
    /// Returns [`LockfileError::Malformed`] for unparseable lockfiles and
    /// [`LockfileError::Io`] for read failures other than absence.
    pub fn load(
        &self,
        tool_id: &str,
        version: &semver::Version,
        category: &str,
        scope: LockScope,
    ) -> Result<Option<Lockfile>, LockfileError> {
        let path = self.path_for(tool_id, category, scope);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(LockfileError::Io { path, source }),
        };
        let lockfile: Lockfile =
            serde_json::from_str(&content).map_err(|e| LockfileError::Malformed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if &lockfile.version != version {
            return Ok(None);
        }
        Ok(Some(lockfile))
    }

    /// Enforce a chain against its stored lockfile.
    ///
    /// A missing lockfile is an error in strict mode and a pass-through
    /// otherwise.
    ///
    /// # Errors
    ///
    /// [`LockfileError::Missing`] in strict mode with no lockfile, or any
    /// error from [`enforce`].
    pub fn enforce_chain(
        &self,
        chain: &Chain,
        category: &str,
        scope: LockScope,
        strict: bool,
    ) -> Result<(), LockfileError> {
        let called = chain.called();
        match self.load(called.tool_id(), &called.manifest.version, category, scope)? {
            Some(lockfile) => enforce(chain, &lockfile),
            None if strict => Err(LockfileError::Missing {
                tool_id: called.tool_id().to_string(),
                category: category.to_string(),
            }),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
