// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tiered tool lookup and iterative chain walking.

use crate::{Chain, FileHash, ResolutionError, ResolvedLink, SourceTier};
use kiwi_manifest::{canonical_content, extract_manifest, ContentKind};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Resolves tool names to ordered chains by following `executor_id`
/// pointers.
///
/// Lookup order is project → user → registry; the first hit wins, with
/// lexicographic path order breaking ties inside a tier.  Resolved chains
/// are cached by `(tool_id, version)` for the lifetime of the resolver, so
/// one executor instance sees a stable view of the tool tree.
pub struct ChainResolver {
    roots: Vec<(SourceTier, PathBuf)>,
    cache: HashMap<(String, semver::Version), Chain>,
}

impl ChainResolver {
    /// Create a resolver over the standard tier layout rooted at
    /// `project_path` (`.ai/tools/`) and `user_space` (`tools/`).
    #[must_use]
    pub fn new(project_path: &Path, user_space: Option<&Path>) -> Self {
        let mut roots = vec![(SourceTier::Local, project_path.join(".ai").join("tools"))];
        if let Some(user) = user_space {
            roots.push((SourceTier::User, user.join("tools")));
        }
        Self {
            roots,
            cache: HashMap::new(),
        }
    }

    /// Create a resolver with explicit tier roots (tests, registries).
    #[must_use]
    pub fn with_roots(roots: Vec<(SourceTier, PathBuf)>) -> Self {
        Self {
            roots,
            cache: HashMap::new(),
        }
    }

    /// Resolve `tool_id` to an ordered chain ending in a primitive.
    ///
    /// The walk is an explicit loop with a visited set so that deeply
    /// chained tools cannot blow the call stack.
    ///
    /// # Errors
    ///
    /// [`ResolutionError::NotFound`] when a link is missing from every
    /// tier, [`ResolutionError::Cycle`] on a repeated tool id, and
    /// [`ResolutionError::InvalidManifest`] when a manifest fails to parse
    /// or violates the chain contract.
    pub fn resolve(&mut self, tool_id: &str) -> Result<Chain, ResolutionError> {
        if let Some(chain) = self.cached(tool_id) {
            debug!(target: "kiwi.resolve", tool_id, "chain cache hit");
            return Ok(chain);
        }

        let mut links: Vec<ResolvedLink> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = tool_id.to_string();

        loop {
            if !visited.insert(current.clone()) {
                let mut chain: Vec<String> = links.iter().map(|l| l.tool_id().to_string()).collect();
                chain.push(current.clone());
                return Err(ResolutionError::Cycle {
                    tool_id: current,
                    chain,
                });
            }

            let link = self.resolve_link(&current)?;
            let next = link.manifest.executor_id.clone();
            let terminal = link.manifest.is_primitive() || next.is_none();
            links.push(link);

            if terminal {
                break;
            }
            current = next.expect("checked above");
        }

        let chain = Chain::new(links)?;
        debug!(
            target: "kiwi.resolve",
            tool_id,
            depth = chain.len(),
            terminal = chain.terminal().tool_id(),
            "chain resolved"
        );
        let key = (
            chain.called().tool_id().to_string(),
            chain.called().manifest.version.clone(),
        );
        self.cache.insert(key, chain.clone());
        Ok(chain)
    }

    /// Resolve a single tool to a [`ResolvedLink`] without walking the
    /// chain.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ChainResolver::resolve`] for one link.
    pub fn resolve_link(&self, tool_id: &str) -> Result<ResolvedLink, ResolutionError> {
        let (source, file_path) =
            self.locate(tool_id)
                .ok_or_else(|| ResolutionError::NotFound {
                    tool_id: tool_id.to_string(),
                    searched: self.roots.iter().map(|(_, p)| p.clone()).collect(),
                })?;

        let content = std::fs::read_to_string(&file_path).map_err(|source| ResolutionError::Io {
            path: file_path.clone(),
            source,
        })?;

        let manifest =
            extract_manifest(&content).map_err(|e| ResolutionError::InvalidManifest {
                tool_id: tool_id.to_string(),
                reason: e.to_string(),
            })?;
        if manifest.tool_id != tool_id {
            return Err(ResolutionError::InvalidManifest {
                tool_id: tool_id.to_string(),
                reason: format!("file declares tool_id '{}'", manifest.tool_id),
            });
        }

        let content_hash =
            kiwi_integrity::content_hash(&canonical_content(&content, ContentKind::Tool));
        let files = hash_tool_files(&file_path)?;

        Ok(ResolvedLink {
            manifest,
            content_hash,
            files,
            file_path,
            source,
        })
    }

    fn cached(&self, tool_id: &str) -> Option<Chain> {
        self.cache
            .iter()
            .find(|((id, _), _)| id == tool_id)
            .map(|(_, chain)| chain.clone())
    }

    /// Find the file whose stem matches `tool_id`, honoring tier priority
    /// then lexicographic path order.
    ///
    /// Kernel namespaces (`core/`, `primitives/`, …) may not be shadowed:
    /// a protected match wins over any earlier-tier unprotected match.
    fn locate(&self, tool_id: &str) -> Option<(SourceTier, PathBuf)> {
        let mut first_hit: Option<(SourceTier, PathBuf)> = None;

        for (tier, root) in &self.roots {
            let mut matches: Vec<PathBuf> = WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| p.file_stem().and_then(|s| s.to_str()) == Some(tool_id))
                .collect();
            matches.sort();
            let Some(path) = matches.into_iter().next() else {
                continue;
            };

            let relative = path.strip_prefix(root).unwrap_or(&path);
            if kiwi_manifest::is_protected(ContentKind::Tool, relative) {
                if let Some((shadow_tier, shadow_path)) = &first_hit {
                    warn!(
                        target: "kiwi.resolve",
                        tool_id,
                        tier = %shadow_tier,
                        path = %shadow_path.display(),
                        "ignoring shadow of protected tool"
                    );
                }
                return Some((*tier, path));
            }
            if first_hit.is_none() {
                first_hit = Some((*tier, path));
            }
        }
        first_hit
    }
}

/// Hash every file under the tool's directory, in deterministic
/// (lexicographic relative-path) order.
fn hash_tool_files(tool_file: &Path) -> Result<Vec<FileHash>, ResolutionError> {
    let dir = tool_file.parent().unwrap_or(Path::new("."));
    let mut entries: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    entries.sort();

    let mut files = Vec::with_capacity(entries.len());
    for path in entries {
        let sha256 = kiwi_integrity::file_hash(&path).map_err(|e| match e {
            kiwi_integrity::IntegrityError::Io { path, source } => {
                ResolutionError::Io { path, source }
            }
            kiwi_integrity::IntegrityError::Mismatch { path, .. } => ResolutionError::Io {
                path,
                source: std::io::Error::other("unexpected mismatch while hashing"),
            },
        })?;
        let rel = path
            .strip_prefix(dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        files.push(FileHash { path: rel, sha256 });
    }
    Ok(files)
}
