// SPDX-License-Identifier: MIT OR Apache-2.0
//! Credential store for tool execution.
//!
//! Tokens live in the OS secret vault (macOS Keychain, Windows Credential
//! Manager, Linux Secret Service) behind the [`TokenVault`] trait; only
//! metadata (expiry, scopes) is cached in memory.  Token material is never
//! logged and never serialized.
//!
//! Refresh is a pluggable asynchronous operation per service; the kernel
//! specifies only the [`AuthStore::get_token`] contract and the error
//! kinds.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from credential retrieval.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No valid credential for the service (missing, expired with no
    /// refresh path, or lacking the requested scope).
    #[error("authentication required for '{service}'{}", scope_suffix(.scope))]
    AuthenticationRequired {
        /// Service the caller needed a token for.
        service: String,
        /// Scope that was requested, if any.
        scope: Option<String>,
    },

    /// The configured refresh operation failed.
    #[error("token refresh failed for '{service}': {reason}")]
    RefreshFailed {
        /// Service whose refresh failed.
        service: String,
        /// Human-readable failure detail.
        reason: String,
    },

    /// The underlying secret vault failed.
    #[error("secret vault error: {0}")]
    Vault(String),
}

fn scope_suffix(scope: &Option<String>) -> String {
    scope
        .as_ref()
        .map(|s| format!(" (scope '{s}')"))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Vault abstraction
// ---------------------------------------------------------------------------

/// Minimal secret-storage seam: get/set/delete a named secret.
///
/// Production uses the OS keychain via [`KeyringVault`]; tests use
/// [`MemoryVault`].
pub trait TokenVault: Send + Sync {
    /// Read a secret, `None` when absent.
    fn get(&self, key: &str) -> Result<Option<String>, AuthError>;
    /// Write a secret.
    fn set(&self, key: &str, value: &str) -> Result<(), AuthError>;
    /// Delete a secret; absent secrets are not an error.
    fn delete(&self, key: &str) -> Result<(), AuthError>;
}

/// OS-keychain-backed vault.
pub struct KeyringVault {
    service_name: String,
}

impl KeyringVault {
    /// Create a vault namespaced under `service_name` (default `"kiwi"`).
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

impl TokenVault for KeyringVault {
    fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        let entry = keyring::Entry::new(&self.service_name, key)
            .map_err(|e| AuthError::Vault(e.to_string()))?;
        match entry.get_password() {
            Ok(v) => Ok(Some(v)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AuthError::Vault(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        let entry = keyring::Entry::new(&self.service_name, key)
            .map_err(|e| AuthError::Vault(e.to_string()))?;
        entry
            .set_password(value)
            .map_err(|e| AuthError::Vault(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), AuthError> {
        let entry = keyring::Entry::new(&self.service_name, key)
            .map_err(|e| AuthError::Vault(e.to_string()))?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AuthError::Vault(e.to_string())),
        }
    }
}

/// In-memory vault for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryVault {
    secrets: std::sync::Mutex<HashMap<String, String>>,
}

impl MemoryVault {
    /// Create an empty in-memory vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenVault for MemoryVault {
    fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        Ok(self.secrets.lock().expect("vault lock").get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        self.secrets
            .lock()
            .expect("vault lock")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), AuthError> {
        self.secrets.lock().expect("vault lock").remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AuthStore
// ---------------------------------------------------------------------------

/// Pluggable asynchronous refresh operation: `(service, refresh_token)` →
/// new access token.
pub type RefreshFn = Arc<
    dyn Fn(String, String) -> Pin<Box<dyn Future<Output = Result<String, AuthError>> + Send>>
        + Send
        + Sync,
>;

/// Cached per-service metadata. Tokens themselves stay in the vault; the
/// access token is held only for the lifetime of the process.
#[derive(Clone)]
struct CachedEntry {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
    scopes: Vec<String>,
}

/// Diagnostic view of a cached credential. Never includes token material.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CredentialMetadata {
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
    /// Scopes granted to the token.
    pub scopes: Vec<String>,
    /// Whether a refresh token is stored.
    pub has_refresh_token: bool,
}

/// Process-wide credential store with per-service locking.
pub struct AuthStore {
    vault: Arc<dyn TokenVault>,
    cache: Mutex<HashMap<String, CachedEntry>>,
    refreshers: Mutex<HashMap<String, RefreshFn>>,
    service_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AuthStore {
    /// Create a store over the given vault.
    #[must_use]
    pub fn new(vault: Arc<dyn TokenVault>) -> Self {
        Self {
            vault,
            cache: Mutex::new(HashMap::new()),
            refreshers: Mutex::new(HashMap::new()),
            service_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a store over the OS keychain under the `"kiwi"` namespace.
    #[must_use]
    pub fn with_os_keychain() -> Self {
        Self::new(Arc::new(KeyringVault::new("kiwi")))
    }

    /// Register a refresh operation for a service.
    pub async fn register_refresher(&self, service: &str, refresher: RefreshFn) {
        self.refreshers
            .lock()
            .await
            .insert(service.to_string(), refresher);
    }

    /// Store a token for a service.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Vault`] when the secret vault rejects a write.
    pub async fn set_token(
        &self,
        service: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in_secs: i64,
        scopes: &[String],
    ) -> Result<(), AuthError> {
        let expires_at = Utc::now() + Duration::seconds(expires_in_secs);

        self.vault
            .set(&format!("{service}_access_token"), access_token)?;
        if let Some(refresh) = refresh_token {
            self.vault.set(&format!("{service}_refresh_token"), refresh)?;
        }
        self.vault
            .set(&format!("{service}_expires_at"), &expires_at.to_rfc3339())?;
        if !scopes.is_empty() {
            self.vault
                .set(&format!("{service}_scopes"), &scopes.join(","))?;
        }

        self.cache.lock().await.insert(
            service.to_string(),
            CachedEntry {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.map(String::from),
                expires_at,
                scopes: scopes.to_vec(),
            },
        );
        info!(target: "kiwi.auth", service, "token stored");
        Ok(())
    }

    /// Get a valid access token, refreshing if expired and a refresher is
    /// registered.
    ///
    /// # Errors
    ///
    /// [`AuthError::AuthenticationRequired`] when no valid token can be
    /// produced: missing, expired without refresh, or lacking `scope`.
    pub async fn get_token(&self, service: &str, scope: Option<&str>) -> Result<String, AuthError> {
        let lock = self.lock_for(service).await;
        let _guard = lock.lock().await;

        let cached = self.cache.lock().await.get(service).cloned();
        let entry = match cached {
            Some(entry) => Some(entry),
            None => self.load_from_vault(service).await?,
        };

        let Some(entry) = entry else {
            return Err(AuthError::AuthenticationRequired {
                service: service.to_string(),
                scope: scope.map(String::from),
            });
        };

        if let Some(required) = scope {
            if !entry.scopes.iter().any(|s| s == required) {
                warn!(target: "kiwi.auth", service, scope = required, "token missing required scope");
                return Err(AuthError::AuthenticationRequired {
                    service: service.to_string(),
                    scope: Some(required.to_string()),
                });
            }
        }

        if entry.expires_at > Utc::now() {
            debug!(target: "kiwi.auth", service, "returning cached token");
            return Ok(entry.access_token);
        }

        // Expired: attempt refresh when possible.
        if let Some(refresh_token) = entry.refresh_token.clone() {
            let refresher = self.refreshers.lock().await.get(service).cloned();
            if let Some(refresher) = refresher {
                info!(target: "kiwi.auth", service, "token expired, refreshing");
                let new_token =
                    refresher(service.to_string(), refresh_token.clone()).await?;
                let expires_at = Utc::now() + Duration::hours(1);
                self.vault
                    .set(&format!("{service}_access_token"), &new_token)?;
                self.vault
                    .set(&format!("{service}_expires_at"), &expires_at.to_rfc3339())?;
                self.cache.lock().await.insert(
                    service.to_string(),
                    CachedEntry {
                        access_token: new_token.clone(),
                        refresh_token: Some(refresh_token),
                        expires_at,
                        scopes: entry.scopes,
                    },
                );
                return Ok(new_token);
            }
        }

        Err(AuthError::AuthenticationRequired {
            service: service.to_string(),
            scope: scope.map(String::from),
        })
    }

    /// Whether the service currently holds an unexpired token.
    pub async fn is_authenticated(&self, service: &str) -> bool {
        if let Some(entry) = self.cache.lock().await.get(service) {
            return entry.expires_at > Utc::now();
        }
        match self.load_from_vault(service).await {
            Ok(Some(entry)) => entry.expires_at > Utc::now(),
            _ => false,
        }
    }

    /// Remove every stored secret for a service.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Vault`] when the vault rejects a delete.
    pub async fn clear_token(&self, service: &str) -> Result<(), AuthError> {
        for suffix in ["access_token", "refresh_token", "expires_at", "scopes"] {
            self.vault.delete(&format!("{service}_{suffix}"))?;
        }
        self.cache.lock().await.remove(service);
        info!(target: "kiwi.auth", service, "tokens cleared");
        Ok(())
    }

    /// Diagnostic metadata for a cached credential; never token material.
    pub async fn cached_metadata(&self, service: &str) -> Option<CredentialMetadata> {
        self.cache
            .lock()
            .await
            .get(service)
            .map(|e| CredentialMetadata {
                expires_at: e.expires_at,
                scopes: e.scopes.clone(),
                has_refresh_token: e.refresh_token.is_some(),
            })
    }

    async fn lock_for(&self, service: &str) -> Arc<Mutex<()>> {
        self.service_locks
            .lock()
            .await
            .entry(service.to_string())
            .or_default()
            .clone()
    }

    async fn load_from_vault(&self, service: &str) -> Result<Option<CachedEntry>, AuthError> {
        let Some(access_token) = self.vault.get(&format!("{service}_access_token"))? else {
            return Ok(None);
        };
        let expires_at = self
            .vault
            .get(&format!("{service}_expires_at"))?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map_or_else(|| Utc::now() + Duration::hours(1), |t| t.with_timezone(&Utc));
        let refresh_token = self.vault.get(&format!("{service}_refresh_token"))?;
        let scopes = self
            .vault
            .get(&format!("{service}_scopes"))?
            .map(|s| s.split(',').map(String::from).collect())
            .unwrap_or_default();

        let entry = CachedEntry {
            access_token,
            refresh_token,
            expires_at,
            scopes,
        };
        self.cache
            .lock()
            .await
            .insert(service.to_string(), entry.clone());
        Ok(Some(entry))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
