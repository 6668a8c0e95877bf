// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ed25519 keypair management.
//!
//! Keys live in a user-scoped directory (`~/.kiwi/keys/` by default):
//! `private_key.pem` as PKCS#8 with mode 0600, `public_key.pem` as SPKI
//! with mode 0644, directory mode 0700.  A keypair is generated on first
//! use.

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::spki::{DecodePublicKey, EncodePublicKey};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use tracing::info;

/// Private key file name.
pub const PRIVATE_KEY_FILE: &str = "private_key.pem";

/// Public key file name.
pub const PUBLIC_KEY_FILE: &str = "public_key.pem";

/// Errors from key storage.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Filesystem failure.
    #[error("key io error at {path}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A key file exists but is not a valid Ed25519 PEM.
    #[error("invalid key material at {path}: {reason}")]
    Invalid {
        /// Path of the bad key file.
        path: PathBuf,
        /// Parse failure detail.
        reason: String,
    },
}

/// Default key directory: `~/.kiwi/keys`.
#[must_use]
pub fn default_key_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kiwi")
        .join("keys")
}

/// Generate a fresh Ed25519 keypair.
#[must_use]
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing = SigningKey::generate(&mut OsRng);
    let verifying = signing.verifying_key();
    (signing, verifying)
}

/// Persist a keypair under `dir` with restrictive permissions.
///
/// # Errors
///
/// Returns [`KeyError::Io`] on filesystem failure or unencodable keys.
pub fn save_keypair(dir: &Path, signing: &SigningKey) -> Result<(), KeyError> {
    std::fs::create_dir_all(dir).map_err(|source| KeyError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    set_mode(dir, 0o700)?;

    let private_path = dir.join(PRIVATE_KEY_FILE);
    let private_pem = signing
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| KeyError::Invalid {
            path: private_path.clone(),
            reason: e.to_string(),
        })?;
    std::fs::write(&private_path, private_pem.as_bytes()).map_err(|source| KeyError::Io {
        path: private_path.clone(),
        source,
    })?;
    set_mode(&private_path, 0o600)?;

    let public_path = dir.join(PUBLIC_KEY_FILE);
    let public_pem = signing
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| KeyError::Invalid {
            path: public_path.clone(),
            reason: e.to_string(),
        })?;
    std::fs::write(&public_path, public_pem.as_bytes()).map_err(|source| KeyError::Io {
        path: public_path.clone(),
        source,
    })?;
    set_mode(&public_path, 0o644)?;

    info!(target: "kiwi.harness", dir = %dir.display(), "keypair saved");
    Ok(())
}

/// Load the private key from `dir`.
///
/// # Errors
///
/// [`KeyError::Io`] when the file is missing or unreadable,
/// [`KeyError::Invalid`] when it is not an Ed25519 PKCS#8 PEM.
pub fn load_signing_key(dir: &Path) -> Result<SigningKey, KeyError> {
    let path = dir.join(PRIVATE_KEY_FILE);
    let pem = std::fs::read_to_string(&path).map_err(|source| KeyError::Io {
        path: path.clone(),
        source,
    })?;
    SigningKey::from_pkcs8_pem(&pem).map_err(|e| KeyError::Invalid {
        path,
        reason: e.to_string(),
    })
}

/// Load the public key from `dir`.
///
/// # Errors
///
/// Same failure modes as [`load_signing_key`].
pub fn load_verifying_key(dir: &Path) -> Result<VerifyingKey, KeyError> {
    let path = dir.join(PUBLIC_KEY_FILE);
    let pem = std::fs::read_to_string(&path).map_err(|source| KeyError::Io {
        path: path.clone(),
        source,
    })?;
    VerifyingKey::from_public_key_pem(&pem).map_err(|e| KeyError::Invalid {
        path,
        reason: e.to_string(),
    })
}

/// Load the keypair from `dir`, generating and saving one if absent.
///
/// # Errors
///
/// Propagates storage failures; never overwrites existing key material.
pub fn ensure_keypair(dir: &Path) -> Result<(SigningKey, VerifyingKey), KeyError> {
    match (load_signing_key(dir), load_verifying_key(dir)) {
        (Ok(signing), Ok(verifying)) => Ok((signing, verifying)),
        _ => {
            let (signing, verifying) = generate_keypair();
            save_keypair(dir, &signing)?;
            Ok((signing, verifying))
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|source| {
        KeyError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), KeyError> {
    Ok(())
}
