//! Credential checking against a provisioned YAML file.
//!
//! The file maps usernames to argon2 PHC strings:
//!
//! ```yaml
//! admin: "$argon2id$v=19$m=19456,t=2,p=1$..."
//! ```
//!
//! Produce digests with `cms hash-password <password>`. The file is re-read on
//! every sign-in attempt so edits take effect without a restart.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;

/// Checked in place of a real digest when the username is not provisioned.
/// Uses the same algorithm and cost parameters as [`hash_password`]; the hash
/// bytes are all zero so no password matches it.
const UNKNOWN_USER_DIGEST: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHRzb21lc2FsdA$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read credentials file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse credentials file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },
    #[error("failed to hash password: {0}")]
    Hash(String),
    #[error("credential check task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Handle on the credentials file.
#[derive(Debug, Clone)]
pub struct Credentials {
    path: PathBuf,
}

impl Credentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the username → digest mapping.
    pub async fn load(&self) -> Result<HashMap<String, String>, CredentialError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| CredentialError::Read {
                path: self.path.clone(),
                source,
            })?;
        parse_credentials(&raw).map_err(|source| CredentialError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Return `true` when `username` is provisioned and `password` matches its
    /// digest. Unknown users and wrong passwords are both plain `false`.
    pub async fn verify(&self, username: &str, password: &str) -> Result<bool, CredentialError> {
        let mut credentials = self.load().await?;
        // Unknown users still pay for a full hash so timing does not reveal
        // which usernames exist.
        let (digest, known) = match credentials.remove(username) {
            Some(digest) => (digest, true),
            None => {
                tracing::debug!(%username, "sign-in for unknown user");
                (UNKNOWN_USER_DIGEST.to_owned(), false)
            }
        };

        let password = password.to_owned();
        let valid = tokio::task::spawn_blocking(move || verify_password(&digest, &password)).await?;
        Ok(known && valid)
    }
}

fn parse_credentials(raw: &str) -> Result<HashMap<String, String>, serde_yml::Error> {
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_yml::from_str(raw)
}

/// Hash `password` with a fresh random salt, returning a PHC string.
pub fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CredentialError::Hash(e.to_string()))
}

/// Check `password` against a stored PHC digest.
///
/// The digest carries its own salt and cost parameters; verification re-hashes
/// the candidate with them and compares in constant time. A digest that does
/// not parse never matches.
pub fn verify_password(digest: &str, password: &str) -> bool {
    let parsed = match PasswordHash::new(digest) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "malformed password digest in credentials file");
            return false;
        }
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
