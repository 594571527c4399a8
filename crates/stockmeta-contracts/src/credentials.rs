use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("credential pool is empty")]
    EmptyPool,
}

/// Round-robin selection result. `index` is the new cursor the caller must
/// persist before using `credential`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub credential: String,
    pub index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPool {
    credentials: Vec<String>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<String>) -> Self {
        Self { credentials }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Successor of `last_used_index`: `(last + 1) mod len`. Negative cursors
    /// mean "none used yet".
    pub fn next(&self, last_used_index: i64) -> Result<Rotation, PoolError> {
        if self.credentials.is_empty() {
            return Err(PoolError::EmptyPool);
        }
        let len = self.credentials.len() as i64;
        let last = last_used_index.max(-1).rem_euclid(len);
        let index = (last + 1) % len;
        Ok(Rotation {
            credential: self.credentials[index as usize].clone(),
            index,
        })
    }
}

/// Parses a plain-text key file: one credential per line, surrounding
/// whitespace trimmed, blank lines skipped.
pub fn parse_key_file(text: &str) -> Result<Vec<String>, PoolError> {
    let keys = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect::<Vec<String>>();
    if keys.is_empty() {
        return Err(PoolError::EmptyPool);
    }
    Ok(keys)
}

/// Short tag safe to log in place of a credential.
pub fn fingerprint(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}
