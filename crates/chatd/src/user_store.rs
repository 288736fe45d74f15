// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flat-file user store.
//!
//! One record per line, colon-separated: `username:base64(hash):base64(salt)`,
//! where `hash = SHA-256(salt \|\| password)`. Registration persists via a
//! write-tmp-then-rename before reporting success, so a crash mid-write never
//! leaves a half-written file in place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{error, warn};

/// A registered user. Equality and identity are both by username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
}

struct Record {
    username: String,
    hash: String,
    salt: String,
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Exists,
}

pub struct UserStore {
    path: PathBuf,
    records: RwLock<HashMap<String, Record>>,
}

impl UserStore {
    /// Load the store from `path`, tolerating a missing file (treated as empty).
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut records = HashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for (i, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let mut parts = line.splitn(3, ':');
                    let fields = (parts.next(), parts.next(), parts.next());
                    let (Some(username), Some(hash), Some(salt)) = fields else {
                        warn!(path = %path.display(), line = i + 1, "skipping malformed user record");
                        continue;
                    };
                    records.insert(
                        username.to_owned(),
                        Record { username: username.to_owned(), hash: hash.to_owned(), salt: salt.to_owned() },
                    );
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self { path, records: RwLock::new(records) })
    }

    /// Register a new user. Rejects (idempotently) on username collision.
    pub async fn register(&self, username: &str, password: &str) -> anyhow::Result<RegisterOutcome> {
        let mut records = self.records.write().await;
        if records.contains_key(username) {
            return Ok(RegisterOutcome::Exists);
        }

        let mut salt = [0u8; 16];
        rand::rng().fill_bytes(&mut salt);
        let record = Record {
            username: username.to_owned(),
            hash: Self::hash(password, &salt),
            salt: STANDARD.encode(salt),
        };
        records.insert(username.to_owned(), record);

        if let Err(e) = Self::persist(&self.path, records.values()).await {
            records.remove(username);
            error!(err = %e, path = %self.path.display(), "failed to persist user store");
            anyhow::bail!("failed to persist user: {e}");
        }
        Ok(RegisterOutcome::Created)
    }

    /// Verify `password` against the stored hash for `username`.
    ///
    /// Never reveals whether the user exists: a missing user and a wrong
    /// password both return `None`, and the hash comparison runs in
    /// constant time so neither branch is distinguishable by timing.
    pub async fn authenticate(&self, username: &str, password: &str) -> Option<User> {
        let records = self.records.read().await;
        let record = records.get(username)?;
        let salt = STANDARD.decode(&record.salt).ok()?;
        let candidate = Self::hash(password, &salt);
        if constant_time_eq(candidate.as_bytes(), record.hash.as_bytes()) {
            Some(User { username: record.username.clone() })
        } else {
            None
        }
    }

    fn hash(password: &str, salt: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        STANDARD.encode(hasher.finalize())
    }

    async fn persist<'a>(path: &Path, records: impl Iterator<Item = &'a Record>) -> anyhow::Result<()> {
        let mut buf = String::new();
        for r in records {
            buf.push_str(&r.username);
            buf.push(':');
            buf.push_str(&r.hash);
            buf.push(':');
            buf.push_str(&r.salt);
            buf.push('\n');
        }
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &buf).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

/// Equal-length, branch-free byte comparison so hash checks don't leak
/// timing information about how many leading bytes matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
#[path = "user_store_tests.rs"]
mod tests;
