// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TTL cache for AI responses, keyed by a fingerprint of (system prompt, context).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

pub type Fingerprint = String;

/// SHA-256 over `system_prompt || 0x00 || context`. A full cryptographic
/// digest, not the legacy 32-bit string hash — collisions across unrelated
/// conversations are cryptographically improbable (see DESIGN.md).
pub fn fingerprint(system_prompt: &str, context: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(system_prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(context.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

struct CacheEntry {
    response: String,
    created_at: Instant,
}

pub struct ResponseCache {
    ttl: Duration,
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: RwLock::new(HashMap::new()) }
    }

    /// Returns the cached response iff present and not expired.
    pub async fn get(&self, key: &Fingerprint) -> Option<String> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.created_at.elapsed() > self.ttl {
            None
        } else {
            Some(entry.response.clone())
        }
    }

    pub async fn put(&self, key: Fingerprint, response: String) {
        self.entries.write().await.insert(key, CacheEntry { response, created_at: Instant::now() });
    }

    /// Purge expired entries on demand. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.created_at.elapsed() <= self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
