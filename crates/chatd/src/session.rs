// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Opaque-token session registry with absolute TTL and a background sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A live session. Clients never parse `token` — it is opaque.
pub struct Session {
    pub token: String,
    pub username: String,
    expires_at: Instant,
    /// Room the session is currently subscribed to, if any. Mutable so
    /// join/leave/reconnect can update it without re-inserting the session.
    pub current_room: RwLock<Option<String>>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), ttl }
    }

    /// Create a new session for `username` with a fresh, unguessable token.
    pub async fn create(&self, username: String) -> Arc<Session> {
        let token = generate_token();
        let session = Arc::new(Session {
            token: token.clone(),
            username,
            expires_at: Instant::now() + self.ttl,
            current_room: RwLock::new(None),
        });
        self.sessions.write().await.insert(token, session.clone());
        session
    }

    /// Look up a session by token. Returns `None` if absent or expired;
    /// does not refresh the TTL on read.
    pub async fn get(&self, token: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().await.get(token).cloned()?;
        if session.is_expired() {
            return None;
        }
        Some(session)
    }

    pub async fn remove(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }

    /// Remove all expired sessions. Returns the number removed.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired());
        before - sessions.len()
    }

    /// Spawn the background sweeper, waking roughly every 60s until `shutdown`
    /// is cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = self.sweep().await;
                        if removed > 0 {
                            debug!(removed, "session sweeper removed expired sessions");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("session sweeper shutting down");
                        return;
                    }
                }
            }
        })
    }
}

/// 256 bits of randomness, URL-safe base64 encoded (no padding) — comfortably
/// over the ≥128-bit entropy floor and trivially "stringified".
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
