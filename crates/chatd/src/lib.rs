// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! chatd: a multi-room, TLS-terminated chat server with durable session
//! identity and an optional per-room AI participant.

pub mod ai;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod queue;
pub mod room;
pub mod session;
pub mod state;
pub mod user_store;

use std::sync::{Arc, Once};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ChatConfig;
use crate::state::ChatState;

const CACHE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(300);

static CRYPTO_INIT: Once = Once::new();

/// Install the `ring` crypto provider for rustls/reqwest.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Run the chat server until shutdown (Ctrl-C/SIGTERM, or the caller's own
/// cancellation).
pub async fn run(config: ChatConfig) -> anyhow::Result<()> {
    ensure_crypto();
    let shutdown = CancellationToken::new();

    let chat = Arc::new(ChatState::bootstrap(config, shutdown.clone()).await?);

    tokio::spawn(signal_shutdown(shutdown.clone()));

    chat.sessions_clone().spawn_sweeper(shutdown.clone());
    tokio::spawn(cache_maintenance_loop(chat.clone(), shutdown.clone()));
    tokio::spawn(stats_log_loop(chat.clone(), shutdown.clone()));

    info!("chatd starting up");
    listener::run(chat).await?;
    info!("chatd shut down");
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C (and SIGTERM where the platform supports it),
/// the same trigger the teacher wires for its graceful-shutdown token.
async fn signal_shutdown(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(err = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}

/// Periodically purge expired AI cache entries, mirroring the background
/// sweeper the session registry already runs for expired sessions.
async fn cache_maintenance_loop(chat: Arc<ChatState>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(CACHE_MAINTENANCE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let purged = chat.ai.purge_expired_cache().await;
                if purged > 0 {
                    tracing::debug!(purged, "AI cache maintenance purged expired entries");
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Log the AI pipeline's human-readable `stats()` report on a timer, the way
/// the teacher logs credential-pool state.
async fn stats_log_loop(chat: Arc<ChatState>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(STATS_LOG_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                info!(stats = %chat.ai.stats(), "AI completer stats");
            }
            _ = shutdown.cancelled() => return,
        }
    }
}
