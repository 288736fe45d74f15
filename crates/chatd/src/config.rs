// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the chatd server.
#[derive(Debug, Clone, clap::Parser)]
pub struct ChatConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "CHATD_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8989, env = "CHATD_PORT")]
    pub port: u16,

    /// Path to the TLS certificate chain (PEM). Required unless `--allow-plaintext` is set.
    #[arg(long, env = "CHATD_TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    /// Path to the TLS private key (PEM).
    #[arg(long, env = "CHATD_TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,

    /// Allow falling back to a plaintext listener when TLS setup fails or is
    /// unconfigured. Diagnostic convenience only; never the production default.
    #[arg(long, default_value_t = false, env = "CHATD_ALLOW_PLAINTEXT")]
    pub allow_plaintext: bool,

    /// Path to the flat-file user store.
    #[arg(long, default_value = "users.txt", env = "CHATD_USER_FILE")]
    pub user_file: PathBuf,

    /// Upstream text-generation endpoint (`complete(systemPrompt, prompt) -> text`).
    #[arg(long, env = "CHATD_AI_ENDPOINT")]
    pub ai_endpoint: Option<String>,

    /// AI upstream connect timeout, in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "CHATD_AI_CONNECT_TIMEOUT_MS")]
    pub ai_connect_timeout_ms: u64,

    /// AI upstream read timeout, in milliseconds.
    #[arg(long, default_value_t = 20_000, env = "CHATD_AI_READ_TIMEOUT_MS")]
    pub ai_read_timeout_ms: u64,

    /// Session TTL, in minutes, absolute from creation.
    #[arg(long, default_value_t = 60, env = "CHATD_SESSION_TTL_MINUTES")]
    pub session_ttl_minutes: u64,

    /// AI response cache TTL, in seconds.
    #[arg(long, default_value_t = 300, env = "CHATD_CACHE_TTL_SECS")]
    pub cache_ttl_secs: u64,

    /// Server heartbeat interval, in seconds.
    #[arg(long, default_value_t = 30, env = "CHATD_HEARTBEAT_INTERVAL_SECS")]
    pub heartbeat_interval_secs: u64,

    /// Per-room history cap (oldest entries evicted beyond this).
    #[arg(long, default_value_t = 1000, env = "CHATD_HISTORY_CAP")]
    pub history_cap: usize,

    /// Name of the default AI room created at startup.
    #[arg(long, default_value = "AI Doodle", env = "CHATD_AI_ROOM_NAME")]
    pub ai_room_name: String,

    /// System prompt for the default AI room.
    #[arg(
        long,
        default_value = "You are a friendly, helpful participant in a group chat. Keep replies short and conversational.",
        env = "CHATD_AI_ROOM_PROMPT"
    )]
    pub ai_room_prompt: String,
}

impl ChatConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_minutes * 60)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn ai_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.ai_connect_timeout_ms)
    }

    pub fn ai_read_timeout(&self) -> Duration {
        Duration::from_millis(self.ai_read_timeout_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
