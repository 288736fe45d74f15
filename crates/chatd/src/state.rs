// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared server state: the four single-writer/multi-reader components
//! (`UserStore`, `SessionRegistry`, `RoomRegistry`, `AICompleter`) bundled
//! behind one handle, plus the rooms every deployment starts with.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ai::AiCompleter;
use crate::config::ChatConfig;
use crate::room::RoomRegistry;
use crate::session::SessionRegistry;
use crate::user_store::UserStore;

pub const GENERAL_ROOM: &str = "General";
pub const LIBRARY_ROOM: &str = "Library";

/// Everything a `ConnectionHandler` needs, shared across every connection.
pub struct ChatState {
    pub users: UserStore,
    pub sessions: Arc<SessionRegistry>,
    pub rooms: RoomRegistry,
    pub ai: AiCompleter,
    pub config: ChatConfig,
    pub shutdown: CancellationToken,
}

impl ChatState {
    /// Load the user store, build the registries, and create the rooms
    /// every deployment starts with (`General`, `Library`, and one AI room).
    pub async fn bootstrap(config: ChatConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let users = UserStore::load(&config.user_file).await?;
        let sessions = Arc::new(SessionRegistry::new(config.session_ttl()));
        let rooms = RoomRegistry::new(config.history_cap);
        let ai = AiCompleter::new(
            config.ai_endpoint.clone(),
            config.ai_connect_timeout(),
            config.ai_read_timeout(),
            config.cache_ttl(),
        );

        rooms.create_room(GENERAL_ROOM).await.ok();
        rooms.create_room(LIBRARY_ROOM).await.ok();
        rooms.create_ai_room(&config.ai_room_name, &config.ai_room_prompt).await.ok();
        info!(ai_room = %config.ai_room_name, "bootstrapped rooms: {GENERAL_ROOM}, {LIBRARY_ROOM}");

        Ok(Self { users, sessions, rooms, ai, config, shutdown })
    }

    /// Clone the `Arc` handle onto the session registry, for spawning its
    /// background sweeper (`spawn_sweeper` takes `self: Arc<Self>`).
    pub fn sessions_clone(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }
}
