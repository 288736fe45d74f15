// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Room membership, bounded history, and the broadcast linearisation point.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::RwLock;

use crate::error::ChatError;
use crate::queue::{BoxedWriter, MessageQueue};

const RECONNECT_SNAPSHOT_LINES: usize = 50;

struct RoomInner {
    history: VecDeque<String>,
    subscribers: IndexMap<String, Arc<MessageQueue>>,
}

/// A chat room: a name, a membership set, bounded history, and (optionally)
/// an AI persona.
pub struct Room {
    pub name: String,
    pub is_ai: bool,
    pub ai_system_prompt: String,
    history_cap: usize,
    inner: RwLock<RoomInner>,
}

impl Room {
    pub fn new(name: impl Into<String>, history_cap: usize) -> Self {
        Self {
            name: name.into(),
            is_ai: false,
            ai_system_prompt: String::new(),
            history_cap,
            inner: RwLock::new(RoomInner { history: VecDeque::new(), subscribers: IndexMap::new() }),
        }
    }

    pub fn new_ai(name: impl Into<String>, system_prompt: impl Into<String>, history_cap: usize) -> Self {
        Self {
            name: name.into(),
            is_ai: true,
            ai_system_prompt: system_prompt.into(),
            history_cap,
            inner: RwLock::new(RoomInner { history: VecDeque::new(), subscribers: IndexMap::new() }),
        }
    }

    /// Subscribe `username` with a freshly spawned queue over `writer`,
    /// snapshotting the last `RECONNECT_SNAPSHOT_LINES` history entries into
    /// it. A rejoin replaces the prior queue for that user; the old one is
    /// detached (dropped, which cancels its drain) rather than left wired
    /// into the room.
    pub async fn add_user(&self, username: &str, writer: BoxedWriter) -> Arc<MessageQueue> {
        let mut inner = self.inner.write().await;
        let queue = Arc::new(MessageQueue::spawn(writer));
        let snapshot: Vec<String> =
            inner.history.iter().rev().take(RECONNECT_SNAPSHOT_LINES).rev().cloned().collect();
        for line in snapshot {
            queue.enqueue(line);
        }
        inner.subscribers.insert(username.to_owned(), queue.clone());
        queue
    }

    /// Remove `username` from the subscriber map. Its queue becomes
    /// unreachable to the room (the caller's own `Arc` may still finish
    /// draining whatever was already enqueued).
    pub async fn remove_user(&self, username: &str) {
        self.inner.write().await.subscribers.shift_remove(username);
    }

    pub async fn has_user(&self, username: &str) -> bool {
        self.inner.read().await.subscribers.contains_key(username)
    }

    pub async fn member_names(&self) -> HashSet<String> {
        self.inner.read().await.subscribers.keys().cloned().collect()
    }

    /// Append `msg` to history (evicting the oldest entry past the cap) and
    /// fan it out to every current subscriber. This is the linearisation
    /// point: the exclusive lock is held across both the append and the
    /// enqueue-to-every-subscriber step, so two concurrent broadcasts can
    /// never have their deliveries interleave out of commit order.
    /// `MessageQueue::enqueue` is a non-blocking channel send (the same
    /// operation `add_user` already performs while holding this lock), so
    /// holding the lock across it costs nothing but rules out reordering.
    pub async fn broadcast(&self, msg: impl Into<String>) {
        let msg = msg.into();
        let mut inner = self.inner.write().await;
        inner.history.push_back(msg.clone());
        while inner.history.len() > self.history_cap {
            inner.history.pop_front();
        }
        for queue in inner.subscribers.values() {
            queue.enqueue(msg.clone());
        }
    }

    pub async fn user_message(&self, username: &str, text: &str) {
        self.broadcast(format!("{username}: {text}")).await;
    }

    pub async fn bot_message(&self, text: &str) {
        if text.trim().is_empty() {
            self.system_message("Error: Bot did not generate a valid response").await;
            return;
        }
        self.broadcast(format!("Bot: {text}")).await;
    }

    pub async fn system_message(&self, text: &str) {
        self.broadcast(format!("[{text}]")).await;
    }

    /// Deliver `msg` to exactly one subscriber — used for the reconnect-only
    /// `[System: Reconnected to room ...]` notice, which must not be
    /// broadcast to the rest of the room.
    pub async fn tell_user(&self, username: &str, msg: impl Into<String>) {
        let queue = self.inner.read().await.subscribers.get(username).cloned();
        if let Some(queue) = queue {
            queue.enqueue(msg.into());
        }
    }

    /// Newline-joined last `k` history entries, oldest to newest.
    pub async fn history_snapshot(&self, k: usize) -> String {
        let inner = self.inner.read().await;
        let lines: Vec<&String> = inner.history.iter().rev().take(k).collect();
        lines.into_iter().rev().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Name -> Room directory with a uniqueness guarantee on creation.
pub struct RoomRegistry {
    rooms: RwLock<IndexMap<String, Arc<Room>>>,
    history_cap: usize,
}

impl RoomRegistry {
    pub fn new(history_cap: usize) -> Self {
        Self { rooms: RwLock::new(IndexMap::new()), history_cap }
    }

    pub async fn create_room(&self, name: &str) -> Result<Arc<Room>, ChatError> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(name) {
            return Err(ChatError::RoomExists);
        }
        let room = Arc::new(Room::new(name, self.history_cap));
        rooms.insert(name.to_owned(), room.clone());
        Ok(room)
    }

    pub async fn create_ai_room(&self, name: &str, system_prompt: &str) -> Result<Arc<Room>, ChatError> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(name) {
            return Err(ChatError::RoomExists);
        }
        let room = Arc::new(Room::new_ai(name, system_prompt, self.history_cap));
        rooms.insert(name.to_owned(), room.clone());
        Ok(room)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.rooms.read().await.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
#[path = "room_tests.rs"]
mod tests;
