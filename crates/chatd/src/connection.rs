// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection state machine: pre-auth → authenticated (lobby) → in-room,
//! driving heartbeats and bridging client I/O to `Room` and `SessionRegistry`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::queue::{BoxedWriter, MessageQueue, RoomMessageWriter, SharedWriter};
use crate::session::Session;
use crate::state::ChatState;

/// Boxed reader half of a connection's transport (plaintext or TLS).
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

const READ_TIMEOUT: Duration = Duration::from_secs(60);
const HISTORY_TAIL_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    PreAuth,
    Authenticated,
    InRoom,
}

enum Command {
    Login { user: String, pass: String },
    Register { user: String, pass: String },
    Reconnect { token: String, room: Option<String> },
    ListRooms,
    JoinRoom { name: String },
    CreateRoom { name: String },
    CreateAiRoom { name: String, prompt: String },
    Message { text: String },
    LeaveRoom,
    Logout,
    Heartbeat,
    HeartbeatAck,
    Unknown,
    InvalidFormat,
    InvalidFormatAiRoom,
}

fn parse_command(line: &str) -> Command {
    let line = line.trim_end_matches(['\r', '\n']);
    let (verb, rest) = match line.split_once(' ') {
        Some((v, r)) => (v, r),
        None => (line, ""),
    };
    match verb {
        "LOGIN" => match rest.split_once(' ') {
            Some((user, pass)) if !user.is_empty() && !pass.is_empty() => {
                Command::Login { user: user.to_owned(), pass: pass.to_owned() }
            }
            _ => Command::InvalidFormat,
        },
        "REGISTER" => match rest.split_once(' ') {
            Some((user, pass)) if !user.is_empty() && !pass.is_empty() => {
                Command::Register { user: user.to_owned(), pass: pass.to_owned() }
            }
            _ => Command::InvalidFormat,
        },
        "RECONNECT" => {
            if rest.is_empty() {
                return Command::InvalidFormat;
            }
            let mut parts = rest.splitn(2, ' ');
            let token = parts.next().unwrap_or_default().to_owned();
            let room = parts.next().map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned);
            Command::Reconnect { token, room }
        }
        "LIST_ROOMS" => Command::ListRooms,
        "JOIN_ROOM" => {
            if rest.is_empty() {
                Command::InvalidFormat
            } else {
                Command::JoinRoom { name: rest.to_owned() }
            }
        }
        "CREATE_ROOM" => {
            if rest.is_empty() {
                Command::InvalidFormat
            } else {
                Command::CreateRoom { name: rest.to_owned() }
            }
        }
        "CREATE_AI_ROOM" => match rest.split_once('|') {
            Some((name, prompt)) if !name.is_empty() && !prompt.is_empty() => {
                Command::CreateAiRoom { name: name.to_owned(), prompt: prompt.to_owned() }
            }
            _ => Command::InvalidFormatAiRoom,
        },
        "MESSAGE" => Command::Message { text: rest.to_owned() },
        "LEAVE_ROOM" => Command::LeaveRoom,
        "LOGOUT" => Command::Logout,
        "HEARTBEAT" => Command::Heartbeat,
        "HEARTBEAT_ACK" => Command::HeartbeatAck,
        _ => Command::Unknown,
    }
}

/// Drives one client connection end to end.
pub struct ConnectionHandler {
    reader: BufReader<BoxedReader>,
    writer: SharedWriter,
    state: State,
    session: Option<Arc<Session>>,
    queue: Option<Arc<MessageQueue>>,
    chat: Arc<ChatState>,
    conn_cancel: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, chat: Arc<ChatState>) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: SharedWriter::new(writer),
            state: State::PreAuth,
            session: None,
            queue: None,
            chat,
            conn_cancel: CancellationToken::new(),
        }
    }

    /// Run the connection until it terminates (logout, disconnect, or
    /// server shutdown).
    pub async fn run(mut self) {
        if self.send_line("AUTH_REQUIRED").await.is_err() {
            return;
        }

        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            self.writer.clone(),
            self.chat.config.heartbeat_interval(),
            self.conn_cancel.clone(),
        ));

        loop {
            let mut line = String::new();
            tokio::select! {
                _ = self.conn_cancel.cancelled() => break,
                _ = self.chat.shutdown.cancelled() => break,
                result = tokio::time::timeout(READ_TIMEOUT, self.reader.read_line(&mut line)) => {
                    match result {
                        Ok(Ok(0)) => break, // EOF
                        Ok(Ok(_)) => {
                            if !self.handle_line(&line).await {
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            debug!(err = %e, "connection read error");
                            break;
                        }
                        Err(_) => {
                            debug!("connection read timed out");
                            break;
                        }
                    }
                }
            }
        }

        self.conn_cancel.cancel();
        heartbeat.abort();
        if self.state != State::PreAuth || self.session.is_some() {
            self.cleanup_soft().await;
        }
        info!(username = self.session.as_ref().map(|s| s.username.as_str()).unwrap_or("-"), "connection closed");
    }

    async fn heartbeat_loop(writer: SharedWriter, interval: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if writer.write_line("HEARTBEAT").await.is_err() {
                        cancel.cancel();
                        return;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn send_line(&mut self, msg: &str) -> std::io::Result<()> {
        let mut w = &mut self.writer;
        let mut buf = Vec::with_capacity(msg.len() + 1);
        buf.extend_from_slice(msg.as_bytes());
        buf.push(b'\n');
        AsyncWriteExt::write_all(&mut w, &buf).await?;
        AsyncWriteExt::flush(&mut w).await
    }

    /// Handle one line of input. Returns `false` if the connection should
    /// terminate immediately (transport error or explicit logout).
    async fn handle_line(&mut self, line: &str) -> bool {
        let cmd = parse_command(line);
        match cmd {
            Command::InvalidFormat => self.send_line("INVALID_FORMAT").await.is_ok(),
            Command::InvalidFormatAiRoom => self.send_line("INVALID_FORMAT_AI_ROOM").await.is_ok(),
            Command::HeartbeatAck if self.state == State::PreAuth => true, // tolerated pre-auth skew
            Command::Heartbeat => self.send_line("HEARTBEAT_ACK").await.is_ok(),
            Command::HeartbeatAck => true,
            Command::Unknown => self.send_line("UNKNOWN_COMMAND").await.is_ok(),
            Command::Login { user, pass } => self.handle_login(&user, &pass).await,
            Command::Register { user, pass } => self.handle_register(&user, &pass).await,
            Command::Reconnect { token, room } => self.handle_reconnect(&token, room).await,
            Command::ListRooms => self.handle_list_rooms().await,
            Command::JoinRoom { name } => self.handle_join_room(&name).await,
            Command::CreateRoom { name } => self.handle_create_room(&name).await,
            Command::CreateAiRoom { name, prompt } => self.handle_create_ai_room(&name, &prompt).await,
            Command::Message { text } => self.handle_message(&text).await,
            Command::LeaveRoom => self.handle_leave_room().await,
            Command::Logout => self.handle_logout().await,
        }
    }

    async fn handle_login(&mut self, user: &str, pass: &str) -> bool {
        if self.state != State::PreAuth {
            return self.send_line("UNKNOWN_COMMAND").await.is_ok();
        }
        match self.chat.users.authenticate(user, pass).await {
            Some(authed) => {
                let session = self.chat.sessions.create(authed.username.clone()).await;
                let ok = self.send_line(&format!("AUTH_SUCCESS {} {}", authed.username, session.token)).await.is_ok();
                self.session = Some(session);
                self.state = State::Authenticated;
                ok
            }
            None => self.send_line("AUTH_FAILED").await.is_ok(),
        }
    }

    async fn handle_register(&mut self, user: &str, pass: &str) -> bool {
        if self.state != State::PreAuth {
            return self.send_line("UNKNOWN_COMMAND").await.is_ok();
        }
        match self.chat.users.register(user, pass).await {
            Ok(crate::user_store::RegisterOutcome::Created) => self.send_line("REGISTER_SUCCESS").await.is_ok(),
            Ok(crate::user_store::RegisterOutcome::Exists) => {
                self.send_line("REGISTER_FAILED Username already exists").await.is_ok()
            }
            Err(e) => {
                warn!(err = %e, "registration failed");
                self.send_line("REGISTER_FAILED Internal error").await.is_ok()
            }
        }
    }

    async fn handle_reconnect(&mut self, token: &str, room: Option<String>) -> bool {
        if self.state != State::PreAuth {
            return self.send_line("UNKNOWN_COMMAND").await.is_ok();
        }
        let Some(session) = self.chat.sessions.get(token).await else {
            return self.send_line("SESSION_EXPIRED").await.is_ok();
        };

        let target_room = match room {
            Some(r) => Some(r),
            None => session.current_room.read().await.clone(),
        };

        let resolved = match &target_room {
            Some(name) => self.chat.rooms.get(name).await,
            None => None,
        };

        let ok = match resolved {
            Some(room) => {
                let reply = format!("RECONNECT_SUCCESS {} {}", session.username, room.name);
                if self.send_line(&reply).await.is_err() {
                    false
                } else {
                    let queue =
                        room.add_user(&session.username, Box::new(RoomMessageWriter::new(self.writer.clone()))).await;
                    *session.current_room.write().await = Some(room.name.clone());
                    self.queue = Some(queue);
                    self.state = State::InRoom;
                    room.tell_user(&session.username, format!("[System: Reconnected to room {}]", room.name)).await;
                    true
                }
            }
            None => {
                *session.current_room.write().await = None;
                self.state = State::Authenticated;
                self.send_line(&format!("RECONNECT_SUCCESS {}", session.username)).await.is_ok()
            }
        };
        self.session = Some(session);
        ok
    }

    async fn handle_list_rooms(&mut self) -> bool {
        if self.state == State::PreAuth {
            return self.send_line("UNKNOWN_COMMAND").await.is_ok();
        }
        let names = self.chat.rooms.names().await;
        self.send_line(&format!("ROOM_LIST {}", names.join(","))).await.is_ok()
    }

    async fn handle_join_room(&mut self, name: &str) -> bool {
        if self.state == State::PreAuth {
            return self.send_line("UNKNOWN_COMMAND").await.is_ok();
        }
        if !self.chat.rooms.exists(name).await {
            return self.send_line(&format!("ERROR {}", ChatError::RoomNotFound.reason())).await.is_ok();
        }
        self.leave_current_room_silently().await;
        self.enter_room(name, "JOINED_ROOM").await
    }

    async fn handle_create_room(&mut self, name: &str) -> bool {
        if self.state == State::PreAuth {
            return self.send_line("UNKNOWN_COMMAND").await.is_ok();
        }
        match self.chat.rooms.create_room(name).await {
            Ok(_) => {
                if self.send_line(&format!("ROOM_CREATED {name}")).await.is_err() {
                    return false;
                }
                self.leave_current_room_silently().await;
                self.enter_room(name, "JOINED_ROOM").await
            }
            Err(e) => self.send_line(&format!("ERROR {}", e.reason())).await.is_ok(),
        }
    }

    async fn handle_create_ai_room(&mut self, name: &str, prompt: &str) -> bool {
        if self.state == State::PreAuth {
            return self.send_line("UNKNOWN_COMMAND").await.is_ok();
        }
        match self.chat.rooms.create_ai_room(name, prompt).await {
            Ok(_) => {
                if self.send_line(&format!("AI_ROOM_CREATED {name}")).await.is_err() {
                    return false;
                }
                self.leave_current_room_silently().await;
                self.enter_room(name, "JOINED_ROOM").await
            }
            Err(e) => self.send_line(&format!("ERROR {}", e.reason())).await.is_ok(),
        }
    }

    /// Join `name`, announce the confirmation, then subscribe and broadcast
    /// the "enters the room" notice (scenario 1, §8). Used both for a plain
    /// `JOIN_ROOM` and for the auto-join after `CREATE_ROOM`/`CREATE_AI_ROOM`,
    /// which send their own creation confirmation first.
    async fn enter_room(&mut self, name: &str, confirm_verb: &str) -> bool {
        let Some(room) = self.chat.rooms.get(name).await else {
            return self.send_line(&format!("ERROR {}", ChatError::RoomNotFound.reason())).await.is_ok();
        };
        if self.send_line(&format!("{confirm_verb} {name}")).await.is_err() {
            return false;
        }
        self.subscribe(&room).await;
        room.system_message(&format!("{} enters the room", self.username())).await;
        true
    }

    async fn subscribe(&mut self, room: &Arc<crate::room::Room>) {
        let queue = room.add_user(&self.username(), Box::new(RoomMessageWriter::new(self.writer.clone()))).await;
        if let Some(session) = &self.session {
            *session.current_room.write().await = Some(room.name.clone());
        }
        self.queue = Some(queue);
        self.state = State::InRoom;
    }

    /// Leave the current room without any broadcast, used when switching
    /// rooms directly (join/create while already in one).
    async fn leave_current_room_silently(&mut self) {
        if let Some(session) = &self.session {
            if let Some(name) = session.current_room.read().await.clone() {
                if let Some(room) = self.chat.rooms.get(&name).await {
                    room.remove_user(&session.username).await;
                }
            }
        }
        self.queue = None;
    }

    async fn handle_message(&mut self, text: &str) -> bool {
        let (Some(session), Some(_)) = (&self.session, &self.queue) else {
            return self.send_line(&format!("ERROR {}", ChatError::NotInRoom.reason())).await.is_ok();
        };
        let Some(room_name) = session.current_room.read().await.clone() else {
            return self.send_line(&format!("ERROR {}", ChatError::NotInRoom.reason())).await.is_ok();
        };
        let Some(room) = self.chat.rooms.get(&room_name).await else {
            return self.send_line(&format!("ERROR {}", ChatError::NotInRoom.reason())).await.is_ok();
        };
        room.user_message(&session.username, text).await;

        if room.is_ai {
            let room = room.clone();
            let chat = self.chat.clone();
            tokio::spawn(async move {
                let history = room.history_snapshot(HISTORY_TAIL_LINES).await;
                let reply = chat.ai.complete(&room.ai_system_prompt, &history).await;
                room.bot_message(&reply).await;
            });
        }
        true
    }

    async fn handle_leave_room(&mut self) -> bool {
        let Some(session) = &self.session else {
            return self.send_line(&format!("ERROR {}", ChatError::NotInRoom.reason())).await.is_ok();
        };
        let current = session.current_room.read().await.clone();
        let Some(room_name) = current else {
            return self.send_line(&format!("ERROR {}", ChatError::NotInRoom.reason())).await.is_ok();
        };
        if let Some(room) = self.chat.rooms.get(&room_name).await {
            room.system_message(&format!("{} leaves the room", session.username)).await;
            room.remove_user(&session.username).await;
        }
        *session.current_room.write().await = None;
        self.queue = None;
        self.state = State::Authenticated;
        self.send_line("LEFT_ROOM").await.is_ok()
    }

    /// Returns `false` if the connection should terminate (a real post-auth
    /// logout); `true` if `LOGOUT` was rejected as out-of-state (PreAuth is
    /// left connected, per §4.7 — `LOGOUT` isn't in its accepted set).
    async fn handle_logout(&mut self) -> bool {
        if self.state == State::PreAuth {
            return self.send_line("UNKNOWN_COMMAND").await.is_ok();
        }
        if let Some(session) = &self.session {
            if let Some(room_name) = session.current_room.read().await.clone() {
                if let Some(room) = self.chat.rooms.get(&room_name).await {
                    room.system_message(&format!("{} leaves the room", session.username)).await;
                    room.remove_user(&session.username).await;
                }
            }
        }
        self.cleanup_hard().await;
        let _ = self.send_line("LOGGED_OUT").await;
        false
    }

    fn username(&self) -> String {
        self.session.as_ref().map(|s| s.username.clone()).unwrap_or_default()
    }

    /// Disconnect without a prior `LOGOUT`: leave the session (and its
    /// remembered room) intact so a later `RECONNECT` can reattach.
    async fn cleanup_soft(&mut self) {
        if let Some(session) = &self.session {
            if let Some(room_name) = session.current_room.read().await.clone() {
                if let Some(room) = self.chat.rooms.get(&room_name).await {
                    room.remove_user(&session.username).await;
                }
            }
        }
        self.queue = None;
    }

    /// Explicit `LOGOUT`: invalidate the session and clear its room.
    async fn cleanup_hard(&mut self) {
        if let Some(session) = self.session.take() {
            *session.current_room.write().await = None;
            self.chat.sessions.remove(&session.token).await;
        }
        self.queue = None;
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
