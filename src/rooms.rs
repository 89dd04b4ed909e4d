use async_trait::async_trait;
use axum::extract::ws;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::RoomsConfig;
use crate::error::RoomError;
use crate::room::messages::{RoomSnapshot, ServerEvent, client_message_from_ws_text};
use crate::room::settings::{RoomSettings, normalize_settings};
use crate::room::timer::now_ms;
use crate::room::transitions::{self, Effect};
use crate::room::{
    Room, RoundPhase, canonical_name, canonical_room_key, generate_room_key, sanitize_user_name,
};
use crate::storage::RoomStore;

pub const CLOSE_INVALID_SESSION: u16 = 4003;
pub const CLOSE_SUPERSEDED: u16 = 4004;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
const MAX_ROOM_KEY_ATTEMPTS: usize = 16;

pub fn close_message(code: u16, reason: &'static str) -> ws::Message {
    ws::Message::Close(Some(ws::CloseFrame {
        code,
        reason: ws::Utf8Bytes::from_static(reason),
    }))
}

/// Called after a committed transition moves a room between idle, voting
/// and revealed. Never called for rejected or no-op requests.
#[async_trait]
pub trait RoundPhaseHook: Send + Sync + std::fmt::Debug {
    async fn on_phase_change(&self, room_key: &str, from: RoundPhase, to: RoundPhase);
}

#[derive(Debug, Default)]
pub struct LoggingPhaseHook;

#[async_trait]
impl RoundPhaseHook for LoggingPhaseHook {
    async fn on_phase_change(&self, room_key: &str, from: RoundPhase, to: RoundPhase) {
        tracing::info!(
            room.key = %room_key,
            phase.from = ?from,
            phase.to = ?to,
            "Round phase changed"
        );
    }
}

#[derive(Debug, Clone)]
pub struct RoomDetails {
    pub room_key: String,
    pub moderator: String,
    pub handle: RoomActorHandle,
}

#[derive(Debug)]
pub enum RoomManagerMessage {
    CreateRoom {
        creator: String,
        settings: RoomSettings,
        respond_to: oneshot::Sender<Result<RoomDetails, RoomError>>,
    },
    GetRoomHandle {
        room_key: String,
        respond_to: oneshot::Sender<Result<Option<RoomActorHandle>, RoomError>>,
    },
    RoomActorShutdown {
        room_key: String,
        instance_id: Uuid,
    },
}

pub struct RoomManagerActor {
    receiver: mpsc::Receiver<RoomManagerMessage>,
    rooms: HashMap<String, RoomActorHandle>,
    self_sender: mpsc::Sender<RoomManagerMessage>,
    store: Arc<dyn RoomStore>,
    rooms_config: RoomsConfig,
    phase_hook: Arc<dyn RoundPhaseHook>,
}

impl RoomManagerActor {
    fn new(
        receiver: mpsc::Receiver<RoomManagerMessage>,
        self_sender: mpsc::Sender<RoomManagerMessage>,
        store: Arc<dyn RoomStore>,
        rooms_config: RoomsConfig,
        phase_hook: Arc<dyn RoundPhaseHook>,
    ) -> Self {
        RoomManagerActor {
            receiver,
            rooms: HashMap::new(),
            self_sender,
            store,
            rooms_config,
            phase_hook,
        }
    }

    #[tracing::instrument(skip(self, msg), fields(
        msg_type = %std::any::type_name_of_val(&msg)
    ))]
    async fn handle_message(&mut self, msg: RoomManagerMessage) {
        match msg {
            RoomManagerMessage::CreateRoom {
                creator,
                settings,
                respond_to,
            } => {
                let result = self.create_room(&creator, settings).await;
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "Failed to create room");
                }
                let _ = respond_to.send(result);
            }
            RoomManagerMessage::GetRoomHandle {
                room_key,
                respond_to,
            } => {
                let result = self.room_handle(&canonical_room_key(&room_key)).await;
                let _ = respond_to.send(result);
            }
            RoomManagerMessage::RoomActorShutdown {
                room_key,
                instance_id,
            } => {
                let is_current = self
                    .rooms
                    .get(&room_key)
                    .is_some_and(|h| h.instance_id == instance_id);
                if is_current {
                    self.rooms.remove(&room_key);
                    tracing::info!(room.key = %room_key, "Released room after actor shutdown");
                } else {
                    tracing::debug!(
                        room.key = %room_key,
                        "Shutdown notice for a room actor that was already replaced"
                    );
                }
            }
        }
    }

    async fn create_room(
        &mut self,
        creator: &str,
        settings: RoomSettings,
    ) -> Result<RoomDetails, RoomError> {
        let creator = sanitize_user_name(creator).ok_or(RoomError::InvalidUserName)?;

        let mut room_key = None;
        for _ in 0..MAX_ROOM_KEY_ATTEMPTS {
            let candidate = generate_room_key(&mut rand::thread_rng());
            if self.rooms.contains_key(&candidate) {
                continue;
            }
            if self.store.get_room(&candidate).await?.is_none() {
                room_key = Some(candidate);
                break;
            }
        }
        let room_key = room_key.ok_or(RoomError::KeySpaceExhausted)?;

        let room = Room::new(room_key.clone(), &creator, settings, now_ms());
        self.store.put_room(&room).await?;
        let handle = self.spawn_room(room);
        self.rooms.insert(room_key.clone(), handle.clone());

        tracing::info!(room.key = %room_key, user.name = %creator, "Created room");
        Ok(RoomDetails {
            room_key,
            moderator: creator,
            handle,
        })
    }

    async fn room_handle(&mut self, room_key: &str) -> Result<Option<RoomActorHandle>, RoomError> {
        if let Some(handle) = self.rooms.get(room_key) {
            if !handle.is_closed() {
                return Ok(Some(handle.clone()));
            }
            tracing::debug!(room.key = %room_key, "Dropping handle of stopped room actor");
            self.rooms.remove(room_key);
        }

        let Some(mut room) = self.store.get_room(room_key).await? else {
            return Ok(None);
        };
        room.settings = normalize_settings(room.settings);
        // A freshly loaded room has no live sessions yet.
        for connected in room.connected_users.values_mut() {
            *connected = false;
        }
        tracing::info!(room.key = %room_key, "Loaded room from storage");
        let handle = self.spawn_room(room);
        self.rooms.insert(room_key.to_string(), handle.clone());
        Ok(Some(handle))
    }

    fn spawn_room(&self, room: Room) -> RoomActorHandle {
        RoomActorHandle::spawn(
            room,
            &self.rooms_config,
            RoomManagerHandle {
                sender: self.self_sender.clone(),
            },
            Arc::clone(&self.store),
            Arc::clone(&self.phase_hook),
        )
    }
}

#[tracing::instrument(skip(actor))]
pub async fn run_room_manager_actor(mut actor: RoomManagerActor) {
    tracing::info!("RoomManager actor started");
    while let Some(msg) = actor.receiver.recv().await {
        actor.handle_message(msg).await;
    }
    tracing::info!("RoomManager actor stopped");
}

#[derive(Clone, Debug)]
pub struct RoomManagerHandle {
    sender: mpsc::Sender<RoomManagerMessage>,
}

impl RoomManagerHandle {
    pub fn spawn(
        buffer_size: usize,
        store: Arc<dyn RoomStore>,
        rooms_config: RoomsConfig,
        phase_hook: Arc<dyn RoundPhaseHook>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let actor =
            RoomManagerActor::new(receiver, sender.clone(), store, rooms_config, phase_hook);
        tokio::spawn(run_room_manager_actor(actor));
        Self { sender }
    }

    pub async fn create_room(
        &self,
        creator: String,
        settings: RoomSettings,
    ) -> Result<RoomDetails, RoomError> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(RoomManagerMessage::CreateRoom {
                creator,
                settings,
                respond_to,
            })
            .await
            .map_err(|e| RoomError::ActorUnavailable(format!("Failed to send CreateRoom: {}", e)))?;
        rx.await
            .map_err(|e| RoomError::ActorUnavailable(format!("RoomManager no response: {}", e)))?
    }

    pub async fn get_room_handle(&self, room_key: &str) -> Result<Option<RoomActorHandle>, RoomError> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(RoomManagerMessage::GetRoomHandle {
                room_key: room_key.to_string(),
                respond_to,
            })
            .await
            .map_err(|e| RoomError::ActorUnavailable(format!("Failed to send GetRoomHandle: {}", e)))?;
        rx.await
            .map_err(|e| RoomError::ActorUnavailable(format!("RoomManager no response: {}", e)))?
    }

    pub async fn notify_room_shutdown(&self, room_key: String, instance_id: Uuid) {
        if self
            .sender
            .send(RoomManagerMessage::RoomActorShutdown {
                room_key,
                instance_id,
            })
            .await
            .is_err()
        {
            tracing::error!("Failed to send RoomActorShutdown");
        }
    }
}

#[derive(Debug)]
pub enum RoomActorMessage {
    ClientEvent {
        session_id: Uuid,
        raw_payload: String,
    },
    ClientConnected {
        session_id: Uuid,
        user_name: String,
        client_tx: mpsc::Sender<ws::Message>,
    },
    ClientDisconnected {
        session_id: Uuid,
    },
    ResolveUser {
        user_name: String,
        respond_to: oneshot::Sender<Option<String>>,
    },
    JoinUser {
        user_name: String,
        respond_to: oneshot::Sender<Result<String, RoomError>>,
    },
    DisconnectOtherSessions {
        user_name: String,
        respond_to: oneshot::Sender<usize>,
    },
    GetRoom {
        respond_to: oneshot::Sender<Room>,
    },
}

#[derive(Debug)]
struct ClientSession {
    user_name: String,
    client_tx: mpsc::Sender<ws::Message>,
}

/// Owns one room and its live sessions. Every mutation goes through this
/// actor's mailbox, so at most one transition is in flight per room.
pub struct RoomActor {
    receiver: mpsc::Receiver<RoomActorMessage>,
    instance_id: Uuid,
    room: Room,
    sessions: HashMap<Uuid, ClientSession>,
    manager_handle: RoomManagerHandle,
    store: Arc<dyn RoomStore>,
    phase_hook: Arc<dyn RoundPhaseHook>,
}

impl RoomActor {
    fn new(
        receiver: mpsc::Receiver<RoomActorMessage>,
        instance_id: Uuid,
        room: Room,
        manager_handle: RoomManagerHandle,
        store: Arc<dyn RoomStore>,
        phase_hook: Arc<dyn RoundPhaseHook>,
    ) -> Self {
        RoomActor {
            receiver,
            instance_id,
            room,
            sessions: HashMap::new(),
            manager_handle,
            store,
            phase_hook,
        }
    }

    #[tracing::instrument(skip(self, msg), fields(
        room.key = %self.room.key,
        msg_type = %std::any::type_name_of_val(&msg)
    ))]
    async fn handle_message(&mut self, msg: RoomActorMessage) {
        match msg {
            RoomActorMessage::ClientEvent {
                session_id,
                raw_payload,
            } => self.handle_client_event(session_id, raw_payload).await,
            RoomActorMessage::ClientConnected {
                session_id,
                user_name,
                client_tx,
            } => self.handle_client_connected(session_id, user_name, client_tx).await,
            RoomActorMessage::ClientDisconnected { session_id } => {
                if let Some(session) = self.sessions.remove(&session_id) {
                    tracing::debug!(
                        session.id = %session_id,
                        user.name = %session.user_name,
                        "Client disconnected"
                    );
                    let failed = self.process_departure(&session.user_name, true).await;
                    self.prune_sessions(failed).await;
                }
            }
            RoomActorMessage::ResolveUser {
                user_name,
                respond_to,
            } => {
                let _ = respond_to.send(self.room.find_user(&user_name).cloned());
            }
            RoomActorMessage::JoinUser {
                user_name,
                respond_to,
            } => {
                let result = self.join_user(&user_name).await;
                let _ = respond_to.send(result);
            }
            RoomActorMessage::DisconnectOtherSessions {
                user_name,
                respond_to,
            } => {
                let user_name = self
                    .room
                    .find_user(&user_name)
                    .cloned()
                    .unwrap_or(user_name);
                let closed = self.close_sessions_of(&user_name, None);
                if closed > 0 {
                    tracing::info!(
                        user.name = %user_name,
                        sessions.closed = closed,
                        "Closed superseded sessions"
                    );
                    let failed = self.process_departure(&user_name, false).await;
                    self.prune_sessions(failed).await;
                }
                let _ = respond_to.send(closed);
            }
            RoomActorMessage::GetRoom { respond_to } => {
                let _ = respond_to.send(self.room.clone());
            }
        }
    }

    /// Stops intake and answers whatever is still queued. New sessions are
    /// closed with 1011 so the client reconnects to a fresh actor.
    fn drain_on_retire(&mut self) {
        self.receiver.close();
        while let Ok(msg) = self.receiver.try_recv() {
            match msg {
                RoomActorMessage::ClientConnected {
                    session_id,
                    client_tx,
                    ..
                } => {
                    tracing::debug!(session.id = %session_id, "Refusing session on retiring room");
                    if let Ok(msg) = ServerEvent::error("Room is restarting, please reconnect").to_ws_text() {
                        let _ = client_tx.try_send(msg);
                    }
                    let _ = client_tx.try_send(close_message(CLOSE_INTERNAL_ERROR, "Room restarting"));
                }
                RoomActorMessage::ResolveUser {
                    user_name,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.room.find_user(&user_name).cloned());
                }
                RoomActorMessage::GetRoom { respond_to } => {
                    let _ = respond_to.send(self.room.clone());
                }
                RoomActorMessage::JoinUser { respond_to, .. } => {
                    let _ = respond_to.send(Err(RoomError::ActorUnavailable(
                        "Room is restarting".to_string(),
                    )));
                }
                RoomActorMessage::DisconnectOtherSessions { respond_to, .. } => {
                    let _ = respond_to.send(0);
                }
                RoomActorMessage::ClientEvent { .. } | RoomActorMessage::ClientDisconnected { .. } => {}
            }
        }
    }

    async fn handle_client_event(&mut self, session_id: Uuid, raw_payload: String) {
        let Some(user_name) = self
            .sessions
            .get(&session_id)
            .map(|s| s.user_name.clone())
        else {
            tracing::warn!(session.id = %session_id, "Event from unknown session");
            return;
        };
        tracing::trace!(
            session.id = %session_id,
            event.raw = %raw_payload,
            "Raw event from client"
        );

        let message = match client_message_from_ws_text(&raw_payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    session.id = %session_id,
                    error = %e,
                    event.raw = %raw_payload,
                    "Failed to deserialize event from client"
                );
                let reply = ServerEvent::error(format!("Invalid message: {}", e));
                if !self.send_to_session(session_id, &reply) {
                    self.prune_sessions(vec![session_id]).await;
                }
                return;
            }
        };
        tracing::debug!(
            session.id = %session_id,
            user.name = %user_name,
            message = ?message,
            "Processing event from client"
        );

        let mut working = self.room.clone();
        let effects = transitions::apply(&mut working, &user_name, message, now_ms());
        if effects.is_empty() {
            return;
        }

        if effects.iter().any(Effect::mutates_room) {
            if let Err(e) = self.store.put_room(&working).await {
                tracing::error!(
                    session.id = %session_id,
                    error = %e,
                    "Failed to persist room; discarding transition"
                );
                let reply = ServerEvent::error("Could not save the room. Please try again.");
                if !self.send_to_session(session_id, &reply) {
                    self.prune_sessions(vec![session_id]).await;
                }
                return;
            }
            self.room = working;
        }

        let mut failed = Vec::new();
        for effect in effects {
            match effect {
                Effect::Broadcast(event) => failed.extend(self.fan_out(&event, None)),
                Effect::Reply(event) => {
                    if !self.send_to_session(session_id, &event) {
                        failed.push(session_id);
                    }
                }
                Effect::MiniGameChanged => failed.extend(self.fan_out_mini_game()),
                Effect::PhaseChanged { from, to } => {
                    self.phase_hook
                        .on_phase_change(&self.room.key, from, to)
                        .await;
                }
            }
        }
        self.prune_sessions(failed).await;
    }

    async fn handle_client_connected(
        &mut self,
        session_id: Uuid,
        user_name: String,
        client_tx: mpsc::Sender<ws::Message>,
    ) {
        let Some(user_name) = self.room.find_user(&user_name).cloned() else {
            tracing::warn!(
                session.id = %session_id,
                user.name = %user_name,
                "Session for a user who is not in the room"
            );
            if let Ok(msg) = ServerEvent::error("Invalid session token").to_ws_text() {
                let _ = client_tx.try_send(msg);
            }
            let _ = client_tx.try_send(close_message(CLOSE_INVALID_SESSION, "Invalid session token"));
            return;
        };

        let superseded = self.close_sessions_of(&user_name, Some(session_id));
        if superseded > 0 {
            tracing::info!(
                user.name = %user_name,
                sessions.closed = superseded,
                "New session superseded older ones"
            );
        }

        self.sessions.insert(
            session_id,
            ClientSession {
                user_name: user_name.clone(),
                client_tx,
            },
        );
        tracing::info!(session.id = %session_id, user.name = %user_name, "Client connected");

        let mut failed = Vec::new();
        if self.room.set_connected(&user_name, true) {
            self.persist_presence().await;
            let event = ServerEvent::UserConnectionStatus {
                user: user_name.clone(),
                connected: true,
            };
            failed.extend(self.fan_out(&event, Some(session_id)));
        }

        let snapshot = ServerEvent::Initialize {
            room: RoomSnapshot::for_user(&self.room, &user_name),
        };
        if !self.send_to_session(session_id, &snapshot) {
            failed.push(session_id);
        }
        self.prune_sessions(failed).await;
    }

    async fn join_user(&mut self, raw_name: &str) -> Result<String, RoomError> {
        let name = sanitize_user_name(raw_name).ok_or(RoomError::InvalidUserName)?;
        let mut working = self.room.clone();
        let (name, added) = working.add_user(&name);
        if !added {
            return Ok(name);
        }
        self.store.put_room(&working).await?;
        self.room = working;
        tracing::info!(user.name = %name, "User joined room");

        let failed = self.fan_out(&ServerEvent::UserJoined { user: name.clone() }, None);
        self.prune_sessions(failed).await;
        Ok(name)
    }

    /// Closes every session of `user_name` except `keep` with 4004 and
    /// returns how many were closed.
    fn close_sessions_of(&mut self, user_name: &str, keep: Option<Uuid>) -> usize {
        let wanted = canonical_name(user_name);
        let ids: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|(id, s)| Some(**id) != keep && canonical_name(&s.user_name) == wanted)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(session) = self.sessions.remove(id) {
                let _ = session
                    .client_tx
                    .try_send(close_message(CLOSE_SUPERSEDED, "Session superseded"));
            }
        }
        ids.len()
    }

    /// Marks `user_name` disconnected once their last session is gone and
    /// hands the moderator role over when allowed. Returns sessions whose
    /// delivery failed.
    async fn process_departure(&mut self, user_name: &str, allow_handover: bool) -> Vec<Uuid> {
        let wanted = canonical_name(user_name);
        if self
            .sessions
            .values()
            .any(|s| canonical_name(&s.user_name) == wanted)
        {
            return Vec::new();
        }

        let mut events = Vec::new();
        if self.room.set_connected(user_name, false) {
            events.push(ServerEvent::UserConnectionStatus {
                user: user_name.to_string(),
                connected: false,
            });
        }
        if allow_handover
            && self.room.settings.auto_handover_moderator
            && self.room.is_moderator(user_name)
            && let Some(next) = self.room.moderator_candidate(user_name)
        {
            tracing::info!(
                moderator.previous = %user_name,
                moderator.next = %next,
                "Handing moderator role over"
            );
            self.room.moderator = next.clone();
            events.push(ServerEvent::NewModerator { moderator: next });
        }
        if events.is_empty() {
            return Vec::new();
        }

        self.persist_presence().await;
        events
            .iter()
            .flat_map(|event| self.fan_out(event, None))
            .collect()
    }

    /// Presence changes cannot be refused, so a failed write is only logged.
    async fn persist_presence(&self) {
        if let Err(e) = self.store.put_room(&self.room).await {
            tracing::error!(error = %e, "Failed to persist presence change");
        }
    }

    fn send_to_session(&self, session_id: Uuid, event: &ServerEvent) -> bool {
        let Some(session) = self.sessions.get(&session_id) else {
            return true;
        };
        match event.to_ws_text() {
            Ok(msg) => session.client_tx.try_send(msg).is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize event");
                true
            }
        }
    }

    /// Serializes once and pushes to every session without waiting. Returns
    /// sessions that were full or gone.
    fn fan_out(&self, event: &ServerEvent, except: Option<Uuid>) -> Vec<Uuid> {
        let msg = match event.to_ws_text() {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize broadcast");
                return Vec::new();
            }
        };
        self.sessions
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .filter(|(_, session)| session.client_tx.try_send(msg.clone()).is_err())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Spymasters get the full board, everyone else the redacted one.
    fn fan_out_mini_game(&self) -> Vec<Uuid> {
        let game = self.room.mini_game_state.as_ref();
        let public = game.map(|g| g.public_view());
        let public_msg = ServerEvent::MiniGameState { state: public }.to_ws_text();
        let spymaster_msg = game
            .map(|g| ServerEvent::MiniGameState {
                state: Some(g.spymaster_view()),
            })
            .map(|event| event.to_ws_text());

        let mut failed = Vec::new();
        for (id, session) in &self.sessions {
            let is_spymaster = game.is_some_and(|g| g.is_spymaster(&session.user_name));
            let msg = match (&spymaster_msg, &public_msg) {
                (Some(Ok(full)), _) if is_spymaster => full.clone(),
                (_, Ok(public)) => public.clone(),
                (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to serialize mini-game state");
                    return failed;
                }
            };
            if session.client_tx.try_send(msg).is_err() {
                failed.push(*id);
            }
        }
        failed
    }

    async fn prune_sessions(&mut self, mut failed: Vec<Uuid>) {
        while let Some(session_id) = failed.pop() {
            let Some(session) = self.sessions.remove(&session_id) else {
                continue;
            };
            tracing::warn!(
                session.id = %session_id,
                user.name = %session.user_name,
                "Dropping session that could not keep up"
            );
            failed.extend(self.process_departure(&session.user_name, true).await);
        }
    }
}

#[tracing::instrument(skip(actor, idle_timeout), fields(room.key = %actor.room.key))]
pub async fn run_room_actor(mut actor: RoomActor, idle_timeout: StdDuration) {
    tracing::info!("Room actor started");
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            maybe_msg = actor.receiver.recv() => {
                match maybe_msg {
                    Some(msg) => {
                        last_activity = Instant::now();
                        actor.handle_message(msg).await;
                    }
                    None => {
                        tracing::info!("Room actor channel closed. Shutting down");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(last_activity + idle_timeout), if actor.sessions.is_empty() => {
                tracing::info!("Room idle with no sessions. Notifying manager for shutdown");
                actor.drain_on_retire();
                actor
                    .manager_handle
                    .notify_room_shutdown(actor.room.key.clone(), actor.instance_id)
                    .await;
                break;
            }
        }
    }

    tracing::info!("Room actor stopped");
}

#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomActorMessage>,
    pub room_key: String,
    pub instance_id: Uuid,
}

impl RoomActorHandle {
    pub fn spawn(
        room: Room,
        rooms_config: &RoomsConfig,
        manager_handle: RoomManagerHandle,
        store: Arc<dyn RoomStore>,
        phase_hook: Arc<dyn RoundPhaseHook>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(rooms_config.channel_buffer_size);
        let instance_id = Uuid::new_v4();
        let room_key = room.key.clone();
        let actor = RoomActor::new(
            receiver,
            instance_id,
            room,
            manager_handle,
            store,
            phase_hook,
        );
        tokio::spawn(run_room_actor(
            actor,
            StdDuration::from_secs(rooms_config.idle_timeout_seconds),
        ));
        Self {
            sender,
            room_key,
            instance_id,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn forward_client_event(
        &self,
        session_id: Uuid,
        raw_payload: String,
    ) -> Result<(), RoomError> {
        self.sender
            .send(RoomActorMessage::ClientEvent {
                session_id,
                raw_payload,
            })
            .await
            .map_err(|e| RoomError::ActorUnavailable(format!("Failed to send event: {}", e)))
    }

    pub async fn client_connected(
        &self,
        session_id: Uuid,
        user_name: String,
        client_tx: mpsc::Sender<ws::Message>,
    ) -> Result<(), RoomError> {
        self.sender
            .send(RoomActorMessage::ClientConnected {
                session_id,
                user_name,
                client_tx,
            })
            .await
            .map_err(|e| RoomError::ActorUnavailable(format!("Failed to send ClientConnected: {}", e)))
    }

    pub async fn client_disconnected(&self, session_id: Uuid) {
        if self
            .sender
            .send(RoomActorMessage::ClientDisconnected { session_id })
            .await
            .is_err()
        {
            tracing::error!("Failed to send ClientDisconnected");
        }
    }

    pub async fn resolve_user(&self, user_name: &str) -> Result<Option<String>, RoomError> {
        let (respond_to, rx) = oneshot::channel();
        self.request(RoomActorMessage::ResolveUser {
            user_name: user_name.to_string(),
            respond_to,
        })
        .await?;
        rx.await
            .map_err(|e| RoomError::ActorUnavailable(format!("Room actor no response: {}", e)))
    }

    pub async fn join_user(&self, user_name: &str) -> Result<String, RoomError> {
        let (respond_to, rx) = oneshot::channel();
        self.request(RoomActorMessage::JoinUser {
            user_name: user_name.to_string(),
            respond_to,
        })
        .await?;
        rx.await
            .map_err(|e| RoomError::ActorUnavailable(format!("Room actor no response: {}", e)))?
    }

    /// Closes every live session of `user_name` with 4004.
    pub async fn disconnect_other_sessions(&self, user_name: &str) -> Result<usize, RoomError> {
        let (respond_to, rx) = oneshot::channel();
        self.request(RoomActorMessage::DisconnectOtherSessions {
            user_name: user_name.to_string(),
            respond_to,
        })
        .await?;
        rx.await
            .map_err(|e| RoomError::ActorUnavailable(format!("Room actor no response: {}", e)))
    }

    pub async fn room_state(&self) -> Result<Room, RoomError> {
        let (respond_to, rx) = oneshot::channel();
        self.request(RoomActorMessage::GetRoom { respond_to }).await?;
        rx.await
            .map_err(|e| RoomError::ActorUnavailable(format!("Room actor no response: {}", e)))
    }

    async fn request(&self, msg: RoomActorMessage) -> Result<(), RoomError> {
        self.sender
            .send(msg)
            .await
            .map_err(|e| RoomError::ActorUnavailable(format!("Failed to reach room actor: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::{InMemoryRoomStore, SessionTokenRecord};
    use serde_json::Value;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::timeout;

    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: InMemoryRoomStore,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl RoomStore for FlakyStore {
        async fn get_room(&self, room_key: &str) -> Result<Option<Room>, StorageError> {
            self.inner.get_room(room_key).await
        }

        async fn put_room(&self, room: &Room) -> Result<(), StorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("disk on fire".into()));
            }
            self.inner.put_room(room).await
        }

        async fn put_session_token(
            &self,
            room_key: &str,
            user_name: &str,
            record: SessionTokenRecord,
        ) -> Result<(), StorageError> {
            self.inner.put_session_token(room_key, user_name, record).await
        }

        async fn get_session_token(
            &self,
            room_key: &str,
            user_name: &str,
        ) -> Result<Option<SessionTokenRecord>, StorageError> {
            self.inner.get_session_token(room_key, user_name).await
        }
    }

    #[derive(Debug, Default)]
    struct RecordingHook {
        changes: Mutex<Vec<(RoundPhase, RoundPhase)>>,
    }

    #[async_trait]
    impl RoundPhaseHook for RecordingHook {
        async fn on_phase_change(&self, _room_key: &str, from: RoundPhase, to: RoundPhase) {
            self.changes.lock().unwrap().push((from, to));
        }
    }

    fn manager_with(store: Arc<dyn RoomStore>, hook: Arc<dyn RoundPhaseHook>) -> RoomManagerHandle {
        RoomManagerHandle::spawn(8, store, RoomsConfig::default(), hook)
    }

    fn manager() -> RoomManagerHandle {
        manager_with(Arc::new(InMemoryRoomStore::new()), Arc::new(LoggingPhaseHook))
    }

    async fn create(manager: &RoomManagerHandle, settings: RoomSettings) -> RoomActorHandle {
        manager
            .create_room("Alice".to_string(), settings)
            .await
            .unwrap()
            .handle
    }

    async fn connect(
        handle: &RoomActorHandle,
        user: &str,
        capacity: usize,
    ) -> (Uuid, mpsc::Receiver<ws::Message>) {
        let (tx, mut rx) = mpsc::channel(capacity);
        let session_id = Uuid::new_v4();
        handle
            .client_connected(session_id, user.to_string(), tx)
            .await
            .unwrap();
        let init = next_event(&mut rx).await;
        assert_eq!(init["type"], "initialize");
        (session_id, rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<ws::Message>) -> ws::Message {
        timeout(StdDuration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    async fn next_event(rx: &mut mpsc::Receiver<ws::Message>) -> Value {
        match next_message(rx).await {
            ws::Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    async fn next_event_of(rx: &mut mpsc::Receiver<ws::Message>, kind: &str) -> Value {
        loop {
            let event = next_event(rx).await;
            if event["type"] == kind {
                return event;
            }
        }
    }

    async fn send(handle: &RoomActorHandle, session_id: Uuid, payload: Value) {
        handle
            .forward_client_event(session_id, payload.to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_and_connect_sends_initialize() {
        let manager = manager();
        let details = manager
            .create_room("  Alice ".to_string(), RoomSettings::default())
            .await
            .unwrap();
        assert_eq!(details.moderator, "Alice");
        assert_eq!(details.room_key.len(), 6);

        let (tx, mut rx) = mpsc::channel(8);
        details
            .handle
            .client_connected(Uuid::new_v4(), "alice".to_string(), tx)
            .await
            .unwrap();
        let init = next_event(&mut rx).await;
        assert_eq!(init["type"], "initialize");
        assert_eq!(init["room"]["moderator"], "Alice");
        assert_eq!(init["room"]["connectedUsers"]["Alice"], true);

        let same = manager.get_room_handle(&details.room_key.to_lowercase()).await.unwrap();
        assert_eq!(same.unwrap().instance_id, details.handle.instance_id);
        assert!(manager.get_room_handle("NOPE99").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_blank_name() {
        let err = manager()
            .create_room("   ".to_string(), RoomSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::InvalidUserName));
    }

    #[tokio::test]
    async fn test_invalid_vote_changes_nothing_and_broadcasts_nothing() {
        let handle = create(
            &manager(),
            RoomSettings {
                estimate_options: vec!["1".into(), "2".into()],
                ..RoomSettings::default()
            },
        )
        .await;
        let (alice, mut rx) = connect(&handle, "Alice", 8).await;

        send(&handle, alice, serde_json::json!({"type": "vote", "vote": "99"})).await;
        let room = handle.room_state().await.unwrap();
        assert!(room.votes.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_vote_is_broadcast_and_hook_fires() {
        let hook = Arc::new(RecordingHook::default());
        let manager = manager_with(Arc::new(InMemoryRoomStore::new()), hook.clone());
        let handle = create(&manager, RoomSettings::default()).await;
        handle.join_user("Bob").await.unwrap();
        let (alice, mut alice_rx) = connect(&handle, "Alice", 8).await;
        let (_bob, mut bob_rx) = connect(&handle, "bob", 8).await;

        send(&handle, alice, serde_json::json!({"type": "vote", "vote": 5})).await;
        let event = next_event_of(&mut bob_rx, "vote").await;
        assert_eq!(event["user"], "Alice");
        assert_eq!(event["vote"], "5");
        next_event_of(&mut alice_rx, "vote").await;

        handle.room_state().await.unwrap();
        assert_eq!(
            hook.changes.lock().unwrap().as_slice(),
            &[(RoundPhase::Idle, RoundPhase::Voting)]
        );
    }

    #[tokio::test]
    async fn test_new_token_supersedes_live_session() {
        let handle = create(&manager(), RoomSettings::default()).await;
        let (_alice, mut rx) = connect(&handle, "Alice", 8).await;

        let closed = handle.disconnect_other_sessions("alice").await.unwrap();
        assert_eq!(closed, 1);
        match next_message(&mut rx).await {
            ws::Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_SUPERSEDED),
            other => panic!("expected close, got {other:?}"),
        }
        let room = handle.room_state().await.unwrap();
        assert!(!room.is_connected("Alice"));
    }

    #[tokio::test]
    async fn test_second_session_replaces_first() {
        let handle = create(&manager(), RoomSettings::default()).await;
        let (_first, mut first_rx) = connect(&handle, "Alice", 8).await;
        let (second, _second_rx) = connect(&handle, "ALICE", 8).await;

        match next_message(&mut first_rx).await {
            ws::Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_SUPERSEDED),
            other => panic!("expected close, got {other:?}"),
        }
        let room = handle.room_state().await.unwrap();
        assert!(room.is_connected("Alice"));

        // The old socket's disconnect must not mark the user offline.
        handle.client_disconnected(Uuid::new_v4()).await;
        send(&handle, second, serde_json::json!({"type": "vote", "vote": "3"})).await;
        let room = handle.room_state().await.unwrap();
        assert_eq!(room.votes.get("Alice"), Some(&"3".to_string()));
    }

    #[tokio::test]
    async fn test_superseded_moderator_keeps_role() {
        let handle = create(
            &manager(),
            RoomSettings {
                auto_handover_moderator: true,
                ..RoomSettings::default()
            },
        )
        .await;
        handle.join_user("Bob").await.unwrap();
        let (_alice, _alice_rx) = connect(&handle, "Alice", 8).await;
        let (_bob, _bob_rx) = connect(&handle, "Bob", 8).await;

        handle.disconnect_other_sessions("Alice").await.unwrap();
        let room = handle.room_state().await.unwrap();
        assert_eq!(room.moderator, "Alice");
    }

    #[tokio::test]
    async fn test_moderator_handover_on_disconnect() {
        let handle = create(
            &manager(),
            RoomSettings {
                auto_handover_moderator: true,
                ..RoomSettings::default()
            },
        )
        .await;
        handle.join_user("zoe").await.unwrap();
        handle.join_user("Bob").await.unwrap();
        let (alice, _alice_rx) = connect(&handle, "Alice", 8).await;
        let (_zoe, _zoe_rx) = connect(&handle, "zoe", 8).await;
        let (_bob, mut bob_rx) = connect(&handle, "Bob", 8).await;

        handle.client_disconnected(alice).await;
        let status = next_event_of(&mut bob_rx, "userConnectionStatus").await;
        assert_eq!(status["user"], "Alice");
        assert_eq!(status["connected"], false);
        let moderator = next_event_of(&mut bob_rx, "newModerator").await;
        assert_eq!(moderator["moderator"], "Bob");
    }

    #[tokio::test]
    async fn test_storage_failure_discards_transition() {
        let store = Arc::new(FlakyStore::default());
        let manager = manager_with(store.clone(), Arc::new(LoggingPhaseHook));
        let handle = create(&manager, RoomSettings::default()).await;
        let (alice, mut rx) = connect(&handle, "Alice", 8).await;

        store.fail_writes.store(true, Ordering::SeqCst);
        send(&handle, alice, serde_json::json!({"type": "vote", "vote": "5"})).await;
        let error = next_event(&mut rx).await;
        assert_eq!(error["type"], "error");
        assert!(handle.room_state().await.unwrap().votes.is_empty());

        store.fail_writes.store(false, Ordering::SeqCst);
        send(&handle, alice, serde_json::json!({"type": "vote", "vote": "5"})).await;
        assert_eq!(next_event(&mut rx).await["type"], "vote");
        let stored = store.get_room(&handle.room_key).await.unwrap().unwrap();
        assert_eq!(stored.votes.get("Alice"), Some(&"5".to_string()));
    }

    #[tokio::test]
    async fn test_malformed_message_errors_only_sender() {
        let handle = create(&manager(), RoomSettings::default()).await;
        handle.join_user("Bob").await.unwrap();
        let (alice, mut alice_rx) = connect(&handle, "Alice", 8).await;
        let (_bob, mut bob_rx) = connect(&handle, "Bob", 8).await;
        next_event_of(&mut alice_rx, "userConnectionStatus").await;

        handle
            .forward_client_event(alice, "{\"type\":\"teleport\"}".to_string())
            .await
            .unwrap();
        assert_eq!(next_event(&mut alice_rx).await["type"], "error");
        handle.room_state().await.unwrap();
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_votes_are_all_applied() {
        let handle = create(&manager(), RoomSettings::default()).await;
        let mut sessions = Vec::new();
        for i in 0..10 {
            let name = format!("voter{i}");
            handle.join_user(&name).await.unwrap();
            let (session, rx) = connect(&handle, &name, 256).await;
            sessions.push((session, rx));
        }

        let mut tasks = Vec::new();
        for (i, (session, _)) in sessions.iter().enumerate() {
            let handle = handle.clone();
            let session = *session;
            let vote = ["1", "2", "3", "5", "8"][i % 5];
            tasks.push(tokio::spawn(async move {
                handle
                    .forward_client_event(
                        session,
                        serde_json::json!({"type": "vote", "vote": vote}).to_string(),
                    )
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let room = handle.room_state().await.unwrap();
        assert_eq!(room.votes.len(), 10);
        let stored_votes = (0..10)
            .filter(|i| room.votes.contains_key(&format!("voter{i}")))
            .count();
        assert_eq!(stored_votes, 10);
    }

    #[tokio::test]
    async fn test_saturated_session_is_pruned() {
        let handle = create(&manager(), RoomSettings::default()).await;
        handle.join_user("Bob").await.unwrap();
        let (alice, mut alice_rx) = connect(&handle, "Alice", 16).await;
        // Capacity 1 and never drained: the initialize snapshot fills it.
        let (bob_tx, _bob_rx) = mpsc::channel(1);
        handle
            .client_connected(Uuid::new_v4(), "Bob".to_string(), bob_tx)
            .await
            .unwrap();
        next_event_of(&mut alice_rx, "userConnectionStatus").await;

        send(&handle, alice, serde_json::json!({"type": "vote", "vote": "8"})).await;
        next_event_of(&mut alice_rx, "vote").await;
        let status = next_event_of(&mut alice_rx, "userConnectionStatus").await;
        assert_eq!(status["user"], "Bob");
        assert_eq!(status["connected"], false);
        assert!(!handle.room_state().await.unwrap().is_connected("Bob"));
    }

    #[tokio::test]
    async fn test_spymasters_see_full_board() {
        let handle = create(&manager(), RoomSettings::default()).await;
        handle.join_user("Bob").await.unwrap();
        handle.join_user("Carol").await.unwrap();
        handle.join_user("Dave").await.unwrap();
        let (alice, mut alice_rx) = connect(&handle, "Alice", 32).await;
        let (_bob, mut bob_rx) = connect(&handle, "Bob", 32).await;
        let (_carol, mut carol_rx) = connect(&handle, "Carol", 32).await;
        let (_dave, _dave_rx) = connect(&handle, "Dave", 32).await;

        send(&handle, alice, serde_json::json!({"type": "startGame"})).await;

        let full = next_event_of(&mut alice_rx, "miniGameState").await;
        let assignments = full["state"]["assignments"].as_array().unwrap();
        assert!(assignments.iter().all(|a| !a.is_null()));

        let also_full = next_event_of(&mut bob_rx, "miniGameState").await;
        assert!(also_full["state"]["assignments"].as_array().unwrap().iter().all(|a| !a.is_null()));

        let redacted = next_event_of(&mut carol_rx, "miniGameState").await;
        let assignments = redacted["state"]["assignments"].as_array().unwrap();
        assert_eq!(assignments.len(), 25);
        assert!(assignments.iter().all(Value::is_null));
    }

    #[tokio::test]
    async fn test_join_announces_new_user() {
        let handle = create(&manager(), RoomSettings::default()).await;
        let (_alice, mut rx) = connect(&handle, "Alice", 8).await;

        assert_eq!(handle.join_user(" Dana ").await.unwrap(), "Dana");
        assert_eq!(next_event(&mut rx).await["user"], "Dana");
        assert_eq!(handle.join_user("dana").await.unwrap(), "Dana");
        assert!(matches!(
            handle.join_user("").await,
            Err(RoomError::InvalidUserName)
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_session_is_refused() {
        let handle = create(&manager(), RoomSettings::default()).await;
        let (tx, mut rx) = mpsc::channel(8);
        handle
            .client_connected(Uuid::new_v4(), "mallory".to_string(), tx)
            .await
            .unwrap();
        assert_eq!(next_event(&mut rx).await["type"], "error");
        match next_message(&mut rx).await {
            ws::Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_INVALID_SESSION),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retiring_actor_refuses_queued_sessions() {
        let (manager_tx, _manager_rx) = mpsc::channel(8);
        let (sender, receiver) = mpsc::channel(8);
        let mut actor = RoomActor::new(
            receiver,
            Uuid::new_v4(),
            Room::new("ROOM77".into(), "Alice", RoomSettings::default(), 0),
            RoomManagerHandle { sender: manager_tx },
            Arc::new(InMemoryRoomStore::new()),
            Arc::new(LoggingPhaseHook),
        );

        let (client_tx, mut client_rx) = mpsc::channel(8);
        sender
            .send(RoomActorMessage::ClientConnected {
                session_id: Uuid::new_v4(),
                user_name: "Alice".to_string(),
                client_tx,
            })
            .await
            .unwrap();
        let (respond_to, resolved) = oneshot::channel();
        sender
            .send(RoomActorMessage::ResolveUser {
                user_name: "alice".to_string(),
                respond_to,
            })
            .await
            .unwrap();

        actor.drain_on_retire();

        assert_eq!(next_event(&mut client_rx).await["type"], "error");
        match next_message(&mut client_rx).await {
            ws::Message::Close(Some(frame)) => assert_eq!(frame.code, CLOSE_INTERNAL_ERROR),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(resolved.await.unwrap(), Some("Alice".to_string()));
        assert!(actor.sessions.is_empty());
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_idle_room_actor_is_reloaded_from_storage() {
        let store: Arc<dyn RoomStore> = Arc::new(InMemoryRoomStore::new());
        let manager = RoomManagerHandle::spawn(
            8,
            store,
            RoomsConfig {
                idle_timeout_seconds: 0,
                channel_buffer_size: 8,
            },
            Arc::new(LoggingPhaseHook),
        );
        let details = manager
            .create_room("Alice".to_string(), RoomSettings::default())
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert!(details.handle.is_closed());

        let reloaded = manager
            .get_room_handle(&details.room_key)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(reloaded.instance_id, details.handle.instance_id);
        assert_eq!(reloaded.room_key, details.room_key);
    }
}
