use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::room::{Room, canonical_name, canonical_room_key};

/// A session token and the epoch millisecond at which it stops being valid.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokenRecord {
    pub token: String,
    pub expires_at: i64,
}

/// Durable home of room aggregates and session tokens. Rooms are written
/// whole after every accepted transition.
#[async_trait]
pub trait RoomStore: Send + Sync + std::fmt::Debug {
    async fn get_room(&self, room_key: &str) -> Result<Option<Room>, StorageError>;

    async fn put_room(&self, room: &Room) -> Result<(), StorageError>;

    async fn put_session_token(
        &self,
        room_key: &str,
        user_name: &str,
        record: SessionTokenRecord,
    ) -> Result<(), StorageError>;

    async fn get_session_token(
        &self,
        room_key: &str,
        user_name: &str,
    ) -> Result<Option<SessionTokenRecord>, StorageError>;
}

/// Process-local store for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryRoomStore {
    rooms: RwLock<HashMap<String, Room>>,
    tokens: RwLock<HashMap<(String, String), SessionTokenRecord>>,
}

impl InMemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn token_key(room_key: &str, user_name: &str) -> (String, String) {
    (canonical_room_key(room_key), canonical_name(user_name))
}

#[async_trait]
impl RoomStore for InMemoryRoomStore {
    async fn get_room(&self, room_key: &str) -> Result<Option<Room>, StorageError> {
        Ok(self
            .rooms
            .read()
            .await
            .get(&canonical_room_key(room_key))
            .cloned())
    }

    async fn put_room(&self, room: &Room) -> Result<(), StorageError> {
        self.rooms
            .write()
            .await
            .insert(canonical_room_key(&room.key), room.clone());
        Ok(())
    }

    async fn put_session_token(
        &self,
        room_key: &str,
        user_name: &str,
        record: SessionTokenRecord,
    ) -> Result<(), StorageError> {
        self.tokens
            .write()
            .await
            .insert(token_key(room_key, user_name), record);
        Ok(())
    }

    async fn get_session_token(
        &self,
        room_key: &str,
        user_name: &str,
    ) -> Result<Option<SessionTokenRecord>, StorageError> {
        Ok(self
            .tokens
            .read()
            .await
            .get(&token_key(room_key, user_name))
            .cloned())
    }
}
