use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage::{RoomStore, SessionTokenRecord};

/// One year. Longer lifetimes are clamped to this.
pub const MAX_TOKEN_TTL_HOURS: i64 = 24 * 365;

/// Issues and checks per-user session tokens. Each user holds a single
/// token slot per room, so issuing a token invalidates the previous one.
#[derive(Clone, Debug)]
pub struct SessionAuthenticator {
    store: Arc<dyn RoomStore>,
    ttl: Duration,
}

impl SessionAuthenticator {
    pub fn new(store: Arc<dyn RoomStore>, ttl_hours: i64) -> Self {
        Self {
            store,
            ttl: Duration::hours(ttl_hours.clamp(1, MAX_TOKEN_TTL_HOURS)),
        }
    }

    #[tracing::instrument(skip(self), fields(room.key = %room_key, user.name = %user_name))]
    pub async fn issue_session_token(
        &self,
        room_key: &str,
        user_name: &str,
    ) -> Result<String, StorageError> {
        let token = Uuid::new_v4().simple().to_string();
        let record = SessionTokenRecord {
            token: token.clone(),
            expires_at: (Utc::now() + self.ttl).timestamp_millis(),
        };
        self.store
            .put_session_token(room_key, user_name, record)
            .await?;
        tracing::debug!("Issued session token");
        Ok(token)
    }

    pub async fn validate_session_token(
        &self,
        room_key: &str,
        user_name: &str,
        token: &str,
    ) -> Result<bool, StorageError> {
        let Some(record) = self.store.get_session_token(room_key, user_name).await? else {
            return Ok(false);
        };
        if record.token != token {
            return Ok(false);
        }
        if record.expires_at <= Utc::now().timestamp_millis() {
            tracing::debug!(room.key = %room_key, user.name = %user_name, "Session token expired");
            return Ok(false);
        }
        Ok(true)
    }
}
