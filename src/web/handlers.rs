use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};

use super::error::{Result as WebResult, WebError};
use crate::room::settings::{RoomSettings, SettingsPatch};
use crate::rooms::RoomActorHandle;
use crate::state::AppState;

#[derive(Deserialize, Debug, Default)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default)]
    pub settings: Option<SettingsPatch>,
}

#[derive(Deserialize, Debug, Default)]
pub struct JoinRoomRequest {
    pub name: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomSessionResponse {
    pub room_key: String,
    pub user_name: String,
    pub session_token: String,
}

async fn room_handle(app_state: &AppState, room_key: &str) -> WebResult<RoomActorHandle> {
    app_state
        .room_manager
        .get_room_handle(room_key)
        .await?
        .ok_or_else(|| WebError::RoomNotFound(room_key.to_string()))
}

pub async fn create_room_handler(
    State(app_state): State<AppState>,
    Json(payload): Json<CreateRoomRequest>,
) -> WebResult<Json<RoomSessionResponse>> {
    tracing::info!(user.name = %payload.name, "HTTP: Received create_room request");

    let settings = payload
        .settings
        .unwrap_or_default()
        .apply(&RoomSettings::default());
    let details = app_state
        .room_manager
        .create_room(payload.name, settings)
        .await?;
    let session_token = app_state
        .authenticator
        .issue_session_token(&details.room_key, &details.moderator)
        .await?;

    Ok(Json(RoomSessionResponse {
        room_key: details.room_key,
        user_name: details.moderator,
        session_token,
    }))
}

pub async fn join_room_handler(
    State(app_state): State<AppState>,
    Path(room_key): Path<String>,
    Json(payload): Json<JoinRoomRequest>,
) -> WebResult<Json<RoomSessionResponse>> {
    tracing::info!(room.key = %room_key, user.name = %payload.name, "HTTP: Received join_room request");

    let handle = room_handle(&app_state, &room_key).await?;
    let user_name = handle.join_user(&payload.name).await?;
    let session_token = app_state
        .authenticator
        .issue_session_token(&handle.room_key, &user_name)
        .await?;
    // The old token is dead now, so its sockets go too.
    handle.disconnect_other_sessions(&user_name).await?;

    Ok(Json(RoomSessionResponse {
        room_key: handle.room_key.clone(),
        user_name,
        session_token,
    }))
}

pub async fn room_settings_handler(
    State(app_state): State<AppState>,
    Path(room_key): Path<String>,
) -> WebResult<Json<RoomSettings>> {
    let handle = room_handle(&app_state, &room_key).await?;
    let room = handle.room_state().await?;
    Ok(Json(room.settings))
}
