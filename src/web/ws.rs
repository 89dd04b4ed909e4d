use axum::extract::{
    Query, State,
    ws::{self, WebSocket, WebSocketUpgrade},
};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::room::messages::ServerEvent;
use crate::rooms::{CLOSE_INTERNAL_ERROR, CLOSE_INVALID_SESSION, RoomActorHandle, close_message};
use crate::state::AppState;

const CLIENT_CHANNEL_SIZE: usize = 32;

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectParams {
    pub room_key: String,
    pub user_name: String,
    pub session_token: String,
}

pub async fn ws_handler(
    ws_upgrade: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    tracing::info!(room.key = %params.room_key, user.name = %params.user_name, "WebSocket: Connection attempt");
    ws_upgrade.on_upgrade(move |socket| handle_socket(socket, app_state, params))
}

#[derive(Debug, PartialEq)]
enum Rejection {
    InvalidSession,
    Unavailable,
}

async fn authenticate(
    app_state: &AppState,
    params: &ConnectParams,
) -> Result<(RoomActorHandle, String), Rejection> {
    let handle = match app_state.room_manager.get_room_handle(&params.room_key).await {
        Ok(Some(handle)) => handle,
        Ok(None) => return Err(Rejection::InvalidSession),
        Err(e) => {
            tracing::error!(room.key = %params.room_key, error = %e, "Failed to load room");
            return Err(Rejection::Unavailable);
        }
    };
    let user_name = match handle.resolve_user(&params.user_name).await {
        Ok(Some(user_name)) => user_name,
        Ok(None) => return Err(Rejection::InvalidSession),
        Err(e) => {
            tracing::error!(room.key = %params.room_key, error = %e, "Failed to resolve user");
            return Err(Rejection::Unavailable);
        }
    };
    match app_state
        .authenticator
        .validate_session_token(&handle.room_key, &user_name, &params.session_token)
        .await
    {
        Ok(true) => Ok((handle, user_name)),
        Ok(false) => Err(Rejection::InvalidSession),
        Err(e) => {
            tracing::error!(room.key = %params.room_key, error = %e, "Failed to read session token");
            Err(Rejection::Unavailable)
        }
    }
}

/// The `error` event followed by the close frame for a refused session.
fn rejection_frames(rejection: Rejection) -> Vec<ws::Message> {
    let (error, code, reason) = match rejection {
        Rejection::InvalidSession => (
            "Invalid session token",
            CLOSE_INVALID_SESSION,
            "Invalid session token",
        ),
        Rejection::Unavailable => (
            "Room data is unavailable",
            CLOSE_INTERNAL_ERROR,
            "Room data unavailable",
        ),
    };
    let mut frames = Vec::with_capacity(2);
    match ServerEvent::error(error).to_ws_text() {
        Ok(ws_msg) => frames.push(ws_msg),
        Err(e) => tracing::error!(error = %e, "Failed to serialize rejection"),
    }
    frames.push(close_message(code, reason));
    frames
}

async fn reject(ws_sender: &mut SplitSink<WebSocket, ws::Message>, rejection: Rejection) {
    for frame in rejection_frames(rejection) {
        if ws_sender.send(frame).await.is_err() {
            break;
        }
    }
    let _ = ws_sender.close().await;
}

pub async fn handle_socket(socket: WebSocket, app_state: AppState, params: ConnectParams) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (room_handle, user_name) = match authenticate(&app_state, &params).await {
        Ok(authenticated) => authenticated,
        Err(rejection) => {
            tracing::warn!(
                room.key = %params.room_key,
                user.name = %params.user_name,
                "WebSocket: Rejected session"
            );
            reject(&mut ws_sender, rejection).await;
            return;
        }
    };

    let session_id = Uuid::new_v4();
    let room_key = room_handle.room_key.clone();
    let (actor_to_client_tx, mut actor_to_client_rx) =
        mpsc::channel::<ws::Message>(CLIENT_CHANNEL_SIZE);

    if let Err(e) = room_handle
        .client_connected(session_id, user_name.clone(), actor_to_client_tx)
        .await
    {
        tracing::error!(room.key = %room_key, error = %e, "Failed to register session");
        reject(&mut ws_sender, Rejection::Unavailable).await;
        return;
    }
    tracing::info!(
        room.key = %room_key,
        session.id = %session_id,
        user.name = %user_name,
        "WebSocket: Session active"
    );

    let send_room_key = room_key.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(message_to_send) = actor_to_client_rx.recv().await {
            let is_close = matches!(message_to_send, ws::Message::Close(_));
            if ws_sender.send(message_to_send).await.is_err() {
                tracing::info!(
                    room.key = %send_room_key,
                    session.id = %session_id,
                    "WS send error, client likely disconnected"
                );
                break;
            }
            if is_close {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let recv_handle = room_handle.clone();
    let recv_room_key = room_key.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            match ws_receiver.next().await {
                Some(Ok(ws::Message::Text(text_msg))) => {
                    if let Err(e) = recv_handle
                        .forward_client_event(session_id, text_msg.to_string())
                        .await
                    {
                        tracing::error!(
                            room.key = %recv_room_key,
                            session.id = %session_id,
                            error = %e,
                            "Error sending event to room actor"
                        );
                        break;
                    }
                }
                Some(Ok(ws::Message::Binary(_))) => {
                    tracing::debug!(session.id = %session_id, "Binary message ignored");
                }
                Some(Ok(ws::Message::Ping(_))) | Some(Ok(ws::Message::Pong(_))) => {}
                Some(Ok(ws::Message::Close(_))) => {
                    tracing::info!(
                        room.key = %recv_room_key,
                        session.id = %session_id,
                        "WebSocket closed by client"
                    );
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        room.key = %recv_room_key,
                        session.id = %session_id,
                        error = %e,
                        "WebSocket error (recv)"
                    );
                    break;
                }
                None => break,
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    room_handle.client_disconnected(session_id).await;
    tracing::info!(
        room.key = %room_key,
        session.id = %session_id,
        user.name = %user_name,
        "WebSocket: Session closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionAuthenticator;
    use crate::config::RoomsConfig;
    use crate::error::StorageError;
    use crate::room::Room;
    use crate::room::settings::RoomSettings;
    use crate::rooms::{LoggingPhaseHook, RoomManagerHandle};
    use crate::storage::{InMemoryRoomStore, RoomStore, SessionTokenRecord};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct TokenOutageStore {
        inner: InMemoryRoomStore,
        tokens_down: AtomicBool,
    }

    #[async_trait]
    impl RoomStore for TokenOutageStore {
        async fn get_room(&self, room_key: &str) -> Result<Option<Room>, StorageError> {
            self.inner.get_room(room_key).await
        }

        async fn put_room(&self, room: &Room) -> Result<(), StorageError> {
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
            if self.tokens_down.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("token table offline".into()));
            }
            self.inner.get_session_token(room_key, user_name).await
        }
    }

    struct Fixture {
        state: AppState,
        store: Arc<TokenOutageStore>,
        room_key: String,
        token: String,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(TokenOutageStore::default());
        let shared: Arc<dyn RoomStore> = store.clone();
        let state = AppState {
            room_manager: RoomManagerHandle::spawn(
                8,
                Arc::clone(&shared),
                RoomsConfig::default(),
                Arc::new(LoggingPhaseHook),
            ),
            authenticator: SessionAuthenticator::new(shared, 6),
        };
        let details = state
            .room_manager
            .create_room("Alice".to_string(), RoomSettings::default())
            .await
            .unwrap();
        let token = state
            .authenticator
            .issue_session_token(&details.room_key, "Alice")
            .await
            .unwrap();
        Fixture {
            state,
            store,
            room_key: details.room_key,
            token,
        }
    }

    fn params(room_key: &str, user_name: &str, token: &str) -> ConnectParams {
        ConnectParams {
            room_key: room_key.to_string(),
            user_name: user_name.to_string(),
            session_token: token.to_string(),
        }
    }

    async fn rejection(state: &AppState, params: &ConnectParams) -> Rejection {
        match authenticate(state, params).await {
            Ok(_) => panic!("expected the session to be refused"),
            Err(rejection) => rejection,
        }
    }

    #[tokio::test]
    async fn test_valid_token_resolves_stored_casing() {
        let fx = fixture().await;
        let (handle, user_name) = authenticate(
            &fx.state,
            &params(&fx.room_key.to_lowercase(), " alice ", &fx.token),
        )
        .await
        .unwrap_or_else(|_| panic!("valid session refused"));
        assert_eq!(handle.room_key, fx.room_key);
        assert_eq!(user_name, "Alice");
    }

    #[tokio::test]
    async fn test_wrong_token_is_invalid_session() {
        let fx = fixture().await;
        let refused = rejection(&fx.state, &params(&fx.room_key, "Alice", "not-the-token")).await;
        assert_eq!(refused, Rejection::InvalidSession);

        let missing = rejection(&fx.state, &ConnectParams::default()).await;
        assert_eq!(missing, Rejection::InvalidSession);
    }

    #[tokio::test]
    async fn test_expired_token_is_invalid_session() {
        let fx = fixture().await;
        fx.store
            .put_session_token(
                &fx.room_key,
                "Alice",
                SessionTokenRecord {
                    token: "stale".into(),
                    expires_at: chrono::Utc::now().timestamp_millis() - 1,
                },
            )
            .await
            .unwrap();
        let refused = rejection(&fx.state, &params(&fx.room_key, "Alice", "stale")).await;
        assert_eq!(refused, Rejection::InvalidSession);
    }

    #[tokio::test]
    async fn test_unknown_room_or_user_is_invalid_session() {
        let fx = fixture().await;
        let no_room = rejection(&fx.state, &params("ZZZ999", "Alice", &fx.token)).await;
        assert_eq!(no_room, Rejection::InvalidSession);

        let no_user = rejection(&fx.state, &params(&fx.room_key, "mallory", &fx.token)).await;
        assert_eq!(no_user, Rejection::InvalidSession);
    }

    #[tokio::test]
    async fn test_storage_outage_is_unavailable() {
        let fx = fixture().await;
        fx.store.tokens_down.store(true, Ordering::SeqCst);
        let refused = rejection(&fx.state, &params(&fx.room_key, "Alice", &fx.token)).await;
        assert_eq!(refused, Rejection::Unavailable);
    }

    fn close_code(frame: &ws::Message) -> u16 {
        match frame {
            ws::Message::Close(Some(close)) => close.code,
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    fn error_text(frame: &ws::Message) -> String {
        match frame {
            ws::Message::Text(text) => {
                let event: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(event["type"], "error");
                event["error"].as_str().unwrap().to_string()
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn test_rejection_sends_error_then_close() {
        let frames = rejection_frames(Rejection::InvalidSession);
        assert_eq!(frames.len(), 2);
        assert_eq!(error_text(&frames[0]), "Invalid session token");
        assert_eq!(close_code(&frames[1]), CLOSE_INVALID_SESSION);

        let frames = rejection_frames(Rejection::Unavailable);
        assert_eq!(frames.len(), 2);
        assert_eq!(error_text(&frames[0]), "Room data is unavailable");
        assert_eq!(close_code(&frames[1]), CLOSE_INTERNAL_ERROR);
    }
}
