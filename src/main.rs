use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod config;
mod error;
mod game_logic;
mod room;
mod rooms;
mod state;
mod storage;
mod web;

use crate::auth::SessionAuthenticator;
use crate::config::load_settings;
use crate::error::Result as AppResult;
use crate::rooms::{LoggingPhaseHook, RoomManagerHandle};
use crate::state::AppState;
use crate::storage::{InMemoryRoomStore, RoomStore};
use crate::web::run_server;

const MANAGER_CHANNEL_SIZE: usize = 32;

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=info,tower_http=debug", env!("CARGO_PKG_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app_settings = load_settings()?;
    tracing::info!(
        server.port = app_settings.server.port,
        session.token_ttl_hours = app_settings.session.token_ttl_hours,
        rooms.idle_timeout_seconds = app_settings.rooms.idle_timeout_seconds,
        "Configuration loaded"
    );

    let store: Arc<dyn RoomStore> = Arc::new(InMemoryRoomStore::new());
    let authenticator =
        SessionAuthenticator::new(Arc::clone(&store), app_settings.session.token_ttl_hours);
    let room_manager = RoomManagerHandle::spawn(
        MANAGER_CHANNEL_SIZE,
        store,
        app_settings.rooms.clone(),
        Arc::new(LoggingPhaseHook),
    );

    let app_state = AppState {
        room_manager,
        authenticator,
    };

    run_server(app_state, app_settings.server).await?;

    Ok(())
}
