use crate::auth::SessionAuthenticator;
use crate::rooms::RoomManagerHandle;

#[derive(Clone, Debug)]
pub struct AppState {
    pub room_manager: RoomManagerHandle,
    pub authenticator: SessionAuthenticator,
}
