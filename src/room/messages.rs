use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::game_logic::word_game::WordGameView;
use crate::room::judge::JudgeResult;
use crate::room::queue::{NewTicket, TicketQueueItem, TicketUpdate};
use crate::room::settings::{RoomSettings, SettingsPatch};
use crate::room::timer::{TimerConfig, TimerState};
use crate::room::{Room, StructuredVote, VoteValue};

/// Messages a room client sends over its WebSocket.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Vote { vote: VoteValue },
    ShowVotes,
    ResetVotes,
    UpdateSettings { settings: SettingsPatch },
    NextTicket,
    AddTicket { ticket: NewTicket },
    UpdateTicket { id: u64, updates: TicketUpdate },
    DeleteTicket { id: u64 },
    CompleteTicket,
    StartTimer,
    PauseTimer,
    ResetTimer,
    ConfigureTimer { config: TimerConfig },
    Ping,
    StartGame,
    GiveClue { word: String, count: u32 },
    Reveal { index: usize },
    Pass,
    EndGame,
}

/// Messages the server pushes to room clients.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Initialize {
        room: RoomSnapshot,
    },
    UserJoined {
        user: String,
    },
    Vote {
        user: String,
        vote: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        structured_vote: Option<StructuredVote>,
    },
    ShowVotes {
        show_votes: bool,
    },
    ResetVotes,
    SettingsUpdated {
        settings: RoomSettings,
    },
    JudgeScoreUpdated {
        judge_score: Option<f64>,
        judge_metadata: Option<JudgeResult>,
    },
    TimerStarted {
        timer_state: TimerState,
    },
    TimerPaused {
        timer_state: TimerState,
    },
    TimerReset {
        timer_state: TimerState,
    },
    TimerUpdated {
        timer_state: TimerState,
    },
    NextTicket {
        ticket: Option<TicketQueueItem>,
        queue: Vec<TicketQueueItem>,
    },
    TicketAdded {
        ticket: TicketQueueItem,
        queue: Vec<TicketQueueItem>,
    },
    TicketUpdated {
        ticket: TicketQueueItem,
        queue: Vec<TicketQueueItem>,
    },
    TicketDeleted {
        id: u64,
        queue: Vec<TicketQueueItem>,
    },
    TicketCompleted {
        ticket: TicketQueueItem,
        queue: Vec<TicketQueueItem>,
    },
    UserConnectionStatus {
        user: String,
        connected: bool,
    },
    NewModerator {
        moderator: String,
    },
    MiniGameState {
        state: Option<WordGameView>,
    },
    Pong,
    Error {
        error: String,
    },
}

impl ServerEvent {
    pub fn to_ws_text(&self) -> Result<axum::extract::ws::Message, serde_json::Error> {
        serde_json::to_string(self)
            .map(|json_string| axum::extract::ws::Message::Text(json_string.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            error: message.into(),
        }
    }

    pub fn judge_of(room: &Room) -> Self {
        ServerEvent::JudgeScoreUpdated {
            judge_score: room.judge_score,
            judge_metadata: room.judge_metadata.clone(),
        }
    }
}

/// Room state as sent to one particular client.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub key: String,
    pub users: Vec<String>,
    pub connected_users: HashMap<String, bool>,
    pub moderator: String,
    pub votes: HashMap<String, String>,
    pub structured_votes: HashMap<String, StructuredVote>,
    pub show_votes: bool,
    pub settings: RoomSettings,
    pub judge_score: Option<f64>,
    pub judge_metadata: Option<JudgeResult>,
    pub timer_state: Option<TimerState>,
    pub current_ticket: Option<TicketQueueItem>,
    pub ticket_queue: Vec<TicketQueueItem>,
    pub mini_game_state: Option<WordGameView>,
}

impl RoomSnapshot {
    pub fn for_user(room: &Room, user: &str) -> Self {
        RoomSnapshot {
            key: room.key.clone(),
            users: room.users.clone(),
            connected_users: room.connected_users.clone(),
            moderator: room.moderator.clone(),
            votes: room.votes.clone(),
            structured_votes: room.structured_votes.clone(),
            show_votes: room.show_votes,
            settings: room.settings.clone(),
            judge_score: room.judge_score,
            judge_metadata: room.judge_metadata.clone(),
            timer_state: room.timer_state.clone(),
            current_ticket: room.current_ticket().cloned(),
            ticket_queue: room.ticket_queue.clone(),
            mini_game_state: room.mini_game_state.as_ref().map(|g| g.view_for(user)),
        }
    }
}

pub fn client_message_from_ws_text(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}
