//! Ticket queue backing successive estimation rounds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::room::settings::ExternalService;
use crate::room::{Room, StructuredVote};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

/// A vote recorded against a ticket when its round closed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TicketVote {
    pub user_name: String,
    pub vote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_vote: Option<StructuredVote>,
    pub voted_at: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TicketQueueItem {
    pub id: u64,
    pub ticket_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TicketStatus,
    pub ordinal: u32,
    pub external_service: ExternalService,
    #[serde(default)]
    pub votes: Vec<TicketVote>,
    pub created_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewTicket {
    pub ticket_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub ordinal: Option<u32>,
    pub external_service: Option<ExternalService>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct TicketUpdate {
    pub ticket_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TicketStatus>,
    pub ordinal: Option<u32>,
}

#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("Ticket id '{0}' already exists")]
    DuplicateTicketId(String),
    #[error("Ticket id must not be empty")]
    EmptyTicketId,
    #[error("Ticket {0} not found")]
    NotFound(u64),
    #[error("Ticket {0} is the active ticket")]
    ActiveTicket(u64),
    #[error("No ticket is in progress")]
    NoActiveTicket,
    #[error("No ticket number or ordinal left to allocate")]
    QueueExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NextTicketOutcome {
    pub completed: Option<TicketQueueItem>,
    pub current: Option<TicketQueueItem>,
    pub auto_created: bool,
    pub timer_reanchored: bool,
}

/// Closes the active ticket, starts a fresh round and moves the queue on.
pub fn next_ticket(room: &mut Room, now_ms: i64) -> NextTicketOutcome {
    let completed = finish_current(room, now_ms);
    let timer_reanchored = room.start_new_round(now_ms);

    let head = room
        .ticket_queue
        .iter()
        .filter(|t| t.status == TicketStatus::Pending)
        .min_by_key(|t| (t.ordinal, t.id))
        .map(|t| t.id);

    let mut auto_created = false;
    let current_id = match head {
        Some(id) => Some(id),
        None if room.settings.external_service == ExternalService::None => {
            let ticket_id = next_sequential_ticket_id(&room.settings.ticket_prefix, &room.ticket_queue);
            let ordinal = next_ordinal(&room.ticket_queue);
            let (Some(ticket_id), Some(ordinal)) = (ticket_id, ordinal) else {
                tracing::warn!(room.key = %room.key, "Cannot auto-create ticket: numbering exhausted");
                return NextTicketOutcome {
                    completed,
                    current: None,
                    auto_created: false,
                    timer_reanchored,
                };
            };
            let item = TicketQueueItem {
                id: next_item_id(&room.ticket_queue),
                ticket_id,
                title: None,
                description: None,
                status: TicketStatus::Pending,
                ordinal,
                external_service: ExternalService::None,
                votes: Vec::new(),
                created_at: now_ms,
                completed_at: None,
            };
            let id = item.id;
            room.ticket_queue.push(item);
            auto_created = true;
            Some(id)
        }
        None => None,
    };

    if let Some(id) = current_id
        && let Some(item) = room.ticket_queue.iter_mut().find(|t| t.id == id)
    {
        item.status = TicketStatus::InProgress;
    }
    room.current_ticket_id = current_id;

    NextTicketOutcome {
        completed,
        current: room.current_ticket().cloned(),
        auto_created,
        timer_reanchored,
    }
}

/// Completes the active ticket without promoting the next one.
pub fn complete_current_ticket(room: &mut Room, now_ms: i64) -> Result<TicketQueueItem, QueueError> {
    finish_current(room, now_ms).ok_or(QueueError::NoActiveTicket)
}

pub fn add_ticket(
    room: &mut Room,
    new_ticket: NewTicket,
    now_ms: i64,
) -> Result<TicketQueueItem, QueueError> {
    let ticket_id = match new_ticket.ticket_id {
        Some(raw) => {
            let trimmed = raw.trim().to_string();
            if trimmed.is_empty() {
                return Err(QueueError::EmptyTicketId);
            }
            trimmed
        }
        None => next_sequential_ticket_id(&room.settings.ticket_prefix, &room.ticket_queue)
            .ok_or(QueueError::QueueExhausted)?,
    };
    if ticket_id_taken(&room.ticket_queue, &ticket_id, None) {
        return Err(QueueError::DuplicateTicketId(ticket_id));
    }

    let default_ordinal = next_ordinal(&room.ticket_queue).ok_or(QueueError::QueueExhausted)?;
    let ordinal = new_ticket.ordinal.unwrap_or(default_ordinal);
    if let Some(colliding) = room.ticket_queue.iter_mut().find(|t| t.ordinal == ordinal) {
        colliding.ordinal = default_ordinal;
    }

    let item = TicketQueueItem {
        id: next_item_id(&room.ticket_queue),
        ticket_id,
        title: non_empty(new_ticket.title),
        description: non_empty(new_ticket.description),
        status: TicketStatus::Pending,
        ordinal,
        external_service: new_ticket
            .external_service
            .unwrap_or(room.settings.external_service),
        votes: Vec::new(),
        created_at: now_ms,
        completed_at: None,
    };
    room.ticket_queue.push(item.clone());
    Ok(item)
}

pub fn update_ticket(
    room: &mut Room,
    id: u64,
    update: TicketUpdate,
    now_ms: i64,
) -> Result<TicketQueueItem, QueueError> {
    let index = room
        .ticket_queue
        .iter()
        .position(|t| t.id == id)
        .ok_or(QueueError::NotFound(id))?;

    let new_ticket_id = match update.ticket_id {
        Some(raw) => {
            let trimmed = raw.trim().to_string();
            if trimmed.is_empty() {
                return Err(QueueError::EmptyTicketId);
            }
            if ticket_id_taken(&room.ticket_queue, &trimmed, Some(id)) {
                return Err(QueueError::DuplicateTicketId(trimmed));
            }
            Some(trimmed)
        }
        None => None,
    };

    if let Some(ordinal) = update.ordinal {
        let vacated = room.ticket_queue[index].ordinal;
        if ordinal != vacated {
            if let Some(colliding) = room
                .ticket_queue
                .iter_mut()
                .find(|t| t.id != id && t.ordinal == ordinal)
            {
                colliding.ordinal = vacated;
            }
            room.ticket_queue[index].ordinal = ordinal;
        }
    }

    if let Some(status) = update.status {
        let is_current = room.current_ticket_id == Some(id);
        match status {
            TicketStatus::InProgress if !is_current => {
                if let Some(previous) = room.current_ticket_id
                    && let Some(item) = room.ticket_queue.iter_mut().find(|t| t.id == previous)
                {
                    item.status = TicketStatus::Pending;
                }
                room.current_ticket_id = Some(id);
            }
            TicketStatus::InProgress => {}
            _ if is_current => room.current_ticket_id = None,
            _ => {}
        }
        let item = &mut room.ticket_queue[index];
        item.status = status;
        item.completed_at = (status == TicketStatus::Completed).then_some(now_ms);
    }

    let item = &mut room.ticket_queue[index];
    if let Some(ticket_id) = new_ticket_id {
        item.ticket_id = ticket_id;
    }
    if update.title.is_some() {
        item.title = non_empty(update.title);
    }
    if update.description.is_some() {
        item.description = non_empty(update.description);
    }
    Ok(item.clone())
}

pub fn delete_ticket(room: &mut Room, id: u64) -> Result<TicketQueueItem, QueueError> {
    if room.current_ticket_id == Some(id) {
        return Err(QueueError::ActiveTicket(id));
    }
    let index = room
        .ticket_queue
        .iter()
        .position(|t| t.id == id)
        .ok_or(QueueError::NotFound(id))?;
    Ok(room.ticket_queue.remove(index))
}

/// `PREFIX-NNN` one past the highest existing number for this prefix, or
/// `None` once the number space is used up.
pub fn next_sequential_ticket_id(prefix: &str, items: &[TicketQueueItem]) -> Option<String> {
    let marker = format!("{}-", prefix.to_uppercase());
    let highest = items
        .iter()
        .filter_map(|t| {
            let upper = t.ticket_id.to_uppercase();
            upper
                .strip_prefix(&marker)
                .and_then(|digits| digits.parse::<u32>().ok())
        })
        .max()
        .unwrap_or(0);
    highest
        .checked_add(1)
        .map(|next| format!("{}{:03}", marker, next))
}

fn finish_current(room: &mut Room, now_ms: i64) -> Option<TicketQueueItem> {
    let current_id = room.current_ticket_id.take()?;
    let mut voters: Vec<&String> = room.votes.keys().collect();
    voters.sort();
    let logged: Vec<TicketVote> = voters
        .into_iter()
        .map(|user| TicketVote {
            user_name: user.clone(),
            vote: room.votes[user].clone(),
            structured_vote: room.structured_votes.get(user).cloned(),
            voted_at: now_ms,
        })
        .collect();

    let item = room.ticket_queue.iter_mut().find(|t| t.id == current_id)?;
    item.votes.extend(logged);
    item.status = TicketStatus::Completed;
    item.completed_at = Some(now_ms);
    Some(item.clone())
}

fn ticket_id_taken(items: &[TicketQueueItem], ticket_id: &str, except: Option<u64>) -> bool {
    items
        .iter()
        .any(|t| Some(t.id) != except && t.ticket_id.eq_ignore_ascii_case(ticket_id))
}

fn next_item_id(items: &[TicketQueueItem]) -> u64 {
    items.iter().map(|t| t.id).max().unwrap_or(0) + 1
}

fn next_ordinal(items: &[TicketQueueItem]) -> Option<u32> {
    items.iter().map(|t| t.ordinal).max().unwrap_or(0).checked_add(1)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
