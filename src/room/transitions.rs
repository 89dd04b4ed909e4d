//! Room transitions. Each operation mutates a working copy of the room and
//! returns the effects to deliver once that copy has been persisted. An
//! empty effect list means the request was rejected or changed nothing.

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::game_logic::word_game::{WORD_BANK, WordGameState};
use crate::room::messages::{ClientMessage, ServerEvent};
use crate::room::queue::{self, NewTicket, TicketUpdate};
use crate::room::scoring::{is_criterion_complete, resolve_structured_vote};
use crate::room::settings::SettingsPatch;
use crate::room::timer::TimerConfig;
use crate::room::{Room, RoundPhase, VoteValue};

#[derive(Debug, Clone)]
pub enum Effect {
    /// Same payload to every session in the room.
    Broadcast(ServerEvent),
    /// Only to the session that sent the request.
    Reply(ServerEvent),
    /// Mini-game changed; each session gets its own projection.
    MiniGameChanged,
    PhaseChanged { from: RoundPhase, to: RoundPhase },
}

impl Effect {
    pub fn mutates_room(&self) -> bool {
        !matches!(self, Effect::Reply(_))
    }
}

pub fn apply(room: &mut Room, user: &str, message: ClientMessage, now_ms: i64) -> Vec<Effect> {
    let phase_before = room.phase();
    let mut effects = match message {
        ClientMessage::Vote { vote } => cast_vote(room, user, vote),
        ClientMessage::ShowVotes => toggle_reveal(room, user),
        ClientMessage::ResetVotes => reset_votes(room, user, now_ms),
        ClientMessage::UpdateSettings { settings } => update_settings(room, user, settings, now_ms),
        ClientMessage::NextTicket => next_ticket(room, user, now_ms),
        ClientMessage::AddTicket { ticket } => add_ticket(room, user, ticket, now_ms),
        ClientMessage::UpdateTicket { id, updates } => update_ticket(room, user, id, updates, now_ms),
        ClientMessage::DeleteTicket { id } => delete_ticket(room, user, id),
        ClientMessage::CompleteTicket => complete_ticket(room, user, now_ms),
        ClientMessage::StartTimer => start_timer(room, now_ms),
        ClientMessage::PauseTimer => pause_timer(room, now_ms),
        ClientMessage::ResetTimer => reset_timer(room, now_ms),
        ClientMessage::ConfigureTimer { config } => configure_timer(room, config, now_ms),
        ClientMessage::Ping => vec![Effect::Reply(ServerEvent::Pong)],
        ClientMessage::StartGame => start_game(room, user),
        ClientMessage::GiveClue { word, count } => give_clue(room, user, &word, count),
        ClientMessage::Reveal { index } => reveal_card(room, user, index),
        ClientMessage::Pass => pass_turn(room, user),
        ClientMessage::EndGame => end_game(room, user),
    };

    let phase_after = room.phase();
    if phase_after != phase_before && effects.iter().any(Effect::mutates_room) {
        effects.push(Effect::PhaseChanged {
            from: phase_before,
            to: phase_after,
        });
    }
    effects
}

pub fn cast_vote(room: &mut Room, user: &str, vote: VoteValue) -> Vec<Effect> {
    if room.show_votes && !room.settings.allow_voting_after_reveal {
        tracing::debug!(user.name = %user, "Vote rejected: round already revealed");
        return Vec::new();
    }

    let (value, structured) = match vote {
        VoteValue::Scalar(value) => (value, None),
        VoteValue::Structured(mut structured) => {
            if !room.settings.enable_structured_voting {
                tracing::debug!(user.name = %user, "Structured vote rejected: structured voting is off");
                return Vec::new();
            }
            match resolve_structured_vote(&structured, &room.settings) {
                Ok(points) => {
                    structured.calculated_story_points = Some(points.clone());
                    (points, Some(structured))
                }
                Err(e) => {
                    tracing::debug!(user.name = %user, error = %e, "Structured vote rejected");
                    return Vec::new();
                }
            }
        }
    };

    if !room.settings.is_valid_option(&value) {
        tracing::warn!(
            user.name = %user,
            vote.value = %value,
            vote.valid = ?room.settings.estimate_options,
            "Vote rejected: not an estimate option"
        );
        return Vec::new();
    }

    room.votes.insert(user.to_string(), value.clone());
    match &structured {
        Some(s) => {
            room.structured_votes.insert(user.to_string(), s.clone());
        }
        None => {
            room.structured_votes.remove(user);
        }
    }

    let mut effects = vec![Effect::Broadcast(ServerEvent::Vote {
        user: user.to_string(),
        vote: value,
        structured_vote: structured,
    })];

    if room.show_votes {
        if room.settings.enable_judge {
            room.refresh_judge();
            effects.push(Effect::Broadcast(ServerEvent::judge_of(room)));
        }
    } else if should_auto_reveal(room) {
        tracing::info!(room.key = %room.key, "Every connected user has voted; revealing");
        room.show_votes = true;
        effects.push(Effect::Broadcast(ServerEvent::ShowVotes { show_votes: true }));
        room.refresh_judge();
        effects.push(Effect::Broadcast(ServerEvent::judge_of(room)));
    }
    effects
}

fn should_auto_reveal(room: &Room) -> bool {
    if !room.settings.enable_auto_reveal {
        return false;
    }
    let expected = room.connected_user_names();
    if expected.is_empty() {
        return false;
    }
    expected.iter().all(|user| {
        if !room.votes.contains_key(user) {
            return false;
        }
        if !room.settings.enable_structured_voting {
            return true;
        }
        room.structured_votes
            .get(user)
            .is_some_and(|s| is_criterion_complete(s, &room.settings.voting_criteria))
    })
}

pub fn toggle_reveal(room: &mut Room, user: &str) -> Vec<Effect> {
    if !room.is_moderator(user) && !room.settings.allow_others_to_show_estimates {
        tracing::debug!(user.name = %user, "Reveal rejected: not permitted");
        return Vec::new();
    }
    if room.settings.always_reveal_votes && room.show_votes {
        tracing::debug!(user.name = %user, "Reveal toggle ignored: votes are always revealed");
        return Vec::new();
    }

    room.show_votes = !room.show_votes;
    if room.show_votes {
        room.refresh_judge();
    } else {
        room.set_judge(None);
    }
    vec![
        Effect::Broadcast(ServerEvent::ShowVotes {
            show_votes: room.show_votes,
        }),
        Effect::Broadcast(ServerEvent::judge_of(room)),
    ]
}

pub fn reset_votes(room: &mut Room, user: &str, now_ms: i64) -> Vec<Effect> {
    if !room.is_moderator(user) && !room.settings.allow_others_to_delete_estimates {
        tracing::debug!(user.name = %user, "Reset rejected: not permitted");
        return Vec::new();
    }
    let timer_moved = room.start_new_round(now_ms);
    let mut effects = vec![Effect::Broadcast(ServerEvent::ResetVotes)];
    if timer_moved {
        effects.extend(timer_updated(room));
    }
    effects
}

pub fn update_settings(
    room: &mut Room,
    user: &str,
    patch: SettingsPatch,
    now_ms: i64,
) -> Vec<Effect> {
    if !room.is_moderator(user) {
        tracing::debug!(user.name = %user, "Settings update rejected: not the moderator");
        return Vec::new();
    }
    let previous = room.settings.clone();
    let next = patch.apply(&previous);
    if next == previous {
        return Vec::new();
    }
    room.settings = next;
    let mut effects = vec![Effect::Broadcast(ServerEvent::SettingsUpdated {
        settings: room.settings.clone(),
    })];

    let options_changed = previous.estimate_options != room.settings.estimate_options;
    let has_invalid_vote = room
        .votes
        .values()
        .any(|v| !room.settings.is_valid_option(v));
    if options_changed && has_invalid_vote {
        tracing::info!(room.key = %room.key, "Estimate options changed under existing votes; resetting round");
        let timer_moved = room.start_new_round(now_ms);
        effects.push(Effect::Broadcast(ServerEvent::ResetVotes));
        if timer_moved {
            effects.extend(timer_updated(room));
        }
    }

    if previous.enable_structured_voting && !room.settings.enable_structured_voting {
        room.structured_votes.clear();
    }

    let judge_changed = previous.enable_judge != room.settings.enable_judge
        || previous.judge_algorithm != room.settings.judge_algorithm;
    if !room.settings.enable_judge {
        if room.judge_metadata.is_some() {
            room.set_judge(None);
            effects.push(Effect::Broadcast(ServerEvent::judge_of(room)));
        }
    } else if judge_changed && room.show_votes {
        room.refresh_judge();
        effects.push(Effect::Broadcast(ServerEvent::judge_of(room)));
    }
    effects
}

fn can_manage_queue(room: &Room, user: &str) -> bool {
    let allowed = room.is_moderator(user) || room.settings.allow_others_to_manage_queue;
    if !allowed {
        tracing::debug!(user.name = %user, "Queue change rejected: not permitted");
    }
    allowed
}

fn queue_event(room: &Room, build: impl FnOnce(Vec<queue::TicketQueueItem>) -> ServerEvent) -> Effect {
    Effect::Broadcast(build(room.ticket_queue.clone()))
}

pub fn next_ticket(room: &mut Room, user: &str, now_ms: i64) -> Vec<Effect> {
    if !can_manage_queue(room, user) {
        return Vec::new();
    }
    let outcome = queue::next_ticket(room, now_ms);
    if outcome.auto_created {
        tracing::info!(
            room.key = %room.key,
            ticket.id = ?outcome.current.as_ref().map(|t| &t.ticket_id),
            "Created ticket for next round"
        );
    }
    let mut effects = vec![queue_event(room, |queue| ServerEvent::NextTicket {
        ticket: outcome.current,
        queue,
    })];
    if outcome.timer_reanchored {
        effects.extend(timer_updated(room));
    }
    effects
}

pub fn add_ticket(room: &mut Room, user: &str, ticket: NewTicket, now_ms: i64) -> Vec<Effect> {
    if !can_manage_queue(room, user) {
        return Vec::new();
    }
    match queue::add_ticket(room, ticket, now_ms) {
        Ok(ticket) => vec![queue_event(room, |queue| ServerEvent::TicketAdded { ticket, queue })],
        Err(e) => {
            tracing::debug!(user.name = %user, error = %e, "Ticket add rejected");
            Vec::new()
        }
    }
}

pub fn update_ticket(
    room: &mut Room,
    user: &str,
    id: u64,
    updates: TicketUpdate,
    now_ms: i64,
) -> Vec<Effect> {
    if !can_manage_queue(room, user) {
        return Vec::new();
    }
    match queue::update_ticket(room, id, updates, now_ms) {
        Ok(ticket) => vec![queue_event(room, |queue| ServerEvent::TicketUpdated { ticket, queue })],
        Err(e) => {
            tracing::debug!(user.name = %user, ticket.id = id, error = %e, "Ticket update rejected");
            Vec::new()
        }
    }
}

pub fn delete_ticket(room: &mut Room, user: &str, id: u64) -> Vec<Effect> {
    if !can_manage_queue(room, user) {
        return Vec::new();
    }
    match queue::delete_ticket(room, id) {
        Ok(_) => vec![queue_event(room, |queue| ServerEvent::TicketDeleted { id, queue })],
        Err(e) => {
            tracing::debug!(user.name = %user, ticket.id = id, error = %e, "Ticket delete rejected");
            Vec::new()
        }
    }
}

pub fn complete_ticket(room: &mut Room, user: &str, now_ms: i64) -> Vec<Effect> {
    if !can_manage_queue(room, user) {
        return Vec::new();
    }
    match queue::complete_current_ticket(room, now_ms) {
        Ok(ticket) => vec![queue_event(room, |queue| ServerEvent::TicketCompleted { ticket, queue })],
        Err(e) => {
            tracing::debug!(user.name = %user, error = %e, "Ticket completion rejected");
            Vec::new()
        }
    }
}

fn timer_updated(room: &Room) -> Option<Effect> {
    room.timer_state
        .clone()
        .map(|timer_state| Effect::Broadcast(ServerEvent::TimerUpdated { timer_state }))
}

pub fn start_timer(room: &mut Room, now_ms: i64) -> Vec<Effect> {
    let timer = room.timer_mut(now_ms);
    if timer.running {
        return Vec::new();
    }
    timer.start(now_ms);
    vec![Effect::Broadcast(ServerEvent::TimerStarted {
        timer_state: timer.clone(),
    })]
}

pub fn pause_timer(room: &mut Room, now_ms: i64) -> Vec<Effect> {
    let timer = room.timer_mut(now_ms);
    if !timer.running {
        return Vec::new();
    }
    timer.pause(now_ms);
    vec![Effect::Broadcast(ServerEvent::TimerPaused {
        timer_state: timer.clone(),
    })]
}

pub fn reset_timer(room: &mut Room, now_ms: i64) -> Vec<Effect> {
    let timer = room.timer_mut(now_ms);
    timer.reset(now_ms);
    vec![Effect::Broadcast(ServerEvent::TimerReset {
        timer_state: timer.clone(),
    })]
}

pub fn configure_timer(room: &mut Room, config: TimerConfig, now_ms: i64) -> Vec<Effect> {
    let timer = room.timer_mut(now_ms);
    let before = timer.clone();
    timer.configure(&config, now_ms);
    if *timer == before {
        return Vec::new();
    }
    vec![Effect::Broadcast(ServerEvent::TimerUpdated {
        timer_state: timer.clone(),
    })]
}

pub fn start_game(room: &mut Room, user: &str) -> Vec<Effect> {
    if !room.is_moderator(user) {
        tracing::debug!(user.name = %user, "Game start rejected: not the moderator");
        return Vec::new();
    }
    if !room.settings.enable_word_game {
        tracing::debug!(user.name = %user, "Game start rejected: word game disabled");
        return Vec::new();
    }
    if room.mini_game_state.is_some() {
        tracing::debug!(user.name = %user, "Game start rejected: a game is already running");
        return Vec::new();
    }
    let players = room.connected_user_names();
    let mut rng = StdRng::from_entropy();
    match WordGameState::start(&players, WORD_BANK, &mut rng) {
        Ok(game) => {
            tracing::info!(
                room.key = %room.key,
                game.players = players.len(),
                game.starting_team = ?game.active_team,
                "Word game started"
            );
            room.mini_game_state = Some(game);
            vec![Effect::MiniGameChanged]
        }
        Err(e) => {
            tracing::debug!(user.name = %user, error = %e, "Game start rejected");
            Vec::new()
        }
    }
}

fn with_game<T>(
    room: &mut Room,
    user: &str,
    action: &str,
    play: impl FnOnce(&mut WordGameState) -> Result<T, crate::game_logic::word_game::WordGameError>,
) -> Vec<Effect> {
    let Some(game) = room.mini_game_state.as_mut() else {
        tracing::debug!(user.name = %user, game.action = action, "Rejected: no game running");
        return Vec::new();
    };
    match play(game) {
        Ok(_) => vec![Effect::MiniGameChanged],
        Err(e) => {
            tracing::debug!(user.name = %user, game.action = action, error = %e, "Game move rejected");
            Vec::new()
        }
    }
}

pub fn give_clue(room: &mut Room, user: &str, word: &str, count: u32) -> Vec<Effect> {
    with_game(room, user, "giveClue", |game| game.give_clue(user, word, count))
}

pub fn reveal_card(room: &mut Room, user: &str, index: usize) -> Vec<Effect> {
    with_game(room, user, "reveal", |game| game.reveal(user, index))
}

pub fn pass_turn(room: &mut Room, user: &str) -> Vec<Effect> {
    with_game(room, user, "pass", |game| game.pass(user))
}

pub fn end_game(room: &mut Room, user: &str) -> Vec<Effect> {
    if !room.is_moderator(user) {
        tracing::debug!(user.name = %user, "Game end rejected: not the moderator");
        return Vec::new();
    }
    if room.mini_game_state.take().is_none() {
        return Vec::new();
    }
    vec![Effect::MiniGameChanged]
}
