use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::game_logic::word_game::WordGameState;

pub mod judge;
pub mod messages;
pub mod queue;
pub mod scoring;
pub mod settings;
pub mod timer;
pub mod transitions;

use judge::{JudgeResult, judge_room_votes};
use queue::TicketQueueItem;
use settings::{RoomSettings, normalize_settings, stringify_scalar};
use timer::TimerState;

pub const ROOM_KEY_LENGTH: usize = 6;
pub const MAX_USER_NAME_LENGTH: usize = 40;
// No 0/O or 1/I so keys survive being read aloud.
const ROOM_KEY_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Multi-criteria vote. `calculated_story_points` is filled in by the server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StructuredVote {
    pub criteria_scores: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculated_story_points: Option<String>,
}

/// Inbound vote payload: a plain option (string or number) or a structured vote.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum VoteValue {
    Scalar(String),
    Structured(StructuredVote),
}

impl<'de> Deserialize<'de> for VoteValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let value = Value::deserialize(deserializer)?;
        if value.is_object() {
            return serde_json::from_value(value)
                .map(VoteValue::Structured)
                .map_err(D::Error::custom);
        }
        stringify_scalar(&value)
            .map(VoteValue::Scalar)
            .ok_or_else(|| D::Error::custom("vote must be a string, number or structured vote"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RoundPhase {
    Idle,
    Voting,
    Revealed,
}

/// Authoritative state of one estimation room.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub key: String,
    pub users: Vec<String>,
    pub connected_users: HashMap<String, bool>,
    pub moderator: String,
    #[serde(default)]
    pub votes: HashMap<String, String>,
    #[serde(default)]
    pub structured_votes: HashMap<String, StructuredVote>,
    #[serde(default)]
    pub show_votes: bool,
    #[serde(default)]
    pub settings: RoomSettings,
    #[serde(default)]
    pub judge_score: Option<f64>,
    #[serde(default)]
    pub judge_metadata: Option<JudgeResult>,
    #[serde(default)]
    pub timer_state: Option<TimerState>,
    #[serde(default)]
    pub ticket_queue: Vec<TicketQueueItem>,
    #[serde(default)]
    pub current_ticket_id: Option<u64>,
    #[serde(default)]
    pub mini_game_state: Option<WordGameState>,
    pub created_at: i64,
}

impl Room {
    pub fn new(key: String, moderator: &str, settings: RoomSettings, now_ms: i64) -> Self {
        let moderator = moderator.trim().to_string();
        Room {
            key,
            users: vec![moderator.clone()],
            connected_users: HashMap::from([(moderator.clone(), false)]),
            moderator,
            votes: HashMap::new(),
            structured_votes: HashMap::new(),
            show_votes: false,
            settings: normalize_settings(settings),
            judge_score: None,
            judge_metadata: None,
            timer_state: None,
            ticket_queue: Vec::new(),
            current_ticket_id: None,
            mini_game_state: None,
            created_at: now_ms,
        }
    }

    /// Existing user with the same canonical name, in its stored casing.
    pub fn find_user(&self, name: &str) -> Option<&String> {
        let wanted = canonical_name(name);
        self.users.iter().find(|u| canonical_name(u) == wanted)
    }

    /// Adds `name` unless a user with the same canonical name exists.
    /// Returns the stored casing and whether the user is new.
    pub fn add_user(&mut self, name: &str) -> (String, bool) {
        if let Some(existing) = self.find_user(name) {
            return (existing.clone(), false);
        }
        let name = name.trim().to_string();
        self.users.push(name.clone());
        self.connected_users.insert(name.clone(), false);
        (name, true)
    }

    pub fn is_moderator(&self, name: &str) -> bool {
        canonical_name(&self.moderator) == canonical_name(name)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.connected_users.get(name).copied().unwrap_or(false)
    }

    /// Returns true when the flag actually changed.
    pub fn set_connected(&mut self, name: &str, connected: bool) -> bool {
        let previous = self.connected_users.insert(name.to_string(), connected);
        previous != Some(connected)
    }

    /// Connected users in join order.
    pub fn connected_user_names(&self) -> Vec<String> {
        self.users
            .iter()
            .filter(|u| self.is_connected(u))
            .cloned()
            .collect()
    }

    /// Alphabetically first connected user other than `leaving`.
    pub fn moderator_candidate(&self, leaving: &str) -> Option<String> {
        let mut candidates: Vec<String> = self
            .connected_user_names()
            .into_iter()
            .filter(|u| canonical_name(u) != canonical_name(leaving))
            .collect();
        candidates.sort_by_key(|u| canonical_name(u));
        candidates.into_iter().next()
    }

    pub fn phase(&self) -> RoundPhase {
        if self.show_votes {
            RoundPhase::Revealed
        } else if self.votes.is_empty() {
            RoundPhase::Idle
        } else {
            RoundPhase::Voting
        }
    }

    pub fn set_judge(&mut self, result: Option<JudgeResult>) {
        self.judge_score = result.as_ref().and_then(|r| r.score);
        self.judge_metadata = result;
    }

    /// Scores the current votes, or clears the verdict when judging is off.
    pub fn refresh_judge(&mut self) {
        let result = self.settings.enable_judge.then(|| {
            judge_room_votes(
                &self.votes,
                &self.settings.estimate_options,
                self.settings.judge_algorithm,
            )
        });
        self.set_judge(result);
    }

    pub fn clear_round(&mut self) {
        self.votes.clear();
        self.structured_votes.clear();
        self.show_votes = false;
        self.set_judge(None);
    }

    /// Clears the round and re-anchors the timer when it is set to follow
    /// vote resets. Returns true when the timer moved.
    pub fn start_new_round(&mut self, now_ms: i64) -> bool {
        self.clear_round();
        match self.timer_state.as_mut() {
            Some(timer) if timer.auto_reset_on_votes_reset => {
                timer.reanchor(now_ms);
                true
            }
            _ => false,
        }
    }

    pub fn timer_mut(&mut self, now_ms: i64) -> &mut TimerState {
        self.timer_state
            .get_or_insert_with(|| TimerState::new(now_ms))
    }

    pub fn current_ticket(&self) -> Option<&TicketQueueItem> {
        let id = self.current_ticket_id?;
        self.ticket_queue.iter().find(|t| t.id == id)
    }
}

/// Trimmed, case-folded identity used for every user-name comparison.
pub fn canonical_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Trims a requested display name, rejecting empty, overlong or
/// control-character names.
pub fn sanitize_user_name(raw: &str) -> Option<String> {
    let name = raw.trim();
    if name.is_empty()
        || name.chars().count() > MAX_USER_NAME_LENGTH
        || name.chars().any(char::is_control)
    {
        return None;
    }
    Some(name.to_string())
}

pub fn generate_room_key<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..ROOM_KEY_LENGTH)
        .map(|_| ROOM_KEY_ALPHABET[rng.gen_range(0..ROOM_KEY_ALPHABET.len())] as char)
        .collect()
}

pub fn canonical_room_key(key: &str) -> String {
    key.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn room() -> Room {
        Room::new("ABC234".into(), "Alice", RoomSettings::default(), 0)
    }

    #[test]
    fn test_users_are_matched_case_insensitively() {
        let mut room = room();
        let (name, added) = room.add_user("  alice ");
        assert_eq!(name, "Alice");
        assert!(!added);

        let (name, added) = room.add_user(" Bob ");
        assert_eq!(name, "Bob");
        assert!(added);
        assert_eq!(room.users, vec!["Alice", "Bob"]);
        assert_eq!(room.connected_users.get("Bob"), Some(&false));
        assert!(room.is_moderator("ALICE"));
        assert_eq!(room.find_user("bob"), Some(&"Bob".to_string()));
    }

    #[test]
    fn test_moderator_candidate_is_alphabetical_among_connected() {
        let mut room = room();
        for name in ["zed", "Carol", "bob"] {
            room.add_user(name);
        }
        room.set_connected("Alice", true);
        room.set_connected("zed", true);
        room.set_connected("Carol", true);
        assert_eq!(room.moderator_candidate("Alice"), Some("Carol".to_string()));

        room.set_connected("Carol", false);
        room.set_connected("zed", false);
        assert_eq!(room.moderator_candidate("Alice"), None);
    }

    #[test]
    fn test_phase_follows_votes_and_reveal() {
        let mut room = room();
        assert_eq!(room.phase(), RoundPhase::Idle);
        room.votes.insert("Alice".into(), "5".into());
        assert_eq!(room.phase(), RoundPhase::Voting);
        room.show_votes = true;
        assert_eq!(room.phase(), RoundPhase::Revealed);
        room.clear_round();
        assert_eq!(room.phase(), RoundPhase::Idle);
    }

    #[test]
    fn test_new_round_reanchors_only_when_enabled() {
        let mut room = room();
        assert!(!room.start_new_round(0));

        room.timer_mut(0).start(0);
        assert!(room.start_new_round(12_000));
        assert_eq!(room.timer_state.as_ref().unwrap().round_anchor_seconds, 12);

        room.timer_mut(0).auto_reset_on_votes_reset = false;
        assert!(!room.start_new_round(20_000));
        assert_eq!(room.timer_state.as_ref().unwrap().round_anchor_seconds, 12);
    }

    #[test]
    fn test_vote_value_accepts_scalars_and_structures() {
        let v: VoteValue = serde_json::from_str("8").unwrap();
        assert_eq!(v, VoteValue::Scalar("8".into()));
        let v: VoteValue = serde_json::from_str(r#""coffee""#).unwrap();
        assert_eq!(v, VoteValue::Scalar("coffee".into()));
        let v: VoteValue =
            serde_json::from_str(r#"{"criteriaScores": {"complexity": 2}}"#).unwrap();
        match v {
            VoteValue::Structured(s) => assert_eq!(s.criteria_scores["complexity"], 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(serde_json::from_str::<VoteValue>("[1]").is_err());
    }

    #[test]
    fn test_user_name_sanitizing() {
        assert_eq!(sanitize_user_name("  Dana "), Some("Dana".into()));
        assert_eq!(sanitize_user_name("   "), None);
        assert_eq!(sanitize_user_name(&"x".repeat(41)), None);
        assert_eq!(sanitize_user_name("a\u{0007}b"), None);
    }

    #[test]
    fn test_room_keys_use_unambiguous_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let key = generate_room_key(&mut rng);
            assert_eq!(key.len(), ROOM_KEY_LENGTH);
            assert!(key.bytes().all(|b| ROOM_KEY_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_room_round_trips_through_json() {
        let mut room = room();
        room.add_user("Bob");
        room.votes.insert("Bob".into(), "3".into());
        let json = serde_json::to_string(&room).unwrap();
        let back: Room = serde_json::from_str(&json).unwrap();
        assert_eq!(back, room);
    }
}
