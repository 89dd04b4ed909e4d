//! Team word-guessing game played inside a room between estimation rounds.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::room::canonical_name;

pub const BOARD_SIZE: usize = 25;
pub const MAX_CLUE_COUNT: u32 = 9;
/// Two per team, so each team has a guesser besides its spymaster.
pub const MIN_PLAYERS: usize = 4;
const STARTING_TEAM_CARDS: u32 = 9;
const OTHER_TEAM_CARDS: u32 = 8;
const NEUTRAL_CARDS: usize = 7;

pub const WORD_BANK: &[&str] = &[
    "anchor", "apple", "arrow", "backlog", "badge", "balloon", "battery", "beacon", "bridge",
    "bucket", "cable", "camera", "canyon", "castle", "circuit", "cloud", "compass", "copper",
    "crystal", "deadline", "desert", "diamond", "dragon", "engine", "falcon", "feather", "forest",
    "fountain", "galaxy", "garden", "glacier", "hammer", "harbor", "helmet", "island", "jungle",
    "kernel", "ladder", "lantern", "laser", "lemon", "magnet", "marble", "meteor", "mirror",
    "needle", "orbit", "palace", "parrot", "pepper", "piano", "pilot", "pixel", "planet",
    "pocket", "puzzle", "pyramid", "quartz", "rabbit", "radar", "rocket", "saddle", "satellite",
    "scroll", "shadow", "signal", "socket", "spider", "sprint", "station", "storm", "sugar",
    "switch", "temple", "thunder", "ticket", "tower", "tunnel", "turtle", "velvet", "violin",
    "volcano", "wagon", "whistle", "window", "wizard", "yacht", "zipper",
];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Red,
    Blue,
}

impl Team {
    pub fn opponent(self) -> Self {
        match self {
            Team::Red => Team::Blue,
            Team::Blue => Team::Red,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CardRole {
    Red,
    Blue,
    Neutral,
    Assassin,
}

impl From<Team> for CardRole {
    fn from(team: Team) -> Self {
        match team {
            Team::Red => CardRole::Red,
            Team::Blue => CardRole::Blue,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct TeamRosters {
    pub red: Vec<String>,
    pub blue: Vec<String>,
}

impl TeamRosters {
    pub fn members(&self, team: Team) -> &[String] {
        match team {
            Team::Red => &self.red,
            Team::Blue => &self.blue,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct RemainingCards {
    pub red: u32,
    pub blue: u32,
}

impl RemainingCards {
    fn get_mut(&mut self, team: Team) -> &mut u32 {
        match team {
            Team::Red => &mut self.red,
            Team::Blue => &mut self.blue,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum WordGameError {
    #[error("At least {MIN_PLAYERS} connected players are needed")]
    NotEnoughPlayers,
    #[error("Word bank holds fewer than {BOARD_SIZE} words")]
    WordBankTooSmall,
    #[error("User is not playing")]
    NotAPlayer,
    #[error("Only the active team's spymaster may give clues")]
    NotSpymaster,
    #[error("Spymasters cannot guess")]
    SpymasterCannotGuess,
    #[error("It is not this team's turn")]
    NotYourTurn,
    #[error("Guessing already started on the current clue")]
    ClueAlreadyInPlay,
    #[error("Clue must be a single non-empty word")]
    InvalidClue,
    #[error("Clue count {0} is outside 0..={MAX_CLUE_COUNT}")]
    InvalidClueCount(u32),
    #[error("No clue has been given")]
    NoClue,
    #[error("No guesses remaining")]
    NoGuessesRemaining,
    #[error("Card {0} is already revealed")]
    AlreadyRevealed(usize),
    #[error("Card {0} is not on the board")]
    OutOfRange(usize),
    #[error("The game is over")]
    GameOver,
}

/// Full game state, including the hidden card assignments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WordGameState {
    pub board: Vec<String>,
    pub assignments: Vec<CardRole>,
    pub revealed: Vec<bool>,
    pub teams: TeamRosters,
    pub spymasters: BTreeMap<String, Team>,
    pub active_team: Team,
    pub clue_word: Option<String>,
    pub clue_count: Option<u32>,
    pub guesses_remaining: u32,
    pub guesses_taken: u32,
    pub remaining: RemainingCards,
    pub winner: Option<Team>,
    pub version: u64,
}

/// What a client is shown. Unrevealed assignments are `None` for anyone but
/// a spymaster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WordGameView {
    pub board: Vec<String>,
    pub assignments: Vec<Option<CardRole>>,
    pub revealed: Vec<bool>,
    pub teams: TeamRosters,
    pub spymasters: BTreeMap<String, Team>,
    pub active_team: Team,
    pub clue_word: Option<String>,
    pub clue_count: Option<u32>,
    pub guesses_remaining: u32,
    pub guesses_taken: u32,
    pub remaining: RemainingCards,
    pub winner: Option<Team>,
    pub version: u64,
}

impl WordGameState {
    /// Deals a fresh board. Players are split alternately after a
    /// case-insensitive sort and the first member of each team is its spymaster.
    pub fn start<R: Rng + ?Sized>(
        players: &[String],
        word_bank: &[&str],
        rng: &mut R,
    ) -> Result<Self, WordGameError> {
        if players.len() < MIN_PLAYERS {
            return Err(WordGameError::NotEnoughPlayers);
        }
        if word_bank.len() < BOARD_SIZE {
            return Err(WordGameError::WordBankTooSmall);
        }

        let mut sorted = players.to_vec();
        sorted.sort_by_key(|p| canonical_name(p));
        let mut teams = TeamRosters::default();
        for (i, player) in sorted.into_iter().enumerate() {
            if i % 2 == 0 {
                teams.red.push(player);
            } else {
                teams.blue.push(player);
            }
        }

        let mut spymasters = BTreeMap::new();
        for team in [Team::Red, Team::Blue] {
            if let Some(first) = teams.members(team).first() {
                spymasters.insert(first.clone(), team);
            }
        }

        let starting_team = if rng.gen_bool(0.5) { Team::Red } else { Team::Blue };
        let other_team = starting_team.opponent();

        let mut assignments = Vec::with_capacity(BOARD_SIZE);
        assignments.extend(std::iter::repeat_n(
            CardRole::from(starting_team),
            STARTING_TEAM_CARDS as usize,
        ));
        assignments.extend(std::iter::repeat_n(
            CardRole::from(other_team),
            OTHER_TEAM_CARDS as usize,
        ));
        assignments.extend(std::iter::repeat_n(CardRole::Neutral, NEUTRAL_CARDS));
        assignments.push(CardRole::Assassin);
        assignments.shuffle(rng);

        let board: Vec<String> = word_bank
            .choose_multiple(rng, BOARD_SIZE)
            .map(|w| w.to_string())
            .collect();

        let mut remaining = RemainingCards::default();
        *remaining.get_mut(starting_team) = STARTING_TEAM_CARDS;
        *remaining.get_mut(other_team) = OTHER_TEAM_CARDS;

        Ok(Self {
            board,
            assignments,
            revealed: vec![false; BOARD_SIZE],
            teams,
            spymasters,
            active_team: starting_team,
            clue_word: None,
            clue_count: None,
            guesses_remaining: 0,
            guesses_taken: 0,
            remaining,
            winner: None,
            version: 1,
        })
    }

    pub fn team_of(&self, user: &str) -> Option<Team> {
        let wanted = canonical_name(user);
        [Team::Red, Team::Blue].into_iter().find(|&team| {
            self.teams
                .members(team)
                .iter()
                .any(|m| canonical_name(m) == wanted)
        })
    }

    pub fn is_spymaster(&self, user: &str) -> bool {
        let wanted = canonical_name(user);
        self.spymasters.keys().any(|s| canonical_name(s) == wanted)
    }

    pub fn give_clue(&mut self, user: &str, word: &str, count: u32) -> Result<(), WordGameError> {
        self.ensure_running()?;
        let team = self.team_of(user).ok_or(WordGameError::NotAPlayer)?;
        if !self.is_spymaster(user) {
            return Err(WordGameError::NotSpymaster);
        }
        if team != self.active_team {
            return Err(WordGameError::NotYourTurn);
        }
        if self.clue_word.is_some() && self.guesses_taken > 0 {
            return Err(WordGameError::ClueAlreadyInPlay);
        }
        let word = word.trim();
        if word.is_empty() || word.chars().any(char::is_whitespace) {
            return Err(WordGameError::InvalidClue);
        }
        if count > MAX_CLUE_COUNT {
            return Err(WordGameError::InvalidClueCount(count));
        }

        self.clue_word = Some(word.to_string());
        self.clue_count = Some(count);
        self.guesses_remaining = count + 1;
        self.guesses_taken = 0;
        self.version += 1;
        Ok(())
    }

    /// Flips card `index` for a guesser on the active team and returns its role.
    pub fn reveal(&mut self, user: &str, index: usize) -> Result<CardRole, WordGameError> {
        self.ensure_running()?;
        let team = self.team_of(user).ok_or(WordGameError::NotAPlayer)?;
        if self.is_spymaster(user) {
            return Err(WordGameError::SpymasterCannotGuess);
        }
        if team != self.active_team {
            return Err(WordGameError::NotYourTurn);
        }
        if self.clue_word.is_none() {
            return Err(WordGameError::NoClue);
        }
        if self.guesses_remaining == 0 {
            return Err(WordGameError::NoGuessesRemaining);
        }
        if index >= self.board.len() {
            return Err(WordGameError::OutOfRange(index));
        }
        if self.revealed[index] {
            return Err(WordGameError::AlreadyRevealed(index));
        }

        self.revealed[index] = true;
        self.guesses_taken += 1;
        let role = self.assignments[index];
        let opponent = team.opponent();

        match role {
            r if r == CardRole::from(team) => {
                let left = self.remaining.get_mut(team);
                *left = left.saturating_sub(1);
                if *left == 0 {
                    self.declare_winner(team);
                } else {
                    self.guesses_remaining -= 1;
                    if self.guesses_remaining == 0 {
                        self.end_turn();
                    }
                }
            }
            r if r == CardRole::from(opponent) => {
                let left = self.remaining.get_mut(opponent);
                *left = left.saturating_sub(1);
                if *left == 0 {
                    self.declare_winner(opponent);
                } else {
                    self.end_turn();
                }
            }
            CardRole::Assassin => self.declare_winner(opponent),
            _ => self.end_turn(),
        }

        self.version += 1;
        Ok(role)
    }

    pub fn pass(&mut self, user: &str) -> Result<(), WordGameError> {
        self.ensure_running()?;
        let team = self.team_of(user).ok_or(WordGameError::NotAPlayer)?;
        if team != self.active_team {
            return Err(WordGameError::NotYourTurn);
        }
        self.end_turn();
        self.version += 1;
        Ok(())
    }

    pub fn public_view(&self) -> WordGameView {
        self.project(|i| self.revealed[i])
    }

    pub fn spymaster_view(&self) -> WordGameView {
        self.project(|_| true)
    }

    pub fn view_for(&self, user: &str) -> WordGameView {
        if self.is_spymaster(user) {
            self.spymaster_view()
        } else {
            self.public_view()
        }
    }

    fn project(&self, visible: impl Fn(usize) -> bool) -> WordGameView {
        WordGameView {
            board: self.board.clone(),
            assignments: self
                .assignments
                .iter()
                .enumerate()
                .map(|(i, role)| visible(i).then_some(*role))
                .collect(),
            revealed: self.revealed.clone(),
            teams: self.teams.clone(),
            spymasters: self.spymasters.clone(),
            active_team: self.active_team,
            clue_word: self.clue_word.clone(),
            clue_count: self.clue_count,
            guesses_remaining: self.guesses_remaining,
            guesses_taken: self.guesses_taken,
            remaining: self.remaining,
            winner: self.winner,
            version: self.version,
        }
    }

    fn ensure_running(&self) -> Result<(), WordGameError> {
        match self.winner {
            Some(_) => Err(WordGameError::GameOver),
            None => Ok(()),
        }
    }

    fn declare_winner(&mut self, team: Team) {
        self.winner = Some(team);
        self.guesses_remaining = 0;
    }

    fn end_turn(&mut self) {
        self.active_team = self.active_team.opponent();
        self.clue_word = None;
        self.clue_count = None;
        self.guesses_remaining = 0;
        self.guesses_taken = 0;
    }
}
