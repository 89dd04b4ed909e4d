//! Side games a room can run between estimation rounds.

pub mod word_game;
