use serde::{Deserialize, Serialize};

pub const MIN_TARGET_DURATION_SECONDS: u64 = 60;
pub const MAX_TARGET_DURATION_SECONDS: u64 = 3600;
pub const DEFAULT_TARGET_DURATION_SECONDS: u64 = 300;

/// Stored timer snapshot. While paused `seconds` is authoritative; while
/// running the true elapsed value is derived from `last_update_time`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub running: bool,
    pub seconds: u64,
    /// Epoch milliseconds of the last checkpoint.
    pub last_update_time: i64,
    pub target_duration_seconds: u64,
    pub round_anchor_seconds: u64,
    pub auto_reset_on_votes_reset: bool,
}

impl TimerState {
    pub fn new(now_ms: i64) -> Self {
        Self {
            running: false,
            seconds: 0,
            last_update_time: now_ms,
            target_duration_seconds: DEFAULT_TARGET_DURATION_SECONDS,
            round_anchor_seconds: 0,
            auto_reset_on_votes_reset: true,
        }
    }

    pub fn elapsed(&self, now_ms: i64) -> u64 {
        elapsed_seconds(self.running, self.seconds, self.last_update_time, now_ms)
    }

    pub fn start(&mut self, now_ms: i64) {
        self.seconds = self.elapsed(now_ms);
        self.running = true;
        self.last_update_time = now_ms;
    }

    pub fn pause(&mut self, now_ms: i64) {
        self.seconds = self.elapsed(now_ms);
        self.running = false;
        self.last_update_time = now_ms;
    }

    pub fn reset(&mut self, now_ms: i64) {
        self.running = false;
        self.seconds = 0;
        self.round_anchor_seconds = 0;
        self.last_update_time = now_ms;
    }

    /// Records the current elapsed value as the start of a new round without
    /// stopping or zeroing the clock.
    pub fn reanchor(&mut self, now_ms: i64) {
        self.round_anchor_seconds = self.elapsed(now_ms);
    }

    pub fn configure(&mut self, config: &TimerConfig, now_ms: i64) {
        if let Some(target) = config.target_duration_seconds {
            self.target_duration_seconds = clamp_target_duration(target);
        }
        if let Some(auto_reset) = config.auto_reset_on_votes_reset {
            self.auto_reset_on_votes_reset = auto_reset;
        }
        if config.reset_countdown {
            self.reanchor(now_ms);
        }
    }
}

/// Patch carried by a `configureTimer` message.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerConfig {
    #[serde(default)]
    pub target_duration_seconds: Option<u64>,
    #[serde(default)]
    pub auto_reset_on_votes_reset: Option<bool>,
    #[serde(default)]
    pub reset_countdown: bool,
}

/// Elapsed seconds for a timer snapshot at `now_ms`. A clock that appears
/// to run backwards contributes nothing.
pub fn elapsed_seconds(running: bool, seconds: u64, last_update_time: i64, now_ms: i64) -> u64 {
    if !running {
        return seconds;
    }
    let delta_ms = now_ms.saturating_sub(last_update_time).max(0);
    seconds + (delta_ms / 1000) as u64
}

pub fn clamp_target_duration(seconds: u64) -> u64 {
    seconds.clamp(MIN_TARGET_DURATION_SECONDS, MAX_TARGET_DURATION_SECONDS)
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
