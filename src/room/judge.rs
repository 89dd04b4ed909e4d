//! Consensus judge: turns a revealed vote distribution into a suggested
//! estimate with a confidence tier.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const QUESTION_MARK: &str = "?";

const SMART_MODE_SHARE: f64 = 0.6;
const SMART_ADJACENT_SHARE: f64 = 0.7;
const QUESTION_MARK_DOWNGRADE_RATIO: f64 = 0.2;
const QUESTION_MARK_DISCUSSION_RATIO: f64 = 0.3;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum JudgeAlgorithm {
    #[default]
    SmartConsensus,
    ConservativeMode,
    OptimisticMode,
    SimpleAverage,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    fn downgrade(self) -> Self {
        match self {
            Confidence::High => Confidence::Medium,
            Confidence::Medium | Confidence::Low => Confidence::Low,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    pub score: Option<f64>,
    pub confidence: Confidence,
    pub needs_discussion: bool,
    pub reasoning: String,
    pub algorithm: JudgeAlgorithm,
}

/// Scores a room's recorded votes. Non-numeric votes are left out of the
/// numeric set, `"?"` votes are counted separately.
pub fn judge_room_votes(
    votes: &HashMap<String, String>,
    estimate_options: &[String],
    algorithm: JudgeAlgorithm,
) -> JudgeResult {
    let numeric_votes: Vec<f64> = votes.values().filter_map(|v| parse_numeric(v)).collect();
    let question_marks = votes
        .values()
        .filter(|v| v.trim() == QUESTION_MARK)
        .count();
    let valid_options = numeric_options(estimate_options);

    judge(
        &numeric_votes,
        algorithm,
        &valid_options,
        votes.len(),
        question_marks,
    )
}

/// Pure scorer. `valid_options` must be sorted ascending.
pub fn judge(
    votes: &[f64],
    algorithm: JudgeAlgorithm,
    valid_options: &[f64],
    total_votes: usize,
    question_marks: usize,
) -> JudgeResult {
    let mut sorted = votes.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut result = match sorted.len() {
        0 => JudgeResult {
            score: None,
            confidence: Confidence::Low,
            needs_discussion: question_marks > 0,
            reasoning: "No votes to analyze".to_string(),
            algorithm,
        },
        1 => JudgeResult {
            score: Some(sorted[0]),
            confidence: Confidence::Low,
            needs_discussion: false,
            reasoning: "No consensus possible with a single vote".to_string(),
            algorithm,
        },
        _ => match algorithm {
            JudgeAlgorithm::SmartConsensus => smart_consensus(&sorted, valid_options),
            JudgeAlgorithm::ConservativeMode => percentile_verdict(&sorted, valid_options, true),
            JudgeAlgorithm::OptimisticMode => percentile_verdict(&sorted, valid_options, false),
            JudgeAlgorithm::SimpleAverage => simple_average(&sorted, valid_options),
        },
    };

    apply_question_mark_adjustment(&mut result, total_votes, question_marks);
    result
}

fn smart_consensus(sorted: &[f64], options: &[f64]) -> JudgeResult {
    let n = sorted.len() as f64;
    let counts = value_counts(sorted);

    let max_count = counts.iter().map(|(_, c)| *c).max().unwrap_or(0);
    let modes: Vec<f64> = counts
        .iter()
        .filter(|(_, c)| *c == max_count)
        .map(|(v, _)| *v)
        .collect();

    if modes.len() == 1 && max_count as f64 / n >= SMART_MODE_SHARE {
        return JudgeResult {
            score: Some(modes[0]),
            confidence: Confidence::High,
            needs_discussion: false,
            reasoning: format!(
                "Strong consensus: {}% voted {}",
                percent(max_count as f64 / n),
                format_number(modes[0])
            ),
            algorithm: JudgeAlgorithm::SmartConsensus,
        };
    }

    // Each option is paired with its next-higher neighbour only.
    let count_of = |value: f64| {
        counts
            .iter()
            .find(|(v, _)| *v == value)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    };
    let mut best_pair: Option<(f64, usize, f64, usize)> = None;
    for pair in options.windows(2) {
        let (low, high) = (pair[0], pair[1]);
        let (low_count, high_count) = (count_of(low), count_of(high));
        let combined = low_count + high_count;
        let is_better = match best_pair {
            Some((_, bl, _, bh)) => combined > bl + bh,
            None => combined > 0,
        };
        if is_better {
            best_pair = Some((low, low_count, high, high_count));
        }
    }

    if let Some((low, low_count, high, high_count)) = best_pair {
        let combined = (low_count + high_count) as f64;
        if combined / n >= SMART_ADJACENT_SHARE {
            let weighted = (low * low_count as f64 + high * high_count as f64) / combined;
            return JudgeResult {
                score: Some(nearest_option(weighted, options)),
                confidence: Confidence::Medium,
                needs_discussion: false,
                reasoning: format!(
                    "Adjacent consensus: {}% voted {} or {}",
                    percent(combined / n),
                    format_number(low),
                    format_number(high)
                ),
                algorithm: JudgeAlgorithm::SmartConsensus,
            };
        }
    }

    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    let range = max - min;
    let median_vote = median(sorted);
    let median_option = options
        .get(options.len() / 2)
        .copied()
        .unwrap_or(median_vote);

    if range > 2.0 * median_option {
        return JudgeResult {
            score: Some(nearest_option(median_vote, options)),
            confidence: Confidence::Low,
            needs_discussion: true,
            reasoning: format!(
                "Votes spread widely from {} to {}; discuss before settling",
                format_number(min),
                format_number(max)
            ),
            algorithm: JudgeAlgorithm::SmartConsensus,
        };
    }

    JudgeResult {
        score: Some(nearest_option(median_vote, options)),
        confidence: Confidence::Medium,
        needs_discussion: range > median_vote / 2.0,
        reasoning: "No dominant vote; using the median".to_string(),
        algorithm: JudgeAlgorithm::SmartConsensus,
    }
}

fn percentile_verdict(sorted: &[f64], options: &[f64], conservative: bool) -> JudgeResult {
    let last = (sorted.len() - 1) as f64;
    let (index, label, algorithm) = if conservative {
        (
            (last * 0.75).ceil() as usize,
            "Conservative estimate (75th percentile)",
            JudgeAlgorithm::ConservativeMode,
        )
    } else {
        (
            (last * 0.25).floor() as usize,
            "Optimistic estimate (25th percentile)",
            JudgeAlgorithm::OptimisticMode,
        )
    };
    let value = sorted[index.min(sorted.len() - 1)];
    let range = sorted[sorted.len() - 1] - sorted[0];
    let confidence = tier(range, median(sorted), 0.3, 0.8);

    JudgeResult {
        score: Some(nearest_option(value, options)),
        confidence,
        needs_discussion: confidence == Confidence::Low,
        reasoning: label.to_string(),
        algorithm,
    }
}

fn simple_average(sorted: &[f64], options: &[f64]) -> JudgeResult {
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    let range = sorted[sorted.len() - 1] - sorted[0];
    let confidence = tier(range, mean, 0.2, 0.6);

    JudgeResult {
        score: Some(nearest_option(mean, options)),
        confidence,
        needs_discussion: confidence == Confidence::Low,
        reasoning: format!("Average of {} votes is {:.1}", sorted.len(), mean),
        algorithm: JudgeAlgorithm::SimpleAverage,
    }
}

fn apply_question_mark_adjustment(result: &mut JudgeResult, total: usize, question_marks: usize) {
    if question_marks == 0 || total == 0 {
        return;
    }
    let ratio = question_marks as f64 / total as f64;
    if ratio > QUESTION_MARK_DOWNGRADE_RATIO {
        result.confidence = result.confidence.downgrade();
    }
    if ratio > QUESTION_MARK_DISCUSSION_RATIO {
        result.needs_discussion = true;
    }
    let noun = if question_marks == 1 { "vote" } else { "votes" };
    result
        .reasoning
        .push_str(&format!(" ({} \"?\" {})", question_marks, noun));
}

fn tier(range: f64, base: f64, high: f64, medium: f64) -> Confidence {
    if base <= 0.0 {
        return if range == 0.0 {
            Confidence::High
        } else {
            Confidence::Low
        };
    }
    let ratio = range / base;
    if ratio <= high {
        Confidence::High
    } else if ratio <= medium {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

fn value_counts(sorted: &[f64]) -> Vec<(f64, usize)> {
    let mut counts: Vec<(f64, usize)> = Vec::new();
    for &vote in sorted {
        match counts.last_mut() {
            Some((value, count)) if *value == vote => *count += 1,
            _ => counts.push((vote, 1)),
        }
    }
    counts
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Snaps `value` to the closest option; exact ties go to the lower option.
pub fn nearest_option(value: f64, options: &[f64]) -> f64 {
    let mut best: Option<(f64, f64)> = None;
    for &option in options {
        let distance = (option - value).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((option, distance)),
        }
    }
    best.map(|(option, _)| option).unwrap_or(value)
}

pub fn parse_numeric(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite())
}

/// Numeric estimate options, ascending and deduplicated.
pub fn numeric_options(estimate_options: &[String]) -> Vec<f64> {
    let mut options: Vec<f64> = estimate_options
        .iter()
        .filter_map(|o| parse_numeric(o))
        .collect();
    options.sort_by(f64::total_cmp);
    options.dedup();
    options
}

fn percent(share: f64) -> u32 {
    (share * 100.0).round() as u32
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
