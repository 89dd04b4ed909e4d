//! Resolution of multi-criteria structured votes into a single estimate.

use thiserror::Error;

use crate::room::StructuredVote;
use crate::room::judge::parse_numeric;
use crate::room::settings::{RoomSettings, VotingCriterion};

#[derive(Debug, Error, PartialEq)]
pub enum ScoringError {
    #[error("Unknown criterion '{0}'")]
    UnknownCriterion(String),
    #[error("Score {score} for '{criterion}' is outside {min}..={max}")]
    ScoreOutOfRange {
        criterion: String,
        score: u32,
        min: u32,
        max: u32,
    },
    #[error("Structured vote has no criterion scores")]
    Empty,
    #[error("Room has no numeric estimate options")]
    NoNumericOptions,
}

/// Maps a structured vote onto one of the room's numeric estimate options.
///
/// Every scored criterion is normalized to `0.0..=1.0` (flipped for inverted
/// criteria) and the mean picks a position along the ascending option scale.
pub fn resolve_structured_vote(
    vote: &StructuredVote,
    settings: &RoomSettings,
) -> Result<String, ScoringError> {
    if vote.criteria_scores.is_empty() {
        return Err(ScoringError::Empty);
    }

    let mut total = 0.0;
    for (criterion_id, &score) in &vote.criteria_scores {
        let criterion = find_criterion(&settings.voting_criteria, criterion_id)
            .ok_or_else(|| ScoringError::UnknownCriterion(criterion_id.clone()))?;
        if score < criterion.min_score || score > criterion.max_score {
            return Err(ScoringError::ScoreOutOfRange {
                criterion: criterion_id.clone(),
                score,
                min: criterion.min_score,
                max: criterion.max_score,
            });
        }
        let span = (criterion.max_score - criterion.min_score) as f64;
        let normalized = (score - criterion.min_score) as f64 / span;
        total += if criterion.inverted {
            1.0 - normalized
        } else {
            normalized
        };
    }
    let average = total / vote.criteria_scores.len() as f64;

    let mut scale: Vec<(f64, &String)> = settings
        .estimate_options
        .iter()
        .filter_map(|o| parse_numeric(o).map(|value| (value, o)))
        .collect();
    scale.sort_by(|a, b| a.0.total_cmp(&b.0));
    scale.dedup_by(|a, b| a.0 == b.0);
    if scale.is_empty() {
        return Err(ScoringError::NoNumericOptions);
    }

    let index = (average * (scale.len() - 1) as f64).round() as usize;
    Ok(scale[index.min(scale.len() - 1)].1.clone())
}

/// True when every configured criterion has a score.
pub fn is_criterion_complete(vote: &StructuredVote, criteria: &[VotingCriterion]) -> bool {
    criteria
        .iter()
        .all(|c| vote.criteria_scores.contains_key(&c.id))
}

fn find_criterion<'a>(criteria: &'a [VotingCriterion], id: &str) -> Option<&'a VotingCriterion> {
    criteria.iter().find(|c| c.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn vote(scores: &[(&str, u32)]) -> StructuredVote {
        StructuredVote {
            criteria_scores: scores
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
            calculated_story_points: None,
        }
    }

    #[test]
    fn test_extremes_map_to_scale_ends() {
        let settings = RoomSettings::default();
        let lowest = vote(&[
            ("complexity", 0),
            ("confidence", 4),
            ("volume", 0),
            ("unknowns", 0),
        ]);
        assert_eq!(resolve_structured_vote(&lowest, &settings), Ok("1".to_string()));

        let highest = vote(&[
            ("complexity", 4),
            ("confidence", 0),
            ("volume", 4),
            ("unknowns", 2),
        ]);
        assert_eq!(resolve_structured_vote(&highest, &settings), Ok("21".to_string()));
    }

    #[test]
    fn test_midpoint_lands_mid_scale() {
        let settings = RoomSettings::default();
        // Every criterion at half: index round(0.5 * 6) = 3 -> "5".
        let middle = vote(&[
            ("complexity", 2),
            ("confidence", 2),
            ("volume", 2),
            ("unknowns", 1),
        ]);
        assert_eq!(resolve_structured_vote(&middle, &settings), Ok("5".to_string()));
    }

    #[test]
    fn test_rejects_bad_scores() {
        let settings = RoomSettings::default();
        assert_eq!(
            resolve_structured_vote(&vote(&[("charisma", 1)]), &settings),
            Err(ScoringError::UnknownCriterion("charisma".into()))
        );
        assert!(matches!(
            resolve_structured_vote(&vote(&[("unknowns", 3)]), &settings),
            Err(ScoringError::ScoreOutOfRange { .. })
        ));
        assert_eq!(
            resolve_structured_vote(&vote(&[]), &settings),
            Err(ScoringError::Empty)
        );
    }

    #[test]
    fn test_completeness() {
        let settings = RoomSettings::default();
        let partial = vote(&[("complexity", 1)]);
        assert!(!is_criterion_complete(&partial, &settings.voting_criteria));
        let full = vote(&[
            ("complexity", 1),
            ("confidence", 1),
            ("volume", 1),
            ("unknowns", 1),
        ]);
        assert!(is_criterion_complete(&full, &settings.voting_criteria));
    }
}
