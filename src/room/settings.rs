use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::room::judge::JudgeAlgorithm;

pub const SETTINGS_VERSION: u32 = 1;
const DEFAULT_TICKET_PREFIX: &str = "TASK";
const DEFAULT_ESTIMATE_OPTIONS: &[&str] = &["1", "2", "3", "5", "8", "13", "21", "?", "coffee"];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExternalService {
    #[default]
    None,
    Jira,
    Linear,
    Github,
}

/// One axis of a structured vote.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VotingCriterion {
    pub id: String,
    pub name: String,
    pub min_score: u32,
    pub max_score: u32,
    /// Higher scores pull the estimate down (e.g. confidence).
    #[serde(default)]
    pub inverted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomSettings {
    pub version: u32,
    #[serde(deserialize_with = "deserialize_estimate_options")]
    pub estimate_options: Vec<String>,
    pub allow_others_to_show_estimates: bool,
    pub allow_others_to_delete_estimates: bool,
    pub allow_others_to_manage_queue: bool,
    pub allow_voting_after_reveal: bool,
    pub always_reveal_votes: bool,
    pub enable_auto_reveal: bool,
    pub auto_handover_moderator: bool,
    pub enable_judge: bool,
    pub judge_algorithm: JudgeAlgorithm,
    pub enable_structured_voting: bool,
    pub voting_criteria: Vec<VotingCriterion>,
    pub enable_ticket_queue: bool,
    pub show_timer: bool,
    pub enable_word_game: bool,
    pub external_service: ExternalService,
    pub ticket_prefix: String,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            estimate_options: default_estimate_options(),
            allow_others_to_show_estimates: false,
            allow_others_to_delete_estimates: false,
            allow_others_to_manage_queue: false,
            allow_voting_after_reveal: false,
            always_reveal_votes: false,
            enable_auto_reveal: false,
            auto_handover_moderator: false,
            enable_judge: true,
            judge_algorithm: JudgeAlgorithm::default(),
            enable_structured_voting: false,
            voting_criteria: default_voting_criteria(),
            enable_ticket_queue: false,
            show_timer: false,
            enable_word_game: true,
            external_service: ExternalService::None,
            ticket_prefix: DEFAULT_TICKET_PREFIX.to_string(),
        }
    }
}

impl RoomSettings {
    pub fn is_valid_option(&self, value: &str) -> bool {
        self.estimate_options.iter().any(|o| o == value)
    }
}

pub fn default_estimate_options() -> Vec<String> {
    DEFAULT_ESTIMATE_OPTIONS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn default_voting_criteria() -> Vec<VotingCriterion> {
    let criterion = |id: &str, name: &str, max_score: u32, inverted: bool| VotingCriterion {
        id: id.to_string(),
        name: name.to_string(),
        min_score: 0,
        max_score,
        inverted,
    };
    vec![
        criterion("complexity", "Complexity", 4, false),
        criterion("confidence", "Confidence", 4, true),
        criterion("volume", "Volume", 4, false),
        criterion("unknowns", "Unknowns", 2, false),
    ]
}

/// Fills in and repairs a settings object. Idempotent: normalizing an
/// already-normalized value returns it unchanged.
pub fn normalize_settings(mut settings: RoomSettings) -> RoomSettings {
    settings.version = SETTINGS_VERSION;

    let mut seen = HashSet::new();
    settings.estimate_options = settings
        .estimate_options
        .into_iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty() && seen.insert(o.clone()))
        .collect();
    if settings.estimate_options.is_empty() {
        settings.estimate_options = default_estimate_options();
    }

    let mut seen_criteria = HashSet::new();
    settings.voting_criteria.retain(|c| {
        !c.id.trim().is_empty() && c.max_score > c.min_score && seen_criteria.insert(c.id.clone())
    });
    if settings.voting_criteria.is_empty() {
        settings.voting_criteria = default_voting_criteria();
    }

    let prefix = settings.ticket_prefix.trim().to_uppercase();
    settings.ticket_prefix = if prefix.is_empty() {
        DEFAULT_TICKET_PREFIX.to_string()
    } else {
        prefix
    };

    settings
}

/// Partial settings update sent by the moderator.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, deserialize_with = "deserialize_optional_estimate_options")]
    pub estimate_options: Option<Vec<String>>,
    pub allow_others_to_show_estimates: Option<bool>,
    pub allow_others_to_delete_estimates: Option<bool>,
    pub allow_others_to_manage_queue: Option<bool>,
    pub allow_voting_after_reveal: Option<bool>,
    pub always_reveal_votes: Option<bool>,
    pub enable_auto_reveal: Option<bool>,
    pub auto_handover_moderator: Option<bool>,
    pub enable_judge: Option<bool>,
    pub judge_algorithm: Option<JudgeAlgorithm>,
    pub enable_structured_voting: Option<bool>,
    pub voting_criteria: Option<Vec<VotingCriterion>>,
    pub enable_ticket_queue: Option<bool>,
    pub show_timer: Option<bool>,
    pub enable_word_game: Option<bool>,
    pub external_service: Option<ExternalService>,
    pub ticket_prefix: Option<String>,
}

impl SettingsPatch {
    pub fn apply(self, current: &RoomSettings) -> RoomSettings {
        let mut next = current.clone();
        let patch = self;
        macro_rules! merge {
            ($patch:ident => $next:ident; $($field:ident),* $(,)?) => {
                $(if let Some(value) = $patch.$field {
                    $next.$field = value;
                })*
            };
        }
        merge!(
            patch => next;
            estimate_options,
            allow_others_to_show_estimates,
            allow_others_to_delete_estimates,
            allow_others_to_manage_queue,
            allow_voting_after_reveal,
            always_reveal_votes,
            enable_auto_reveal,
            auto_handover_moderator,
            enable_judge,
            judge_algorithm,
            enable_structured_voting,
            voting_criteria,
            enable_ticket_queue,
            show_timer,
            enable_word_game,
            external_service,
            ticket_prefix,
        );
        normalize_settings(next)
    }
}

/// Renders a JSON scalar the way it is compared against estimate options.
/// Integral numbers lose their fractional part (`5.0` -> `"5"`).
pub fn stringify_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Some(i.to_string()),
            (None, Some(f)) if f.is_finite() && f.fract() == 0.0 => Some(format!("{:.0}", f)),
            (None, Some(f)) if f.is_finite() => Some(f.to_string()),
            _ => None,
        },
        _ => None,
    }
}

fn estimate_options_from_value<E: serde::de::Error>(value: Value) -> Result<Vec<String>, E> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                stringify_scalar(item)
                    .ok_or_else(|| E::custom("estimate options must be strings or numbers"))
            })
            .collect(),
        Value::String(s) => Ok(s.split(',').map(|o| o.trim().to_string()).collect()),
        _ => Err(E::custom("expected a list of estimate options")),
    }
}

fn deserialize_estimate_options<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    estimate_options_from_value(value)
}

fn deserialize_optional_estimate_options<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Null) | None => Ok(None),
        Some(value) => estimate_options_from_value(value).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_are_default_filled() {
        let settings: RoomSettings =
            serde_json::from_str(r#"{"enableAutoReveal": true}"#).unwrap();
        assert!(settings.enable_auto_reveal);
        assert_eq!(settings.estimate_options, default_estimate_options());
        assert_eq!(settings.voting_criteria.len(), 4);
    }

    #[test]
    fn test_numeric_options_are_stringified() {
        let settings: RoomSettings =
            serde_json::from_str(r#"{"estimateOptions": [1, 2.0, 0.5, "?"]}"#).unwrap();
        assert_eq!(settings.estimate_options, vec!["1", "2", "0.5", "?"]);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let raw = RoomSettings {
            version: 0,
            estimate_options: vec![" 1 ".into(), "2".into(), "1".into(), "".into()],
            voting_criteria: vec![VotingCriterion {
                id: "broken".into(),
                name: "Broken".into(),
                min_score: 3,
                max_score: 3,
                inverted: false,
            }],
            ticket_prefix: " proj ".into(),
            ..RoomSettings::default()
        };
        let once = normalize_settings(raw);
        assert_eq!(once.version, SETTINGS_VERSION);
        assert_eq!(once.estimate_options, vec!["1", "2"]);
        assert_eq!(once.voting_criteria, default_voting_criteria());
        assert_eq!(once.ticket_prefix, "PROJ");
        assert_eq!(normalize_settings(once.clone()), once);
    }

    #[test]
    fn test_empty_options_fall_back_to_defaults() {
        let settings = normalize_settings(RoomSettings {
            estimate_options: vec![" ".into()],
            ..RoomSettings::default()
        });
        assert_eq!(settings.estimate_options, default_estimate_options());
    }

    #[test]
    fn test_patch_only_touches_given_fields() {
        let patch: SettingsPatch = serde_json::from_str(
            r#"{"estimateOptions": [1, 2], "judgeAlgorithm": "simpleAverage"}"#,
        )
        .unwrap();
        let current = RoomSettings {
            allow_voting_after_reveal: true,
            ..RoomSettings::default()
        };
        let next = patch.apply(&current);
        assert_eq!(next.estimate_options, vec!["1", "2"]);
        assert_eq!(next.judge_algorithm, JudgeAlgorithm::SimpleAverage);
        assert!(next.allow_voting_after_reveal);
    }

    #[test]
    fn test_stringify_scalar() {
        assert_eq!(stringify_scalar(&serde_json::json!(8)), Some("8".into()));
        assert_eq!(stringify_scalar(&serde_json::json!(8.0)), Some("8".into()));
        assert_eq!(stringify_scalar(&serde_json::json!(0.5)), Some("0.5".into()));
        assert_eq!(stringify_scalar(&serde_json::json!(" ? ")), Some("?".into()));
        assert_eq!(stringify_scalar(&serde_json::json!(true)), None);
    }
}
