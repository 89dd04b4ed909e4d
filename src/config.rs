use crate::auth::MAX_TOKEN_TTL_HOURS;
use crate::error::{ConfigError, Result as AppResult};
use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(deserialize_with = "deserialize_string_or_list")]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub token_ttl_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomsConfig {
    /// How long a room actor with no sessions stays resident.
    pub idle_timeout_seconds: u64,
    pub channel_buffer_size: usize,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 3600,
            channel_buffer_size: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub rooms: RoomsConfig,
}

pub fn load_settings() -> AppResult<AppSettings> {
    let defaults = RoomsConfig::default();
    let settings = Config::builder()
        .set_default("server.port", 8080)?
        .set_default("server.cors_origins", Vec::<String>::new())?
        .set_default("session.token_ttl_hours", 6)?
        .set_default("rooms.idle_timeout_seconds", defaults.idle_timeout_seconds)?
        .set_default("rooms.channel_buffer_size", defaults.channel_buffer_size as u64)?
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("SPRINTROOM")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.cors_origins")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings: AppSettings = settings
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &AppSettings) -> Result<(), ConfigError> {
    if !(1..=MAX_TOKEN_TTL_HOURS).contains(&settings.session.token_ttl_hours) {
        return Err(ConfigError::InvalidValue(format!(
            "session.token_ttl_hours must be between 1 and {}",
            MAX_TOKEN_TTL_HOURS
        )));
    }
    if settings.rooms.channel_buffer_size == 0 {
        return Err(ConfigError::InvalidValue(
            "rooms.channel_buffer_size must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn deserialize_string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_json::Value;

    let value = Value::deserialize(deserializer)?;
    let items = match value {
        Value::String(s) => s.split(',').map(|item| item.to_string()).collect(),
        Value::Array(arr) => arr
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(D::Error::custom("Array must contain only strings")),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(D::Error::custom("Expected string or array of strings")),
    };

    Ok(items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect())
}
