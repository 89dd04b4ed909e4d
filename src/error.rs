use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Load(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Invalid user name")]
    InvalidUserName,
    #[error("Could not allocate a free room key")]
    KeySpaceExhausted,
    #[error("Room actor unavailable: {0}")]
    ActorUnavailable(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Web server/handler error: {0}")]
    Web(#[from] crate::web::WebError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration parsing error: {0}")]
    ConfigParsing(#[from] config::ConfigError),
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
