//! Error types for smsgate

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("System call failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cannot send signal {signal}: {reason}")]
    Signal { signal: i32, reason: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown adapter: {0}")]
    UnknownAdapter(String),

    #[error("Phone not found: {0}")]
    PhoneNotFound(i64),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Cannot create a subprocess: {0}")]
    Fork(nix::Error),

    #[error("Daemon error: {0}")]
    Daemon(String),
}

pub type Result<T> = std::result::Result<T, Error>;
