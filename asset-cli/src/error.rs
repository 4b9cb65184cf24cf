use session_coordinator::{BackendError, SendError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Authentication failed: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("Service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Not signed in (set ASSETCTL_USERNAME and ASSETCTL_PASSWORD, or pass --username/--password)")]
    NotSignedIn,
}

pub type Result<T> = std::result::Result<T, CliError>;
