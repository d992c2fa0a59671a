use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Final 401 once the refresh protocol has run its course.
    #[error("Not authorized: sign in again")]
    Unauthorized,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Cache integrity violation: {0}")]
    Integrity(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }

    /// True when the caller should prompt for a fresh sign-in rather than
    /// report a network problem.
    pub fn needs_reauthentication(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}
