use thiserror::Error;

/// Error kinds that callers branch on. Transport and data-absent
/// failures stay local to the tick that saw them; validation drops the
/// offending record; persistence aborts the candidate; config aborts
/// startup.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("data absent: {0}")]
    DataAbsent(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BotError::Transport(format!("timeout: {}", e))
        } else {
            BotError::Transport(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for BotError {
    fn from(e: rusqlite::Error) -> Self {
        BotError::Persistence(e.to_string())
    }
}
