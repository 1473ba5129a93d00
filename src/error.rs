use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Presentation error: {0}")]
    Presentation(String),

    /// The tracked status message no longer exists in the channel
    #[error("Status message is gone")]
    MessageGone,
}

impl From<std::io::Error> for MonitorError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Timeout(e.to_string())
            }
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            _ => Self::Connection(e.to_string()),
        }
    }
}

pub type Result<T, E = MonitorError> = std::result::Result<T, E>;
