use thiserror::Error;

/// Errors produced by the intercom relay.
#[derive(Debug, Error)]
pub enum IntercomError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("user already registered: {0}")]
    AlreadyRegistered(String),

    #[error("connection already bound to user: {0}")]
    AlreadyBound(String),

    #[error("cannot unbind {0}: it is not yours")]
    NotOwner(String),

    #[error("command already exists: {0}")]
    DuplicateCommand(String),

    #[error("no such user: {0}")]
    NoSuchUser(String),

    #[error("no such command (possibly timed out): {0}")]
    NoSuchCommand(String),

    #[error("connection is not registered yet")]
    NotRegistered,

    #[error("connection is closed")]
    Closed,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("peer disconnected before answering")]
    Disconnected,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl IntercomError {
    /// Whether the error reports a missing user or command rather than a
    /// conflict or failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            IntercomError::NoSuchUser(_)
                | IntercomError::NoSuchCommand(_)
                | IntercomError::NotRegistered
        )
    }
}

impl From<serde_json::Error> for IntercomError {
    fn from(e: serde_json::Error) -> Self {
        IntercomError::Codec(e.to_string())
    }
}

pub type IntercomResult<T> = Result<T, IntercomError>;
