use thiserror::Error;

/// Crate-wide error type, one variant per error kind named in the
/// core's error-handling design: transport, protocol, server-reported,
/// timeout, cancellation, and configuration failures.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame too large: {0}")]
    FrameTooLarge(String),

    #[error("frame corrupt: {0}")]
    FrameCorrupt(String),

    #[error("server reported failure: {0}")]
    Server(String),

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
