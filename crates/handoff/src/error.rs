use thiserror::Error;

/// Errors that can occur while handing a secret to a helper process.
#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("no handoff entry for this session")]
    NotFound,

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("handoff protocol error: {0}")]
    Protocol(String),

    #[error("secret contains a line break and cannot be handed off")]
    LineBreakInSecret,

    #[error("handoff timed out")]
    Timeout,

    #[error("secret handoff is not supported on this platform")]
    Unsupported,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HandoffError>;
