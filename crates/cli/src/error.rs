use thiserror::Error;
use transport::TransportError;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Target(#[from] descriptor::ParseError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("password prompt failed: {0}")]
    Prompt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interrupted")]
    Interrupted,
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Target(_) | Self::Transport(TransportError::Parse(_)) => 2,
            Self::Interrupted | Self::Transport(TransportError::Cancelled) => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;
