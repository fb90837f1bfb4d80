use std::path::PathBuf;

use thiserror::Error;

use crate::state::TransportState;

/// Errors that can occur during transport operations.
///
/// End of stream is not an error; see [`crate::ReadOutcome`].
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid connection target: {0}")]
    Parse(#[from] descriptor::ParseError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("required resource missing: {}", .0.display())]
    ResourceMissing(PathBuf),

    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH connection failed: {0}")]
    Connect(String),

    #[error("SSH authentication failed: {0}")]
    Auth(String),

    #[error("SSH channel error: {0}")]
    Channel(String),

    #[error("transport is not open (state: {state})")]
    NotOpen { state: TransportState },

    #[error("transport cannot be opened from state {state}")]
    AlreadyStarted { state: TransportState },

    #[error("operation cancelled")]
    Cancelled,

    #[error("secret handoff failed: {0}")]
    Handoff(#[from] handoff::HandoffError),

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
