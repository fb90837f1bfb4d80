//! Transports for remote line-oriented sessions.
//!
//! A transport opens a session to a [`descriptor::ConnectionDescriptor`] and
//! exposes its stdin, stdout and stderr as lines. Two implementations:
//!
//! - [`ProcessTransport`]: spawns the system ssh client with the session on
//!   its stdio, handing any password to it through the askpass helper.
//! - [`SessionTransport`]: speaks SSH in-process via russh.
//!
//! Every blocking operation takes a [`CancellationToken`]. Cancelling it
//! faults the transport and releases its resources.

pub mod error;
mod io;
pub mod process;
pub mod session;
pub mod state;

pub use error::{Result, TransportError};
pub use process::{ClientCommand, ProcessOptions, ProcessTransport};
pub use session::{HostKeyPolicy, SessionMode, SessionOptions, SessionTransport};
pub use state::TransportState;
pub use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

/// Result of reading one line from a session stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A line with its terminator stripped.
    Line(String),
    /// The stream is finished; later reads return this again.
    EndOfStream,
}

impl ReadOutcome {
    pub fn into_line(self) -> Option<String> {
        match self {
            Self::Line(line) => Some(line),
            Self::EndOfStream => None,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

/// A remote session with line-oriented stdio.
///
/// Methods take `&self` so that output, error and input can be driven from
/// separate tasks. Each stream serves one reader at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the session. Only valid once, from `Created`.
    async fn open(&self, cancel: &CancellationToken) -> Result<()>;

    /// Next line of remote stdout.
    async fn read_output(&self, cancel: &CancellationToken) -> Result<ReadOutcome>;

    /// Next line of remote stderr.
    async fn read_error(&self, cancel: &CancellationToken) -> Result<ReadOutcome>;

    /// Send `line` followed by a newline.
    async fn write_input(&self, line: &str, cancel: &CancellationToken) -> Result<()>;

    /// Stop the session and release its resources. Idempotent.
    async fn close(&self, cancel: &CancellationToken) -> Result<()>;

    fn state(&self) -> TransportState;

    /// Remote exit status, once known.
    fn exit_code(&self) -> Option<i32>;

    /// Short name for logs.
    fn transport_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_outcome_into_line() {
        assert_eq!(
            ReadOutcome::Line("x".into()).into_line().as_deref(),
            Some("x")
        );
        assert!(ReadOutcome::EndOfStream.into_line().is_none());
        assert!(ReadOutcome::EndOfStream.is_end_of_stream());
    }

    #[test]
    fn test_transport_is_object_safe() {
        fn assert_dyn(_: Option<Box<dyn Transport>>) {}
        assert_dyn(None);
    }
}
