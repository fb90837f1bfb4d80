//! Stream plumbing shared by the transport implementations.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

/// Why an operation stopped before its future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    /// The caller's token fired.
    Caller,
    /// The transport is being closed.
    Shutdown,
}

/// Run `fut` until it completes or either token fires.
pub(crate) async fn race<F: Future>(
    cancel: &CancellationToken,
    shutdown: &CancellationToken,
    fut: F,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Caller),
        _ = shutdown.cancelled() => Err(Interrupt::Shutdown),
        out = fut => Ok(out),
    }
}

/// Splits a byte stream into lines.
///
/// Invalid UTF-8 is replaced rather than rejected, and the line terminator
/// (`\n` or `\r\n`) is stripped.
pub(crate) struct LineReader {
    inner: BufReader<Pin<Box<dyn AsyncRead + Send>>>,
    buf: Vec<u8>,
}

impl LineReader {
    pub(crate) fn new<R: AsyncRead + Send + 'static>(reader: R) -> Self {
        let boxed: Pin<Box<dyn AsyncRead + Send>> = Box::pin(reader);
        Self {
            inner: BufReader::new(boxed),
            buf: Vec::with_capacity(256),
        }
    }

    /// Next line, or `None` at end of stream.
    pub(crate) async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.inner.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}
