//! Shuttles lines between the local terminal and an open transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use transport::{CancellationToken, ReadOutcome, Transport, TransportError};

use crate::error::{CliError, Result};

/// How long remote stderr may keep draining after stdout has ended.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// Relay until the remote output ends, then close the transport.
///
/// Local input ending does not end the session; the remote side decides when
/// it is done. Returns the remote exit code when one was reported.
pub async fn relay<I, O, E>(
    transport: Arc<dyn Transport>,
    input: I,
    output: O,
    errors: E,
    cancel: CancellationToken,
) -> Result<Option<i32>>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
    E: AsyncWrite + Unpin + Send + 'static,
{
    let input_task = tokio::spawn(forward_input(
        Arc::clone(&transport),
        input,
        cancel.clone(),
    ));
    let error_task = tokio::spawn(copy_lines(
        Arc::clone(&transport),
        errors,
        cancel.clone(),
        Stream::Error,
    ));

    let outcome = copy_lines(
        Arc::clone(&transport),
        output,
        cancel.clone(),
        Stream::Output,
    )
    .await;

    input_task.abort();
    drain(error_task).await;

    transport.close(&cancel).await?;
    debug!(
        transport = transport.transport_name(),
        state = %transport.state(),
        "session finished"
    );

    match outcome {
        Ok(()) => Ok(transport.exit_code()),
        Err(TransportError::Cancelled) => Err(CliError::Interrupted),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Output,
    Error,
}

async fn copy_lines<W>(
    transport: Arc<dyn Transport>,
    mut sink: W,
    cancel: CancellationToken,
    stream: Stream,
) -> std::result::Result<(), TransportError>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let next = match stream {
            Stream::Output => transport.read_output(&cancel).await?,
            Stream::Error => transport.read_error(&cancel).await?,
        };
        let ReadOutcome::Line(line) = next else {
            break;
        };
        sink.write_all(line.as_bytes()).await?;
        sink.write_all(b"\n").await?;
        sink.flush().await?;
    }
    debug!(?stream, "remote stream ended");
    Ok(())
}

async fn forward_input<I>(transport: Arc<dyn Transport>, input: I, cancel: CancellationToken)
where
    I: AsyncRead + Unpin + Send,
{
    let mut lines = BufReader::new(input).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Err(e) = transport.write_input(&line, &cancel).await {
                    debug!(%e, "stopped forwarding input");
                    return;
                }
            }
            Ok(None) => {
                debug!("local input ended");
                return;
            }
            Err(e) => {
                warn!(%e, "failed to read local input");
                return;
            }
        }
    }
}

async fn drain(mut task: JoinHandle<std::result::Result<(), TransportError>>) {
    match tokio::time::timeout(STDERR_DRAIN, &mut task).await {
        Ok(Ok(Err(e))) => debug!(%e, "stderr relay stopped"),
        Ok(_) => {}
        Err(_) => task.abort(),
    }
}
