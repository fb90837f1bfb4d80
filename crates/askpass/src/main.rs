//! `SSH_ASKPASS` helper for sshforge.
//!
//! The ssh client runs this with the prompt text as its argument and reads
//! the password from our stdout. The password itself is never in our
//! environment: we only get the parent's pid and a session id, and fetch the
//! secret once over the parent's local handoff socket.

use std::process::ExitCode;

use handoff::{fetch, HandoffError, SessionId, ENV_PID, ENV_SESSION_ID};
use tokio::io::AsyncWriteExt;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        // Nothing to answer with; ssh treats this as a declined prompt.
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("sshforge-askpass: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<bool, HandoffError> {
    let pid: u32 = std::env::var(ENV_PID)
        .ok()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| HandoffError::Protocol(format!("{ENV_PID} is not set")))?;

    // No session id means the parent had no password to hand over.
    let Ok(raw_id) = std::env::var(ENV_SESSION_ID) else {
        return Ok(false);
    };
    let id: SessionId = raw_id.parse()?;

    let Some(secret) = fetch(pid, &id).await? else {
        return Ok(false);
    };

    let mut stdout = tokio::io::stdout();
    stdout.write_all(secret.expose().as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(true)
}
