mod connect;
mod error;
mod logging;
mod relay;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use transport::CancellationToken;

use connect::{Overrides, Plan, TransportKind};
use error::{CliError, Result};

/// Grace period for background work (a blocked stdin read) at exit.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(
    name = "sshforge",
    version,
    about = "Interactive remote session over SSH"
)]
struct Args {
    /// Target as `[user@]host[:port][ subsystem]`. IPv6 hosts go in brackets.
    target: String,

    /// Port, overriding any in the target
    #[arg(short, long)]
    port: Option<u16>,

    /// User name, overriding any in the target
    #[arg(short = 'l', long)]
    user: Option<String>,

    /// Remote subsystem, overriding any in the target
    #[arg(short, long)]
    subsystem: Option<String>,

    /// Accept any host key without recording it (insecure)
    #[arg(long, default_value_t = false)]
    skip_host_key_check: bool,

    /// How to reach the remote host
    #[arg(long, value_enum, default_value_t = TransportKind::Process)]
    transport: TransportKind,

    /// Client binary to run instead of `ssh`; it receives `ssh` as its first argument
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Askpass helper handed to the ssh client
    #[arg(long, env = "SSHFORGE_ASKPASS")]
    askpass: Option<PathBuf>,

    /// Prompt for a password instead of reading SSHFORGE_PASSWORD
    #[arg(long, default_value_t = false)]
    password_prompt: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = logging::init_logging();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("sshforge: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(run(args));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(%e, "session failed");
            eprintln!("sshforge: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let descriptor = connect::resolve_target(
        &args.target,
        Overrides {
            port: args.port,
            user: args.user,
            subsystem: args.subsystem,
        },
    )?;
    let password = connect::password(args.password_prompt, &descriptor).await?;

    let plan = Plan {
        descriptor,
        kind: args.transport,
        skip_host_key_check: args.skip_host_key_check,
        executable: args.executable,
        askpass: args.askpass,
    };
    info!(
        kind = %plan.kind,
        host = %plan.descriptor.host(),
        port = plan.descriptor.port(),
        "starting session"
    );
    let transport = connect::build(plan, password)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            on_interrupt.cancel();
        }
    });

    if let Err(e) = transport.open(&cancel).await {
        return Err(match e {
            transport::TransportError::Cancelled => CliError::Interrupted,
            e => e.into(),
        });
    }

    let exit_code = relay::relay(
        transport,
        tokio::io::stdin(),
        tokio::io::stdout(),
        tokio::io::stderr(),
        cancel,
    )
    .await?;

    info!(?exit_code, "session ended");
    Ok(exit_code.map_or(0, |code| u8::try_from(code).unwrap_or(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_defaults() {
        let args = Args::try_parse_from(["sshforge", "user@host"]).unwrap();
        assert_eq!(args.target, "user@host");
        assert_eq!(args.transport, TransportKind::Process);
        assert!(!args.skip_host_key_check);
        assert!(!args.password_prompt);
    }

    #[test]
    fn args_full() {
        let args = Args::try_parse_from([
            "sshforge",
            "host pwsh",
            "-p",
            "2222",
            "-l",
            "admin",
            "-s",
            "cmd",
            "--skip-host-key-check",
            "--transport",
            "session",
            "--password-prompt",
        ])
        .unwrap();
        assert_eq!(args.port, Some(2222));
        assert_eq!(args.user.as_deref(), Some("admin"));
        assert_eq!(args.subsystem.as_deref(), Some("cmd"));
        assert!(args.skip_host_key_check);
        assert_eq!(args.transport, TransportKind::Session);
        assert!(args.password_prompt);
    }

    #[test]
    fn args_require_target() {
        assert!(Args::try_parse_from(["sshforge"]).is_err());
    }

    #[test]
    fn args_reject_unknown_transport() {
        assert!(Args::try_parse_from(["sshforge", "host", "--transport", "telnet"]).is_err());
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
