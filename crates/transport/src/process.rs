//! Transport over a spawned ssh client.
//!
//! The client's stdio is the session. Passwords never go on the command
//! line: the client is pointed at the `sshforge-askpass` helper, and only a
//! handoff session id is exported to it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use descriptor::ConnectionDescriptor;
use handoff::{Lease, Secret, SessionId};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::io::{race, Interrupt, LineReader};
use crate::state::{Lifecycle, TransportState};
use crate::{ReadOutcome, Transport};

/// Client binary used when no executable is configured.
pub const DEFAULT_CLIENT: &str = "ssh";

/// Subsystem requested when the target names none.
pub const DEFAULT_SUBSYSTEM: &str = "powershell";

/// File name of the askpass helper, looked up next to the current executable.
pub const ASKPASS_BIN: &str = "sshforge-askpass";

/// How long `close` waits for the client to exit after stdin is closed.
const GRACEFUL_EXIT: Duration = Duration::from_secs(2);

/// How long `close` waits for the client to die after it was killed.
const KILL_WAIT: Duration = Duration::from_secs(2);

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Options for a transport that spawns an ssh client.
#[derive(Debug)]
pub struct ProcessOptions {
    pub descriptor: ConnectionDescriptor,
    pub password: Option<Secret>,
    /// Accept any host key and never record it. Explicit opt-in only.
    pub skip_host_key_check: bool,
    /// Wrapper binary to run instead of `ssh`; it receives `ssh` as its
    /// first argument.
    pub executable: Option<PathBuf>,
    /// Askpass helper; defaults to [`default_askpass`].
    pub askpass: Option<PathBuf>,
}

impl ProcessOptions {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self {
            descriptor,
            password: None,
            skip_host_key_check: false,
            executable: None,
            askpass: None,
        }
    }

    pub fn with_password(mut self, password: Secret) -> Self {
        self.password = Some(password);
        self
    }

    pub fn skip_host_key_check(mut self, skip: bool) -> Self {
        self.skip_host_key_check = skip;
        self
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn with_askpass(mut self, askpass: impl Into<PathBuf>) -> Self {
        self.askpass = Some(askpass.into());
        self
    }
}

/// `sshforge-askpass` next to the running executable.
pub fn default_askpass() -> PathBuf {
    let name = format!("{ASKPASS_BIN}{}", std::env::consts::EXE_SUFFIX);
    match std::env::current_exe() {
        Ok(exe) => exe.with_file_name(name),
        Err(_) => PathBuf::from(name),
    }
}

/// Program, arguments and environment for the client process.
#[derive(Debug, Clone)]
pub struct ClientCommand {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, OsString)>,
    askpass: Option<PathBuf>,
}

impl ClientCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            askpass: None,
        }
    }

    /// Build the ssh invocation for `options`.
    pub fn ssh(options: &ProcessOptions) -> Self {
        let d = &options.descriptor;
        let mut command = match &options.executable {
            Some(wrapper) => Self::new(wrapper).arg("ssh"),
            None => Self::new(DEFAULT_CLIENT),
        };

        if options.skip_host_key_check {
            command = command
                .arg("-o")
                .arg("StrictHostKeyChecking=no")
                .arg("-o")
                .arg(format!("UserKnownHostsFile={NULL_DEVICE}"));
        }
        if let Some(user) = d.user() {
            command = command.arg("-l").arg(user);
        }

        command
            .arg("-p")
            .arg(d.port().to_string())
            .arg("-s")
            .arg(d.host())
            .arg(d.subsystem().unwrap_or(DEFAULT_SUBSYSTEM))
            .askpass(options.askpass.clone().unwrap_or_else(default_askpass))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Point the client at a password-prompt helper, which must exist when
    /// the transport opens. The helper learns which process to ask from
    /// the exported pid.
    pub fn askpass(self, helper: impl Into<PathBuf>) -> Self {
        let helper = helper.into();
        let mut command = self
            .env("SSH_ASKPASS", helper.clone())
            .env("SSH_ASKPASS_REQUIRE", "force")
            .env(handoff::ENV_PID, std::process::id().to_string());
        command.askpass = Some(helper);
        command
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn askpass_path(&self) -> Option<&Path> {
        self.askpass.as_deref()
    }

    /// Variables exported to the client on top of the inherited environment.
    pub fn envs(&self) -> &[(String, OsString)] {
        &self.env
    }
}

/// Transport backed by a child ssh process.
pub struct ProcessTransport {
    command: ClientCommand,
    secret: Mutex<Option<Secret>>,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    lease: Mutex<Option<Lease>>,
    session_id: Mutex<Option<SessionId>>,
    exit_code: Mutex<Option<i32>>,
    child: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    stdout: tokio::sync::Mutex<Option<LineReader>>,
    stderr: tokio::sync::Mutex<Option<LineReader>>,
}

impl ProcessTransport {
    pub fn new(options: ProcessOptions) -> Self {
        let command = ClientCommand::ssh(&options);
        Self::with_command(command, options.password)
    }

    /// Run an arbitrary client command. A `password` is published through
    /// the handoff store when the transport opens.
    pub fn with_command(command: ClientCommand, password: Option<Secret>) -> Self {
        Self {
            command,
            secret: Mutex::new(password),
            lifecycle: Lifecycle::new(),
            shutdown: CancellationToken::new(),
            lease: Mutex::new(None),
            session_id: Mutex::new(None),
            exit_code: Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
            stdout: tokio::sync::Mutex::new(None),
            stderr: tokio::sync::Mutex::new(None),
        }
    }

    pub fn command(&self) -> &ClientCommand {
        &self.command
    }

    /// Handoff session id exported to the helper, once opened with a
    /// password. Stays available after the entry itself is purged.
    pub fn session_id(&self) -> Option<SessionId> {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn spawn(&self) -> Result<()> {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .envs(self.command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(helper) = &self.command.askpass {
            if !helper.is_file() {
                return Err(TransportError::ResourceMissing(helper.clone()));
            }
        }

        let secret = self
            .secret
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(secret) = secret {
            let lease = Lease::publish(secret)?;
            command.env(handoff::ENV_SESSION_ID, lease.id().to_string());
            *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(lease.id());
            *self.lease.lock().unwrap_or_else(PoisonError::into_inner) = Some(lease);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;
        debug!(pid = ?child.id(), program = %self.command.program.display(), "client process spawned");

        *self.stdin.lock().await = child.stdin.take();
        *self.stdout.lock().await = child.stdout.take().map(LineReader::new);
        *self.stderr.lock().await = child.stderr.take().map(LineReader::new);
        *self.child.lock().await = Some(child);
        Ok(())
    }

    fn release_lease(&self) {
        if let Some(lease) = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            lease.release();
        }
    }

    /// Enter `Faulted` and drop everything that can be dropped without
    /// waiting. The child handle is killed on drop if it is busy elsewhere.
    fn fault(&self) {
        if self.lifecycle.advance(TransportState::Faulted) {
            warn!("process transport faulted");
        }
        self.shutdown.cancel();
        self.release_lease();
        self.secret
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Ok(mut child) = self.child.try_lock() {
            if let Some(child) = child.as_mut() {
                let _ = child.start_kill();
            }
        }
    }

    /// Undo a spawn that finished after the transport was closed.
    async fn discard_spawned(&self) {
        self.release_lease();
        self.stdin.lock().await.take();
        self.stdout.lock().await.take();
        self.stderr.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            debug!("discarding client spawned during close");
            if let Err(e) = child.start_kill() {
                debug!(%e, "kill failed");
            }
        }
    }

    fn record_exit(&self, status: std::process::ExitStatus) {
        debug!(code = ?status.code(), "client process exited");
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner) = status.code();
    }

    /// Collect the exit status once stdout has ended.
    async fn reap(&self, cancel: &CancellationToken) -> Result<()> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };
        match race(cancel, &self.shutdown, child.wait()).await {
            Ok(Ok(status)) => {
                self.record_exit(status);
                *guard = None;
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(%e, "failed to reap client process");
                Ok(())
            }
            Err(Interrupt::Caller) => {
                drop(guard);
                self.fault();
                Err(TransportError::Cancelled)
            }
            Err(Interrupt::Shutdown) => Ok(()),
        }
    }

    async fn read_line(
        &self,
        reader: &tokio::sync::Mutex<Option<LineReader>>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        self.lifecycle.ensure_open()?;
        let mut guard = reader.lock().await;
        let Some(lines) = guard.as_mut() else {
            return Ok(None);
        };
        match race(cancel, &self.shutdown, lines.next_line()).await {
            Ok(Ok(Some(line))) => Ok(Some(line)),
            Ok(Ok(None)) => {
                *guard = None;
                Ok(None)
            }
            Ok(Err(e)) => {
                drop(guard);
                self.fault();
                Err(TransportError::Io(e))
            }
            Err(Interrupt::Caller) => {
                drop(guard);
                self.fault();
                Err(TransportError::Cancelled)
            }
            Err(Interrupt::Shutdown) => Ok(None),
        }
    }

    /// Wait for the child with a bound; kill it if it overstays.
    async fn stop_child(&self, cancel: &CancellationToken) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        let exited = tokio::select! {
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout(GRACEFUL_EXIT, child.wait()) => res.ok().and_then(|r| r.ok()),
        };
        if let Some(status) = exited {
            self.record_exit(status);
            return;
        }

        debug!("client process still running, killing it");
        if let Err(e) = child.start_kill() {
            debug!(%e, "kill failed");
        }
        let reaped = tokio::select! {
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout(KILL_WAIT, child.wait()) => res.ok().and_then(|r| r.ok()),
        };
        match reaped {
            Some(status) => self.record_exit(status),
            // Dropping the handle leaves the final reap to the runtime.
            None => warn!("client process did not exit after kill"),
        }
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        self.lifecycle.begin_open()?;
        if cancel.is_cancelled() {
            self.fault();
            return Err(TransportError::Cancelled);
        }

        match self.spawn().await {
            Ok(()) => {
                if self.lifecycle.advance(TransportState::Open) {
                    info!(program = %self.command.program.display(), "process transport open");
                    Ok(())
                } else {
                    // A close landed while spawning and found nothing to stop.
                    self.discard_spawned().await;
                    Err(TransportError::NotOpen {
                        state: self.lifecycle.get(),
                    })
                }
            }
            Err(e) => {
                self.fault();
                Err(e)
            }
        }
    }

    async fn read_output(&self, cancel: &CancellationToken) -> Result<ReadOutcome> {
        match self.read_line(&self.stdout, cancel).await? {
            Some(line) => {
                // Output means authentication is over; the secret has no
                // further use.
                self.release_lease();
                Ok(ReadOutcome::Line(line))
            }
            None => {
                self.reap(cancel).await?;
                Ok(ReadOutcome::EndOfStream)
            }
        }
    }

    async fn read_error(&self, cancel: &CancellationToken) -> Result<ReadOutcome> {
        Ok(self
            .read_line(&self.stderr, cancel)
            .await?
            .map_or(ReadOutcome::EndOfStream, ReadOutcome::Line))
    }

    async fn write_input(&self, line: &str, cancel: &CancellationToken) -> Result<()> {
        self.lifecycle.ensure_open()?;
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(TransportError::NotOpen {
                state: self.lifecycle.get(),
            });
        };

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        match race(cancel, &self.shutdown, write).await {
            Ok(result) => result.map_err(TransportError::Io),
            Err(Interrupt::Caller) => {
                drop(guard);
                self.fault();
                Err(TransportError::Cancelled)
            }
            Err(Interrupt::Shutdown) => Err(TransportError::NotOpen {
                state: self.lifecycle.get(),
            }),
        }
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        self.shutdown.cancel();
        self.release_lease();

        // Closing stdin is the cooperative stop signal.
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        self.stop_child(cancel).await;
        self.stdout.lock().await.take();
        self.stderr.lock().await.take();

        self.lifecycle.advance(TransportState::Closed);
        info!("process transport closed");
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.lifecycle.get()
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transport_name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(target: &str) -> ProcessOptions {
        ProcessOptions::new(descriptor::parse(target).unwrap()).with_askpass("/opt/askpass")
    }

    #[test]
    fn test_ssh_args_minimal() {
        let cmd = ClientCommand::ssh(&options("host"));
        assert_eq!(cmd.program(), Path::new("ssh"));
        assert_eq!(cmd.args(), ["-p", "22", "-s", "host", "powershell"]);
        assert_eq!(cmd.askpass_path(), Some(Path::new("/opt/askpass")));
    }

    #[test]
    fn test_ssh_args_full() {
        let opts = options("admin@corp@Server:2222 pwsh").skip_host_key_check(true);
        let cmd = ClientCommand::ssh(&opts);
        assert_eq!(
            cmd.args(),
            [
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                &format!("UserKnownHostsFile={NULL_DEVICE}"),
                "-l",
                "admin@corp",
                "-p",
                "2222",
                "-s",
                "Server",
                "pwsh",
            ]
        );
    }

    #[test]
    fn test_host_key_check_is_on_by_default() {
        let cmd = ClientCommand::ssh(&options("host"));
        assert!(!cmd.args().iter().any(|a| a.contains("StrictHostKeyChecking")));
    }

    #[test]
    fn test_wrapper_executable_gets_ssh_first() {
        let opts = options("vm01").with_executable("hvc.exe");
        let cmd = ClientCommand::ssh(&opts);
        assert_eq!(cmd.program(), Path::new("hvc.exe"));
        assert_eq!(cmd.args().first().map(String::as_str), Some("ssh"));
    }

    #[test]
    fn test_ipv6_host_passed_without_brackets() {
        let cmd = ClientCommand::ssh(&options("[::1]:2200"));
        assert_eq!(cmd.args(), ["-p", "2200", "-s", "::1", "powershell"]);
    }

    #[test]
    fn test_askpass_environment() {
        let opts = options("user@host").with_password(Secret::new("hunter2"));
        let transport = ProcessTransport::new(opts);
        let env = transport.command().envs();
        let value = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.to_string_lossy().into_owned())
        };
        assert_eq!(value("SSH_ASKPASS").as_deref(), Some("/opt/askpass"));
        assert_eq!(value("SSH_ASKPASS_REQUIRE").as_deref(), Some("force"));
        assert_eq!(
            value(handoff::ENV_PID),
            Some(std::process::id().to_string())
        );
        // The session id only exists once the transport opens.
        assert_eq!(value(handoff::ENV_SESSION_ID), None);
        assert!(!env.iter().any(|(_, v)| v.to_string_lossy().contains("hunter2")));
    }

    #[test]
    fn test_no_askpass_environment_without_helper() {
        let cmd = ClientCommand::new("ssh").env("LC_ALL", "C");
        assert_eq!(cmd.envs(), [("LC_ALL".to_string(), OsString::from("C"))]);
    }

    #[test]
    fn test_password_not_in_args() {
        let opts = options("user@host").with_password(Secret::new("hunter2"));
        let transport = ProcessTransport::new(opts);
        assert!(!transport.command().args().iter().any(|a| a.contains("hunter2")));
        assert!(!format!("{:?}", transport.command()).contains("hunter2"));
    }

    #[test]
    fn test_default_askpass_name() {
        let path = default_askpass();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(ASKPASS_BIN));
    }

    #[tokio::test]
    async fn test_missing_askpass_faults() {
        let transport = ProcessTransport::with_command(
            ClientCommand::new("sh").askpass("/nonexistent/sshforge-askpass"),
            Some(Secret::new("pw")),
        );
        let err = transport.open(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::ResourceMissing(_)));
        assert_eq!(transport.state(), TransportState::Faulted);
        // Nothing was published before the failure.
        assert!(transport.session_id().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_purges_secret() {
        let transport = ProcessTransport::with_command(
            ClientCommand::new("/nonexistent/ssh-client"),
            Some(Secret::new("pw")),
        );
        let err = transport.open(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn { .. }));
        assert_eq!(transport.state(), TransportState::Faulted);

        let id = transport.session_id().expect("secret was published");
        assert!(!handoff::store().contains(&id));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_password_with_line_break_refused() {
        let transport = ProcessTransport::with_command(
            ClientCommand::new("sh"),
            Some(Secret::new("pass\nword")),
        );
        let err = transport.open(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Handoff(handoff::HandoffError::LineBreakInSecret)
        ));
        assert_eq!(transport.state(), TransportState::Faulted);
        assert!(transport.session_id().is_none());
    }

    #[tokio::test]
    async fn test_open_with_cancelled_token() {
        let transport = ProcessTransport::with_command(ClientCommand::new("sh"), None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            transport.open(&cancel).await,
            Err(TransportError::Cancelled)
        ));
        assert_eq!(transport.state(), TransportState::Faulted);
    }

    #[tokio::test]
    async fn test_close_before_open() {
        let transport = ProcessTransport::with_command(ClientCommand::new("sh"), None);
        let cancel = CancellationToken::new();
        transport.close(&cancel).await.unwrap();
        transport.close(&cancel).await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(matches!(
            transport.open(&cancel).await,
            Err(TransportError::AlreadyStarted { .. })
        ));
    }
}
