//! Transport over an in-process russh client session.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use descriptor::ConnectionDescriptor;
use handoff::Secret;
use russh::keys::PublicKey;
use russh::{client, ChannelMsg, ChannelReadHalf, Disconnect};
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::io::{race, Interrupt, LineReader};
use crate::state::{Lifecycle, TransportState};
use crate::{ReadOutcome, Transport};

/// Remote command for exec-channel mode.
pub const EXEC_COMMAND: &str = "pwsh -NoProfile -SSHServerMode";

const TERMINAL: &str = "xterm";
const TERMINAL_COLS: u32 = 80;
const TERMINAL_ROWS: u32 = 24;
const TERMINAL_WIDTH_PX: u32 = 800;
const TERMINAL_HEIGHT_PX: u32 = 600;

/// Buffer between the channel pump and line readers.
const PIPE_CAPACITY: usize = 64 * 1024;

/// stderr chunks queued ahead of a slow reader before new ones are dropped.
const STDERR_BACKLOG: usize = 64;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time the pump gets to collect the exit status after disconnect.
const PUMP_DRAIN: Duration = Duration::from_millis(500);

/// How the server's host key is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// The key must already be in `~/.ssh/known_hosts`.
    #[default]
    Strict,
    /// Accept any key (insecure, explicit opt-in).
    AcceptAll,
}

impl std::fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::AcceptAll => write!(f, "accept-all"),
        }
    }
}

/// Channel layout used for the remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// PTY running the named subsystem; stderr is merged into stdout.
    Shell,
    /// `pwsh` in server mode with separate stdout and stderr.
    Exec,
}

impl SessionMode {
    pub fn for_descriptor(descriptor: &ConnectionDescriptor) -> Self {
        if descriptor.subsystem().is_some() {
            Self::Shell
        } else {
            Self::Exec
        }
    }
}

/// Options for an in-process SSH session.
#[derive(Debug)]
pub struct SessionOptions {
    pub descriptor: ConnectionDescriptor,
    pub password: Option<Secret>,
    pub host_key_policy: HostKeyPolicy,
}

impl SessionOptions {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self {
            descriptor,
            password: None,
            host_key_policy: HostKeyPolicy::Strict,
        }
    }

    pub fn with_password(mut self, password: Secret) -> Self {
        self.password = Some(password);
        self
    }

    pub fn skip_host_key_check(mut self, skip: bool) -> Self {
        self.host_key_policy = if skip {
            HostKeyPolicy::AcceptAll
        } else {
            HostKeyPolicy::Strict
        };
        self
    }
}

struct Handler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for Handler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAll => Ok(true),
            HostKeyPolicy::Strict => {
                match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        warn!(host = %self.host, port = self.port, "host key not in known_hosts");
                        Ok(false)
                    }
                    Err(e) => {
                        warn!(host = %self.host, port = self.port, %e, "host key rejected");
                        Ok(false)
                    }
                }
            }
        }
    }
}

type Writer = Pin<Box<dyn AsyncWrite + Send>>;

/// Everything a successful `open` hands over to the transport.
struct Established {
    handle: client::Handle<Handler>,
    writer: Writer,
    stdout: LineReader,
    stderr: Option<LineReader>,
    pump: JoinHandle<()>,
}

/// Transport backed by a russh client session.
pub struct SessionTransport {
    descriptor: ConnectionDescriptor,
    user: String,
    mode: SessionMode,
    policy: HostKeyPolicy,
    secret: Mutex<Option<Secret>>,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    /// Fired by the pump when the channel is gone.
    finished: CancellationToken,
    exit_code: Arc<Mutex<Option<i32>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    handle: tokio::sync::Mutex<Option<client::Handle<Handler>>>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    stdout: tokio::sync::Mutex<Option<LineReader>>,
    stderr: tokio::sync::Mutex<Option<LineReader>>,
}

impl SessionTransport {
    /// Fails with `Configuration` when the descriptor has no user.
    pub fn new(options: SessionOptions) -> Result<Self> {
        let user = options
            .descriptor
            .user()
            .map(str::to_owned)
            .ok_or_else(|| {
                TransportError::Configuration("an SSH session requires a user name".into())
            })?;

        Ok(Self {
            mode: SessionMode::for_descriptor(&options.descriptor),
            descriptor: options.descriptor,
            user,
            policy: options.host_key_policy,
            secret: Mutex::new(options.password),
            lifecycle: Lifecycle::new(),
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            exit_code: Arc::new(Mutex::new(None)),
            pump: Mutex::new(None),
            handle: tokio::sync::Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            stdout: tokio::sync::Mutex::new(None),
            stderr: tokio::sync::Mutex::new(None),
        })
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn host_key_policy(&self) -> HostKeyPolicy {
        self.policy
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let host = self.descriptor.host();
        let port = self.descriptor.port();
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TransportError::Connect(format!("failed to resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| TransportError::Connect(format!("no addresses found for {host}")))
    }

    async fn establish(&self) -> Result<Established> {
        let addr = self.resolve().await?;

        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = Handler {
            host: self.descriptor.host().to_owned(),
            port: self.descriptor.port(),
            policy: self.policy,
        };

        let mut handle = tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, addr, handler))
            .await
            .map_err(|_| TransportError::Connect(format!("connection to {addr} timed out")))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(%addr, "SSH connection established");

        self.authenticate(&mut handle).await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Channel(format!("failed to open channel: {e}")))?;

        match self.mode {
            SessionMode::Shell => {
                channel
                    .request_pty(
                        false,
                        TERMINAL,
                        TERMINAL_COLS,
                        TERMINAL_ROWS,
                        TERMINAL_WIDTH_PX,
                        TERMINAL_HEIGHT_PX,
                        &[],
                    )
                    .await
                    .map_err(|e| TransportError::Channel(format!("PTY request failed: {e}")))?;
                let subsystem = self.descriptor.subsystem().unwrap_or_default();
                channel
                    .exec(true, subsystem)
                    .await
                    .map_err(|e| TransportError::Channel(format!("failed to start remote shell: {e}")))?;
            }
            SessionMode::Exec => {
                channel
                    .exec(true, EXEC_COMMAND)
                    .await
                    .map_err(|e| TransportError::Channel(format!("failed to exec command: {e}")))?;
            }
        }

        // Split so the pump drains window adjustments while we write.
        let (read_half, write_half) = channel.split();
        let writer: Writer = Box::pin(write_half.make_writer());

        let (stdout_tx, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_tx, stderr_rx) = match self.mode {
            SessionMode::Shell => (None, None),
            SessionMode::Exec => {
                let (tx, rx) = tokio::io::duplex(PIPE_CAPACITY);
                (Some(stderr_feed(tx)), Some(LineReader::new(rx)))
            }
        };

        let router = Router {
            stdout: Some(stdout_tx),
            stderr: stderr_tx,
            merge_stderr: self.mode == SessionMode::Shell,
            exit_code: Arc::clone(&self.exit_code),
        };
        let pump = tokio::spawn(pump(read_half, router, self.finished.clone()));

        Ok(Established {
            handle,
            writer,
            stdout: LineReader::new(stdout_rx),
            stderr: stderr_rx,
            pump,
        })
    }

    async fn authenticate(&self, handle: &mut client::Handle<Handler>) -> Result<()> {
        let secret = self
            .secret
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let result = match &secret {
            Some(password) => handle.authenticate_password(&self.user, password.expose()).await,
            None => handle.authenticate_none(&self.user).await,
        }
        .map_err(|e| TransportError::Auth(e.to_string()))?;
        drop(secret);

        if !result.success() {
            return Err(TransportError::Auth(format!(
                "server rejected credentials for {}",
                self.user
            )));
        }
        info!(user = %self.user, "SSH authentication successful");
        Ok(())
    }

    fn abort_pump(&self) {
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }

    fn fault(&self) {
        if self.lifecycle.advance(TransportState::Faulted) {
            warn!("session transport faulted");
        }
        self.shutdown.cancel();
        self.abort_pump();
        // Dropping the handle tears the connection down.
        if let Ok(mut handle) = self.handle.try_lock() {
            handle.take();
        }
        self.secret
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    async fn read_line(
        &self,
        reader: &tokio::sync::Mutex<Option<LineReader>>,
        cancel: &CancellationToken,
    ) -> Result<ReadOutcome> {
        self.lifecycle.ensure_open()?;
        let mut guard = reader.lock().await;
        let Some(lines) = guard.as_mut() else {
            return Ok(ReadOutcome::EndOfStream);
        };
        match race(cancel, &self.shutdown, lines.next_line()).await {
            Ok(Ok(Some(line))) => Ok(ReadOutcome::Line(line)),
            Ok(Ok(None)) => {
                *guard = None;
                Ok(ReadOutcome::EndOfStream)
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
            Err(Interrupt::Shutdown) => Ok(ReadOutcome::EndOfStream),
        }
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.abort_pump();
    }
}

#[async_trait]
impl Transport for SessionTransport {
    async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        self.lifecycle.begin_open()?;
        info!(
            host = %self.descriptor.host(),
            port = self.descriptor.port(),
            mode = ?self.mode,
            policy = %self.policy,
            "opening SSH session"
        );

        let established = match race(cancel, &self.shutdown, self.establish()).await {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => {
                self.fault();
                return Err(e);
            }
            Err(Interrupt::Caller) => {
                self.fault();
                return Err(TransportError::Cancelled);
            }
            Err(Interrupt::Shutdown) => {
                self.fault();
                return Err(TransportError::NotOpen {
                    state: self.lifecycle.get(),
                });
            }
        };

        *self.handle.lock().await = Some(established.handle);
        *self.writer.lock().await = Some(established.writer);
        *self.stdout.lock().await = Some(established.stdout);
        *self.stderr.lock().await = established.stderr;
        *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(established.pump);

        if self.lifecycle.advance(TransportState::Open) {
            info!("session transport open");
            Ok(())
        } else {
            // Closed while connecting: nothing else will tear this down.
            self.abort_pump();
            self.writer.lock().await.take();
            self.stdout.lock().await.take();
            self.stderr.lock().await.take();
            self.handle.lock().await.take();
            Err(TransportError::NotOpen {
                state: self.lifecycle.get(),
            })
        }
    }

    async fn read_output(&self, cancel: &CancellationToken) -> Result<ReadOutcome> {
        self.read_line(&self.stdout, cancel).await
    }

    async fn read_error(&self, cancel: &CancellationToken) -> Result<ReadOutcome> {
        if self.mode == SessionMode::Exec {
            return self.read_line(&self.stderr, cancel).await;
        }

        // Merged into stdout; report end of stream once the channel is gone.
        self.lifecycle.ensure_open()?;
        match race(cancel, &self.shutdown, self.finished.cancelled()).await {
            Ok(()) | Err(Interrupt::Shutdown) => Ok(ReadOutcome::EndOfStream),
            Err(Interrupt::Caller) => {
                self.fault();
                Err(TransportError::Cancelled)
            }
        }
    }

    async fn write_input(&self, line: &str, cancel: &CancellationToken) -> Result<()> {
        self.lifecycle.ensure_open()?;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::NotOpen {
                state: self.lifecycle.get(),
            });
        };

        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        match race(cancel, &self.shutdown, write).await {
            Ok(result) => result.map_err(|e| TransportError::Channel(format!("write failed: {e}"))),
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

        // EOF on the remote stdin.
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, writer.shutdown()).await;
        }

        if let Some(handle) = self.handle.lock().await.take() {
            let disconnect = handle.disconnect(Disconnect::ByApplication, "", "en");
            tokio::select! {
                _ = cancel.cancelled() => debug!("disconnect skipped on cancellation"),
                res = tokio::time::timeout(DISCONNECT_TIMEOUT, disconnect) => match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(%e, "SSH disconnect failed"),
                    Err(_) => debug!("SSH disconnect timed out"),
                },
            }
        }

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(PUMP_DRAIN, &mut pump).await.is_err() {
                pump.abort();
            }
        }

        self.stdout.lock().await.take();
        self.stderr.lock().await.take();
        self.lifecycle.advance(TransportState::Closed);
        info!("session transport closed");
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.lifecycle.get()
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transport_name(&self) -> &'static str {
        "session"
    }
}

/// Sends channel messages to the pipes the line readers consume.
///
/// stdout is written in place, so an unread stdout holds back the channel.
/// stderr is queued to its own writer and dropped once the queue is full, so
/// an unread stderr never stalls stdout.
struct Router {
    stdout: Option<DuplexStream>,
    stderr: Option<mpsc::Sender<Vec<u8>>>,
    merge_stderr: bool,
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl Router {
    /// Handle one message. Returns `false` once the channel is finished.
    async fn route(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => Self::forward(&mut self.stdout, &data).await,
            ChannelMsg::ExtendedData { data, ext: 1 } => {
                if self.merge_stderr {
                    Self::forward(&mut self.stdout, &data).await;
                } else {
                    self.queue_stderr(&data);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                debug!(exit_status, "remote exit status");
                *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner) =
                    i32::try_from(exit_status).ok();
            }
            ChannelMsg::Failure => {
                warn!("remote rejected the session request");
                return false;
            }
            ChannelMsg::Close => return false,
            // Eof can precede ExitStatus, so keep draining.
            _ => {}
        }
        true
    }

    /// A reader that went away just stops receiving.
    async fn forward(pipe: &mut Option<DuplexStream>, data: &[u8]) {
        if let Some(tx) = pipe {
            if tx.write_all(data).await.is_err() {
                *pipe = None;
            }
        }
    }

    fn queue_stderr(&mut self, data: &[u8]) {
        let Some(tx) = &self.stderr else {
            return;
        };
        match tx.try_send(data.to_vec()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(bytes = data.len(), "stderr reader lagging, output dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => self.stderr = None,
        }
    }
}

/// Writer task feeding `pipe` from a bounded queue. The pipe closes once the
/// sender is dropped and the queue is drained.
fn stderr_feed(mut pipe: DuplexStream) -> mpsc::Sender<Vec<u8>> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(STDERR_BACKLOG);
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if pipe.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });
    tx
}

async fn pump(mut read_half: ChannelReadHalf, mut router: Router, finished: CancellationToken) {
    while let Some(msg) = read_half.wait().await {
        if !router.route(msg).await {
            break;
        }
    }
    debug!("SSH channel finished");
    // Dropping the routes ends the readers' streams.
    drop(router);
    finished.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::CryptoVec;
    use tokio::io::AsyncReadExt;

    fn options(target: &str) -> SessionOptions {
        SessionOptions::new(descriptor::parse(target).unwrap())
    }

    #[test]
    fn test_requires_user() {
        let err = SessionTransport::new(options("host")).err().unwrap();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[test]
    fn test_mode_follows_subsystem() {
        let shell = SessionTransport::new(options("u@host pwsh")).unwrap();
        assert_eq!(shell.mode(), SessionMode::Shell);
        let exec = SessionTransport::new(options("u@host")).unwrap();
        assert_eq!(exec.mode(), SessionMode::Exec);
    }

    #[test]
    fn test_host_keys_checked_by_default() {
        let t = SessionTransport::new(options("u@host")).unwrap();
        assert_eq!(t.host_key_policy(), HostKeyPolicy::Strict);
        let t = SessionTransport::new(options("u@host").skip_host_key_check(true)).unwrap();
        assert_eq!(t.host_key_policy(), HostKeyPolicy::AcceptAll);
    }

    #[test]
    fn test_options_debug_redacts_password() {
        let opts = options("u@host").with_password(Secret::new("hunter2"));
        assert!(!format!("{opts:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn test_io_before_open_is_rejected() {
        let t = SessionTransport::new(options("u@host")).unwrap();
        let cancel = CancellationToken::new();
        assert!(matches!(
            t.read_output(&cancel).await,
            Err(TransportError::NotOpen {
                state: TransportState::Created
            })
        ));
        assert!(matches!(
            t.write_input("x", &cancel).await,
            Err(TransportError::NotOpen { .. })
        ));
        assert_eq!(t.state(), TransportState::Created);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_without_open() {
        let t = SessionTransport::new(options("u@host")).unwrap();
        let cancel = CancellationToken::new();
        t.close(&cancel).await.unwrap();
        t.close(&cancel).await.unwrap();
        assert_eq!(t.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_refused_connection_faults() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let opts = options(&format!("u@127.0.0.1:{port}")).with_password(Secret::new("pw"));
        let t = SessionTransport::new(opts).unwrap();
        let err = t.open(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
        assert_eq!(t.state(), TransportState::Faulted);
        assert!(t.secret.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_open_faults() {
        let t = SessionTransport::new(options("u@192.0.2.1")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            t.open(&cancel).await,
            Err(TransportError::Cancelled)
        ));
        assert_eq!(t.state(), TransportState::Faulted);
    }

    fn router(merge_stderr: bool) -> (Router, DuplexStream, DuplexStream) {
        router_with_stderr_pipe(merge_stderr, 1024)
    }

    fn router_with_stderr_pipe(
        merge_stderr: bool,
        stderr_capacity: usize,
    ) -> (Router, DuplexStream, DuplexStream) {
        let (out_tx, out_rx) = tokio::io::duplex(1024);
        let (err_tx, err_rx) = tokio::io::duplex(stderr_capacity);
        let router = Router {
            stdout: Some(out_tx),
            stderr: Some(stderr_feed(err_tx)),
            merge_stderr,
            exit_code: Arc::new(Mutex::new(None)),
        };
        (router, out_rx, err_rx)
    }

    #[tokio::test]
    async fn test_router_separates_streams() {
        let (mut router, mut out, mut err) = router(false);
        assert!(
            router
                .route(ChannelMsg::Data {
                    data: CryptoVec::from_slice(b"out\n")
                })
                .await
        );
        assert!(
            router
                .route(ChannelMsg::ExtendedData {
                    data: CryptoVec::from_slice(b"err\n"),
                    ext: 1
                })
                .await
        );
        assert!(router.route(ChannelMsg::Eof).await);
        assert!(router.route(ChannelMsg::ExitStatus { exit_status: 3 }).await);
        assert!(!router.route(ChannelMsg::Close).await);

        let exit_code = Arc::clone(&router.exit_code);
        drop(router);

        let mut buf = String::new();
        out.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "out\n");
        buf.clear();
        err.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "err\n");
        assert_eq!(*exit_code.lock().unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_router_merges_stderr_in_shell_mode() {
        let (mut router, mut out, mut err) = router(true);
        router
            .route(ChannelMsg::ExtendedData {
                data: CryptoVec::from_slice(b"err\n"),
                ext: 1,
            })
            .await;
        drop(router);

        let mut buf = String::new();
        out.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "err\n");
        buf.clear();
        err.read_to_string(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_router_survives_dropped_reader() {
        let (mut router, out, _err) = router(false);
        drop(out);
        assert!(
            router
                .route(ChannelMsg::Data {
                    data: CryptoVec::from_slice(b"lost\n")
                })
                .await
        );
        assert!(router.stdout.is_none());
    }

    #[tokio::test]
    async fn test_unread_stderr_does_not_stall_stdout() {
        let (mut router, mut out, _err) = router_with_stderr_pipe(false, 16);
        let flood = async {
            for _ in 0..(STDERR_BACKLOG * 4) {
                router
                    .route(ChannelMsg::ExtendedData {
                        data: CryptoVec::from_slice(b"noise noise noise\n"),
                        ext: 1,
                    })
                    .await;
            }
            router
                .route(ChannelMsg::Data {
                    data: CryptoVec::from_slice(b"out\n"),
                })
                .await;
        };
        tokio::time::timeout(Duration::from_secs(5), flood)
            .await
            .expect("stdout blocked behind stderr");
        assert!(router.stderr.is_some());
        drop(router);

        let mut buf = String::new();
        out.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "out\n");
    }
}
